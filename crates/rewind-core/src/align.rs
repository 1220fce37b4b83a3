use std::collections::BTreeSet;

use serde::Serialize;

use crate::{Partition, SnapshotDate};

/// Earliest available snapshot date at or after `requested`.
///
/// `available` must be sorted ascending.
#[must_use]
pub fn align_to_snapshot(requested: SnapshotDate, available: &[SnapshotDate]) -> Option<SnapshotDate> {
    let position = available.partition_point(|date| *date < requested);
    available.get(position).copied()
}

/// A request with no snapshot at or after it.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct UnalignedEntry {
    pub partition: Option<Partition>,
    pub name: String,
    pub version: Option<String>,
    pub requested: SnapshotDate,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct DateAlignment {
    pub required: BTreeSet<SnapshotDate>,
    pub unaligned: Vec<UnalignedEntry>,
}

impl DateAlignment {
    pub fn push_unaligned(&mut self, entry: UnalignedEntry) {
        tracing::warn!(
            name = %entry.name,
            version = entry.version.as_deref().unwrap_or("-"),
            requested = %entry.requested,
            "no primary snapshot at or after requested date"
        );
        self.unaligned.push(entry);
    }

    pub fn merge(&mut self, other: Self) {
        self.required.extend(other.required);
        self.unaligned.extend(other.unaligned);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn date(value: &str) -> SnapshotDate {
        match SnapshotDate::parse(value) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date {value}: {err}"),
        }
    }

    #[test]
    fn request_between_snapshots_aligns_to_the_later_one() {
        let available = [date("2020-01-01"), date("2020-01-05")];
        assert_eq!(align_to_snapshot(date("2020-01-03"), &available), Some(date("2020-01-05")));
        assert_eq!(align_to_snapshot(date("2020-01-01"), &available), Some(date("2020-01-01")));
        assert_eq!(align_to_snapshot(date("2019-12-01"), &available), Some(date("2020-01-01")));
        assert_eq!(align_to_snapshot(date("2020-01-06"), &available), None);
        assert_eq!(align_to_snapshot(date("2020-01-06"), &[]), None);
    }

    proptest! {
        #[test]
        fn aligned_date_is_the_first_available_at_or_after(
            offsets in proptest::collection::btree_set(0_i64..400, 0..20),
            request in 0_i64..420,
        ) {
            let base = date("2020-01-01");
            let available: Vec<SnapshotDate> = offsets
                .iter()
                .map(|offset| SnapshotDate(base.0 + time::Duration::days(*offset)))
                .collect();
            let requested = SnapshotDate(base.0 + time::Duration::days(request));
            let expected = available.iter().copied().find(|date| *date >= requested);
            prop_assert_eq!(align_to_snapshot(requested, &available), expected);
        }
    }
}
