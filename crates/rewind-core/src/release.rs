use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::align::{align_to_snapshot, DateAlignment, UnalignedEntry};
use crate::index::PackageIndex;
use crate::{EpochId, PackageRecord, Partition, RewindError, SnapshotDate, ValidityRange};

/// A superseded version of a secondary package and the day its successor appeared.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArchiveEntry {
    pub record: PackageRecord,
    pub superseded_on: SnapshotDate,
}

/// Superseded versions per partition and name, newest supersession first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseArchive {
    partitions: BTreeMap<Partition, BTreeMap<String, Vec<ArchiveEntry>>>,
}

impl ReleaseArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: Partition, entry: ArchiveEntry) {
        let history = self
            .partitions
            .entry(partition)
            .or_default()
            .entry(entry.record.name.clone())
            .or_default();
        let position = history.partition_point(|existing| existing.superseded_on > entry.superseded_on);
        history.insert(position, entry);
    }

    #[must_use]
    pub fn history(&self, partition: Partition, name: &str) -> &[ArchiveEntry] {
        self.partitions
            .get(&partition)
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Partition, &ArchiveEntry)> {
        self.partitions
            .iter()
            .flat_map(|(partition, names)| names.values().flatten().map(|entry| (*partition, entry)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(BTreeMap::is_empty)
    }
}

/// One secondary release epoch with its current indices and optional archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub epoch: EpochId,
    pub validity: ValidityRange,
    indices: BTreeMap<Partition, PackageIndex>,
    archive: Option<ReleaseArchive>,
}

impl Release {
    #[must_use]
    pub fn new(epoch: EpochId, validity: ValidityRange) -> Self {
        Self { epoch, validity, indices: BTreeMap::new(), archive: None }
    }

    /// # Errors
    /// Returns [`RewindError::Configuration`] for the primary partition, which is not part of a
    /// release.
    pub fn with_index(mut self, partition: Partition, index: PackageIndex) -> Result<Self, RewindError> {
        if !partition.is_secondary() {
            return Err(RewindError::Configuration(format!(
                "release {} cannot carry a `{partition}` index",
                self.epoch
            )));
        }
        self.indices.insert(partition, index);
        Ok(self)
    }

    #[must_use]
    pub fn with_archive(mut self, archive: ReleaseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    #[must_use]
    pub fn index(&self, partition: Partition) -> Option<&PackageIndex> {
        self.indices.get(&partition)
    }

    #[must_use]
    pub fn archive(&self) -> Option<&ReleaseArchive> {
        self.archive.as_ref()
    }

    #[must_use]
    pub fn covers(&self, date: SnapshotDate) -> bool {
        self.validity.contains(date)
    }

    /// The index of `partition` as it stood on `date`.
    ///
    /// Each name takes the archived version with the earliest supersession date after `date`;
    /// names without such an entry keep their current version.
    #[must_use]
    pub fn state_as_of(&self, partition: Partition, date: SnapshotDate) -> PackageIndex {
        let mut state = self.indices.get(&partition).cloned().unwrap_or_default();
        let Some(archive) = &self.archive else {
            return state;
        };

        let names = archive.partitions.get(&partition).into_iter().flat_map(BTreeMap::iter);
        for (name, history) in names {
            // newest first: scan from the oldest end
            let live = history.iter().rev().find(|entry| entry.superseded_on > date);
            if let Some(entry) = live {
                tracing::debug!(%partition, name = %name, version = %entry.record.version, %date, "using archived version");
                state.replace(entry.record.clone());
            }
        }
        state
    }

    /// Primary snapshot dates needed to reconcile this release: the aligned epoch start plus the
    /// aligned date of every archived entry.
    #[must_use]
    pub fn required_primary_dates(&self, available: &[SnapshotDate]) -> DateAlignment {
        let mut alignment = DateAlignment::default();

        match align_to_snapshot(self.validity.start, available) {
            Some(date) => {
                alignment.required.insert(date);
            }
            None => alignment.push_unaligned(UnalignedEntry {
                partition: None,
                name: format!("release {} start", self.epoch),
                version: None,
                requested: self.validity.start,
            }),
        }

        let Some(archive) = &self.archive else {
            return alignment;
        };

        for (partition, entry) in archive.entries() {
            match align_to_snapshot(entry.superseded_on, available) {
                Some(date) => {
                    alignment.required.insert(date);
                }
                None => alignment.push_unaligned(UnalignedEntry {
                    partition: Some(partition),
                    name: entry.record.name.clone(),
                    version: Some(entry.record.version.clone()),
                    requested: entry.superseded_on,
                }),
            }
        }
        alignment
    }
}
