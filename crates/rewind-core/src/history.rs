use std::collections::BTreeMap;

use serde::Serialize;

use crate::index::{choose_record, PackageIndex};
use crate::release::ReleaseArchive;
use crate::{PackageRecord, SnapshotDate};

/// A record together with the last day it was observed in a registry.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct HistoricalRecord {
    pub observed_on: SnapshotDate,
    pub record: PackageRecord,
}

/// Lookup of past package versions, used to back-fill dependencies missing from an index.
pub trait HistorySource {
    fn latest_at_or_before(&self, name: &str, date: SnapshotDate) -> Option<HistoricalRecord>;
}

/// In-memory history built from stored snapshots and release archives.
#[derive(Debug, Clone, Default)]
pub struct PackageHistory {
    series: BTreeMap<String, BTreeMap<SnapshotDate, PackageRecord>>,
}

impl PackageHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, date: SnapshotDate, record: PackageRecord) {
        let observations = self.series.entry(record.name.clone()).or_default();
        let chosen = match observations.remove(&date) {
            Some(existing) => choose_record(existing, record),
            None => record,
        };
        observations.insert(date, chosen);
    }

    pub fn record_index(&mut self, date: SnapshotDate, index: &PackageIndex) {
        for record in index.records() {
            self.record(date, record.clone());
        }
    }

    /// Archived versions were last live the day before their supersession.
    pub fn record_archive(&mut self, archive: &ReleaseArchive) {
        for (_, entry) in archive.entries() {
            let last_live = entry.superseded_on.previous_day().unwrap_or(entry.superseded_on);
            self.record(last_live, entry.record.clone());
        }
    }

    #[must_use]
    pub fn names(&self) -> usize {
        self.series.len()
    }
}

impl HistorySource for PackageHistory {
    fn latest_at_or_before(&self, name: &str, date: SnapshotDate) -> Option<HistoricalRecord> {
        self.series
            .get(name)?
            .range(..=date)
            .next_back()
            .map(|(observed_on, record)| HistoricalRecord { observed_on: *observed_on, record: record.clone() })
    }
}
