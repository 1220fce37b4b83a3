use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::Date;

pub mod align;
pub mod assemble;
pub mod history;
pub mod index;
pub mod ledger;
pub mod overrides;
pub mod release;
pub mod version;

pub use align::{align_to_snapshot, DateAlignment, UnalignedEntry};
pub use assemble::{assemble, AssemblyInput, ReconciledSet, ResolvedPackage};
pub use history::{HistoricalRecord, HistorySource, PackageHistory};
pub use index::{decode_index, parse_directory_listing, parse_packages, PackageIndex};
pub use ledger::{BaseMode, FlatTable, Ledger, LedgerKey, LedgerShape, ListTable, NestedKey, NestedTable};
pub use overrides::{
    EventConfig, OverrideConfig, OverrideRegistry, OverrideRegistryBuilder, PackageOverrides, ResolvedOverrides,
    TransformConfig,
};
pub use release::{ArchiveEntry, Release, ReleaseArchive};
pub use version::compare_versions;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RewindError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("registry data error: {0}")]
    Registry(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// A calendar day in zero-padded ISO form (`YYYY-MM-DD`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnapshotDate(pub Date);

impl SnapshotDate {
    /// Parse a `YYYY-MM-DD` date.
    ///
    /// # Errors
    /// Returns [`RewindError::Parse`] when the input is not a valid zero-padded ISO date.
    pub fn parse(value: &str) -> Result<Self, RewindError> {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        Date::parse(value.trim(), format)
            .map(Self)
            .map_err(|err| RewindError::Parse(format!("invalid date `{value}`: {err}")))
    }

    #[must_use]
    pub fn previous_day(self) -> Option<Self> {
        self.0.previous_day().map(Self)
    }
}

impl Display for SnapshotDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.0.year(), u8::from(self.0.month()), self.0.day())
    }
}

impl FromStr for SnapshotDate {
    type Err = RewindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for SnapshotDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnapshotDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Release identifier of the secondary registry, e.g. `3.13`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct EpochId(pub String);

impl EpochId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for EpochId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for EpochId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for EpochId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open validity range `[start, end)` of one release; `end` is open for the current release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidityRange {
    pub start: SnapshotDate,
    pub end: Option<SnapshotDate>,
}

impl ValidityRange {
    #[must_use]
    pub fn contains(&self, date: SnapshotDate) -> bool {
        date >= self.start && self.end.map_or(true, |end| date < end)
    }
}

impl Display for ValidityRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, open)", self.start),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Cran,
    Software,
    Annotation,
    Experiment,
}

impl Partition {
    pub const ALL: [Self; 4] = [Self::Cran, Self::Software, Self::Annotation, Self::Experiment];
    pub const SECONDARY: [Self; 3] = [Self::Software, Self::Annotation, Self::Experiment];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cran => "cran",
            Self::Software => "software",
            Self::Annotation => "annotation",
            Self::Experiment => "experiment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cran" => Some(Self::Cran),
            "software" => Some(Self::Software),
            "annotation" => Some(Self::Annotation),
            "experiment" => Some(Self::Experiment),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_secondary(self) -> bool {
        !matches!(self, Self::Cran)
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed index record, before any override is applied.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depends: BTreeSet<String>,
    #[serde(default)]
    pub suggests: BTreeSet<String>,
    #[serde(default)]
    pub needs_compilation: bool,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub md5sum: Option<String>,
}

impl PackageRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            depends: BTreeSet::new(),
            suggests: BTreeSet::new(),
            needs_compilation: false,
            os_type: None,
            md5sum: None,
        }
    }

    #[must_use]
    pub fn with_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(depends.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.depends.len()
    }

    #[must_use]
    pub fn tarball_name(&self) -> String {
        index::tarball_name(&self.name, &self.version)
    }
}
