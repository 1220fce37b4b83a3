//! Parsing of `PACKAGES` indices and the per-partition record map.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use flate2::read::GzDecoder;

use crate::{compare_versions, PackageRecord, RewindError};

/// Packages shipped with R itself; never fetched from a registry.
pub const BUILTIN_PACKAGES: &[&str] = &[
    "R",
    "base",
    "compiler",
    "datasets",
    "graphics",
    "grDevices",
    "grid",
    "methods",
    "parallel",
    "splines",
    "stats",
    "stats4",
    "tcltk",
    "tools",
    "utils",
];

const DEPENDENCY_FIELDS: [&str; 3] = ["Depends", "Imports", "LinkingTo"];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Name-keyed records of one registry partition at one date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageIndex {
    records: BTreeMap<String, PackageRecord>,
}

impl PackageIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, resolving a same-name conflict with [`choose_record`].
    pub fn insert(&mut self, record: PackageRecord) {
        let chosen = match self.records.remove(&record.name) {
            Some(existing) => choose_record(existing, record),
            None => record,
        };
        self.records.insert(chosen.name.clone(), chosen);
    }

    /// Insert a record unconditionally, returning the one it displaced.
    pub fn replace(&mut self, record: PackageRecord) -> Option<PackageRecord> {
        self.records.insert(record.name.clone(), record)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PackageRecord> {
        self.records.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PackageRecord> {
        self.records.values()
    }

    pub fn remove(&mut self, name: &str) -> Option<PackageRecord> {
        self.records.remove(name)
    }

    /// Drop every record whose source archive is absent from `listing`.
    ///
    /// Returns the names that were dropped, in name order.
    pub fn retain_listed(&mut self, listing: &BTreeSet<String>) -> Vec<String> {
        let mut dropped = Vec::new();
        self.records.retain(|name, record| {
            let keep = listing.contains(&record.tarball_name());
            if !keep {
                dropped.push(name.clone());
            }
            keep
        });
        if !dropped.is_empty() {
            tracing::warn!(
                dropped = dropped.len(),
                "index lists packages whose archives are missing from the directory listing"
            );
        }
        dropped
    }
}

impl FromIterator<PackageRecord> for PackageIndex {
    fn from_iter<T: IntoIterator<Item = PackageRecord>>(iter: T) -> Self {
        let mut index = Self::new();
        for record in iter {
            index.insert(record);
        }
        index
    }
}

/// Pick one of two same-name records.
///
/// Higher version wins. On equal versions the record with more dependencies wins, and a full
/// tie keeps `incoming` (the most recently inserted record).
#[must_use]
pub fn choose_record(existing: PackageRecord, incoming: PackageRecord) -> PackageRecord {
    match compare_versions(&incoming.version, &existing.version) {
        Ordering::Greater => incoming,
        Ordering::Less => existing,
        Ordering::Equal => {
            if existing.dependency_count() > incoming.dependency_count() {
                existing
            } else {
                incoming
            }
        }
    }
}

#[must_use]
pub fn tarball_name(name: &str, version: &str) -> String {
    format!("{name}_{version}.tar.gz")
}

/// Turn raw index bytes into text, transparently gunzipping compressed payloads.
///
/// # Errors
/// Returns [`RewindError::Parse`] when a gzip payload is corrupt or truncated, or when the
/// text is not valid UTF-8.
pub fn decode_index(bytes: &[u8]) -> Result<String, RewindError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text).map_err(|err| {
            RewindError::Parse(format!("corrupt or truncated compressed index: {err}"))
        })?;
        return Ok(text);
    }

    String::from_utf8(bytes.to_vec())
        .map_err(|err| RewindError::Parse(format!("index is not valid UTF-8: {err}")))
}

/// Split DCF text into field maps, one per blank-line separated record.
///
/// # Errors
/// Returns [`RewindError::Parse`] on a line that is neither `Key: value` nor a continuation.
pub fn parse_dcf(text: &str) -> Result<Vec<BTreeMap<String, String>>, RewindError> {
    let mut records = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    let mut last_key: Option<String> = None;

    for (line_number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            last_key = None;
            continue;
        }

        if line.starts_with([' ', '\t']) {
            let Some(key) = &last_key else {
                return Err(RewindError::Parse(format!(
                    "line {} continues a field but no field is open",
                    line_number + 1
                )));
            };
            if let Some(value) = current.get_mut(key) {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(RewindError::Parse(format!(
                "line {} is not a `Key: value` field: {line}",
                line_number + 1
            )));
        };
        let key = key.trim().to_string();
        current.insert(key.clone(), value.trim().to_string());
        last_key = Some(key);
    }

    if !current.is_empty() {
        records.push(current);
    }
    Ok(records)
}

/// Parse a dependency field such as `R (>= 3.5), Rcpp (>= 1.0),\n  methods` into bare names.
#[must_use]
pub fn parse_dependency_field(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .filter_map(|entry| {
            let name = entry.split('(').next().unwrap_or_default().trim();
            if name.is_empty() || BUILTIN_PACKAGES.contains(&name) {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

fn record_from_fields(
    position: usize,
    fields: &BTreeMap<String, String>,
) -> Result<PackageRecord, RewindError> {
    let name = fields
        .get("Package")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RewindError::Parse(format!("record {position} has no Package field")))?;
    let version = fields.get("Version").filter(|value| !value.is_empty()).ok_or_else(|| {
        RewindError::Parse(format!("record {position} ({name}) has no Version field"))
    })?;

    let mut record = PackageRecord::new(name.clone(), version.clone());
    for field in DEPENDENCY_FIELDS {
        if let Some(value) = fields.get(field) {
            record.depends.extend(parse_dependency_field(value));
        }
    }
    record.depends.remove(name);
    if let Some(value) = fields.get("Suggests") {
        record.suggests = parse_dependency_field(value);
    }
    record.needs_compilation =
        fields.get("NeedsCompilation").is_some_and(|value| value.eq_ignore_ascii_case("yes"));
    record.os_type = fields.get("OS_type").cloned();
    record.md5sum = fields.get("MD5sum").cloned();
    Ok(record)
}

/// Parse a `PACKAGES` index into a conflict-resolved [`PackageIndex`].
///
/// # Errors
/// Returns [`RewindError::Parse`] when the text is malformed or any record lacks its
/// `Package`/`Version` fields; no partial index is returned.
pub fn parse_packages(text: &str) -> Result<PackageIndex, RewindError> {
    let mut index = PackageIndex::new();
    for (position, fields) in parse_dcf(text)?.iter().enumerate() {
        index.insert(record_from_fields(position + 1, fields)?);
    }
    tracing::debug!(records = index.len(), "parsed package index");
    Ok(index)
}

/// Collect `*.tar.gz` file names linked from an HTML directory listing.
#[must_use]
pub fn parse_directory_listing(html: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut rest = html;
    while let Some(start) = rest.find("href=\"") {
        rest = &rest[start + 6..];
        let Some(end) = rest.find('"') else {
            break;
        };
        let target = &rest[..end];
        let file = target.rsplit('/').next().unwrap_or(target);
        if file.ends_with(".tar.gz") {
            names.insert(file.to_string());
        }
        rest = &rest[end..];
    }
    names
}
