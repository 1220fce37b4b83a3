use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rewind_core::{
    align_to_snapshot, assemble, decode_index, parse_directory_listing, parse_packages, ArchiveEntry,
    AssemblyInput, DateAlignment, EpochId, OverrideRegistry, PackageHistory, Partition, ReconciledSet,
    SnapshotDate,
};
use rewind_store_sqlite::{
    ExportManifest, IntegrityReport, SchemaStatus, SetSummary, SnapshotSource, SnapshotSummary, SqliteStore,
    StoredRelease,
};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod fetch;

pub use config::{expand_template, PrimaryConfig, ReleaseConfig, RewindConfig, SecondaryConfig};
pub use fetch::{content_hash, FetchService, HttpFetcher, StaticFetcher};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Identity of one snapshot: the primary partition at a date, or a secondary partition of an
/// epoch at a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotTarget {
    pub partition: Partition,
    pub epoch: Option<EpochId>,
    pub date: SnapshotDate,
}

impl SnapshotTarget {
    #[must_use]
    pub fn primary(date: SnapshotDate) -> Self {
        Self { partition: Partition::Cran, epoch: None, date }
    }

    #[must_use]
    pub fn secondary(partition: Partition, epoch: EpochId, date: SnapshotDate) -> Self {
        Self { partition, epoch: Some(epoch), date }
    }

    fn validate(&self) -> Result<()> {
        match (self.partition.is_secondary(), &self.epoch) {
            (true, None) => Err(anyhow!("partition {} requires an epoch", self.partition)),
            (false, Some(epoch)) => {
                Err(anyhow!("partition {} is not released per epoch (got {epoch})", self.partition))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportOutcome {
    pub snapshot_id: i64,
    pub partition: Partition,
    pub epoch: Option<EpochId>,
    pub date: SnapshotDate,
    pub source_url: String,
    pub sha256: String,
    pub record_count: usize,
    /// Records dropped because their archive was missing from the directory listing.
    pub dropped_unlisted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OverridesCheck {
    pub path: Option<String>,
    pub entry_count: usize,
    pub tables: BTreeMap<&'static str, usize>,
}

/// One date to reconcile; without `snapshot_date` the earliest stored primary snapshot at or
/// after `archive_date` is used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub archive_date: SnapshotDate,
    pub snapshot_date: Option<SnapshotDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub archive_date: SnapshotDate,
    pub set: Option<SetSummary>,
    pub error: Option<String>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashFetchOutcome {
    pub archive_date: SnapshotDate,
    pub fetched: usize,
    pub already_known: usize,
    pub failures: Vec<HashFailure>,
    /// Digest of the stored set after hashes were attached.
    pub set_sha256: String,
}

pub struct RewindApi {
    db_path: PathBuf,
    config: RewindConfig,
}

impl RewindApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: RewindConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the integrity probes cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Store every release of the config's release table.
    ///
    /// # Errors
    /// Returns an error when a release row cannot be written.
    pub fn sync_releases(&self) -> Result<Vec<StoredRelease>> {
        let mut store = self.open_migrated()?;
        for release in &self.config.releases {
            store.save_release(&StoredRelease {
                epoch: release.epoch.clone(),
                validity: release.validity(),
                archived: release.archived,
            })?;
        }
        tracing::info!(releases = self.config.releases.len(), "synced releases from config");
        store.list_releases()
    }

    /// # Errors
    /// Returns an error when the release range is empty or the row cannot be written.
    pub fn add_release(&self, release: StoredRelease) -> Result<StoredRelease> {
        if release.validity.end.is_some_and(|end| end <= release.validity.start) {
            return Err(anyhow!("release {} ends before it starts", release.epoch));
        }
        let mut store = self.open_migrated()?;
        store.save_release(&release)?;
        Ok(release)
    }

    /// # Errors
    /// Returns an error when the release table cannot be read.
    pub fn list_releases(&self) -> Result<Vec<StoredRelease>> {
        let store = self.open_migrated()?;
        store.list_releases()
    }

    /// Import an index file, optionally cross-checked against a saved directory listing.
    ///
    /// # Errors
    /// Returns an error when a file cannot be read, the index is corrupt, or the write fails.
    pub fn import_snapshot(
        &self,
        target: &SnapshotTarget,
        index_path: &Path,
        listing_path: Option<&Path>,
        source_url: Option<String>,
    ) -> Result<ImportOutcome> {
        target.validate()?;
        let bytes = fs::read(index_path)
            .with_context(|| format!("failed to read index file {}", index_path.display()))?;
        let listing = listing_path
            .map(|path| {
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read listing file {}", path.display()))
                    .map(|html| parse_directory_listing(&html))
            })
            .transpose()?;
        let source_url = source_url.unwrap_or_else(|| format!("file://{}", index_path.display()));
        self.store_snapshot(target, source_url, &bytes, listing.as_ref())
    }

    /// Fetch a snapshot from the configured registry URLs. Primary snapshots are cross-checked
    /// against the directory listing when `cross_check` is set.
    ///
    /// # Errors
    /// Returns an error when a fetch fails, the index is corrupt, or the write fails.
    pub fn fetch_snapshot(
        &self,
        fetcher: &dyn FetchService,
        target: &SnapshotTarget,
        cross_check: bool,
    ) -> Result<ImportOutcome> {
        target.validate()?;
        let url = match &target.epoch {
            Some(epoch) => self.config.secondary_index_url(epoch, target.partition)?,
            None => self.config.primary_index_url(target.date)?,
        };
        let bytes = fetcher.fetch(&url)?;

        let listing = if cross_check && !target.partition.is_secondary() {
            let listing_url = self.config.primary_listing_url(target.date)?;
            let html = fetcher.fetch(&listing_url)?;
            Some(parse_directory_listing(&String::from_utf8_lossy(&html)))
        } else {
            None
        };

        self.store_snapshot(target, url, &bytes, listing.as_ref())
    }

    fn store_snapshot(
        &self,
        target: &SnapshotTarget,
        source_url: String,
        bytes: &[u8],
        listing: Option<&BTreeSet<String>>,
    ) -> Result<ImportOutcome> {
        let text = decode_index(bytes).with_context(|| format!("invalid index from {source_url}"))?;
        let mut index = parse_packages(&text).with_context(|| format!("invalid index from {source_url}"))?;
        let dropped_unlisted = listing.map(|listing| index.retain_listed(listing)).unwrap_or_default();

        let source = SnapshotSource {
            partition: target.partition,
            epoch: target.epoch.clone(),
            date: target.date,
            source_url,
            sha256: content_hash(bytes),
        };
        let mut store = self.open_migrated()?;
        let snapshot_id = store.save_snapshot(&source, &index)?;
        if !dropped_unlisted.is_empty() {
            tracing::info!(snapshot_id, dropped = dropped_unlisted.len(), "cross-check dropped unlisted records");
        }

        Ok(ImportOutcome {
            snapshot_id,
            partition: source.partition,
            epoch: source.epoch,
            date: source.date,
            source_url: source.source_url,
            sha256: source.sha256,
            record_count: index.len(),
            dropped_unlisted,
        })
    }

    /// # Errors
    /// Returns an error when the snapshot table cannot be read.
    pub fn list_snapshots(&self, partition: Option<Partition>) -> Result<Vec<SnapshotSummary>> {
        let store = self.open_migrated()?;
        store.list_snapshots(partition)
    }

    /// Import superseded versions of one release partition from a YAML list of archive entries.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the release is unknown.
    pub fn import_archive(&self, epoch: &EpochId, partition: Partition, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read archive file {}", path.display()))?;
        let entries: Vec<ArchiveEntry> = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid archive file {}", path.display()))?;
        let mut store = self.open_migrated()?;
        store.save_archive_entries(epoch, partition, &entries)
    }

    /// Primary snapshot dates needed to reconcile `epoch`, aligned against `available` (one date
    /// per line) or the stored primary snapshots.
    ///
    /// # Errors
    /// Returns an error when the release is unknown or the date list cannot be read.
    pub fn required_dates(&self, epoch: &EpochId, available: Option<&Path>) -> Result<DateAlignment> {
        let store = self.open_migrated()?;
        let dates = match available {
            Some(path) => read_date_list(path)?,
            None => store.primary_snapshot_dates()?,
        };
        let release = store.load_release(epoch)?;
        Ok(release.required_primary_dates(&dates))
    }

    /// Load and validate the configured overrides file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn check_overrides(&self) -> Result<OverridesCheck> {
        let registry = self.config.load_overrides()?;
        Ok(OverridesCheck {
            path: self.config.overrides_path().map(|path| path.display().to_string()),
            entry_count: registry.entry_count(),
            tables: registry.summary(),
        })
    }

    /// Reconcile every requested date independently. A failing date is reported in its outcome
    /// and leaves previously stored sets untouched.
    ///
    /// # Errors
    /// Returns an error when the overrides, the history or the snapshot list cannot be loaded.
    pub fn reconcile(&self, requests: &[ReconcileRequest]) -> Result<Vec<ReconcileOutcome>> {
        let overrides = self.config.load_overrides()?;
        let mut store = self.open_migrated()?;
        let history = store.build_history()?;
        let available = store.primary_snapshot_dates()?;

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = match self.reconcile_one(&mut store, &history, &overrides, &available, *request) {
                Ok(set) => ReconcileOutcome { archive_date: request.archive_date, set: Some(set), error: None },
                Err(err) => {
                    let error = format!("{err:#}");
                    tracing::warn!(archive_date = %request.archive_date, error = %error, "reconcile failed");
                    ReconcileOutcome { archive_date: request.archive_date, set: None, error: Some(error) }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn reconcile_one(
        &self,
        store: &mut SqliteStore,
        history: &PackageHistory,
        overrides: &OverrideRegistry,
        available: &[SnapshotDate],
        request: ReconcileRequest,
    ) -> Result<SetSummary> {
        let archive_date = request.archive_date;
        let snapshot_date = match request.snapshot_date {
            Some(date) => date,
            None => align_to_snapshot(archive_date, available)
                .ok_or_else(|| anyhow!("no primary snapshot at or after {archive_date}"))?,
        };
        let stored = store
            .release_covering(archive_date)?
            .ok_or_else(|| anyhow!("no release covers {archive_date}"))?;
        let release = store.load_release(&stored.epoch)?;
        let primary = store
            .load_snapshot(Partition::Cran, None, snapshot_date)?
            .ok_or_else(|| anyhow!("no primary snapshot stored for {snapshot_date}"))?;

        let input =
            AssemblyInput::for_release(archive_date, snapshot_date, &release, primary, history, overrides);
        let mut set = assemble(input).with_context(|| format!("failed to reconcile {archive_date}"))?;
        self.attach_origins(store, &mut set)?;

        let sha256 = store.save_reconciled_set(&set)?;
        Ok(SetSummary {
            archive_date: set.archive_date,
            snapshot_date: set.snapshot_date,
            epoch: set.epoch.clone(),
            package_count: set.packages.len(),
            sha256,
        })
    }

    /// Fill in origin URLs from the templates and any content hash already recorded for them.
    fn attach_origins(&self, store: &SqliteStore, set: &mut ReconciledSet) -> Result<()> {
        for package in set.packages.values_mut() {
            let date = package.backfilled_from.unwrap_or(set.snapshot_date);
            let url = self.config.tarball_url(package.partition, &set.epoch, date, &package.name, &package.version)?;
            package.sha256 = store.known_hash(&url)?;
            package.url = Some(url);
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the set table cannot be read.
    pub fn list_sets(&self) -> Result<Vec<SetSummary>> {
        let store = self.open_migrated()?;
        store.list_reconciled_sets()
    }

    /// # Errors
    /// Returns an error when no set is stored for `archive_date` or it cannot be decoded.
    pub fn show_set(&self, archive_date: SnapshotDate) -> Result<ReconciledSet> {
        let store = self.open_migrated()?;
        store
            .load_reconciled_set(archive_date)?
            .ok_or_else(|| anyhow!("no reconciled set stored for {archive_date}"))
    }

    /// # Errors
    /// Returns an error when the set is missing or export files cannot be written.
    pub fn export(&self, archive_date: SnapshotDate, out_dir: &Path) -> Result<ExportManifest> {
        let store = self.open_migrated()?;
        let manifest = store.export_set(archive_date, out_dir)?;
        tracing::info!(%archive_date, files = manifest.files.len(), out_dir = %out_dir.display(), "exported set");
        Ok(manifest)
    }

    /// Download every archive of a stored set that has no known hash, record the hashes and
    /// re-store the set with them attached. Individual download failures are reported, not fatal.
    ///
    /// # Errors
    /// Returns an error when the set is missing or the store cannot be written.
    pub fn fetch_hashes(&self, archive_date: SnapshotDate, fetcher: &dyn FetchService) -> Result<HashFetchOutcome> {
        let mut store = self.open_migrated()?;
        let mut set = store
            .load_reconciled_set(archive_date)?
            .ok_or_else(|| anyhow!("no reconciled set stored for {archive_date}"))?;

        let mut fetched = 0;
        let mut already_known = 0;
        let mut failures = Vec::new();
        for package in set.packages.values_mut() {
            let Some(url) = package.url.clone() else {
                continue;
            };
            if let Some(sha256) = store.known_hash(&url)? {
                package.sha256 = Some(sha256);
                already_known += 1;
                continue;
            }
            match fetcher.fetch(&url) {
                Ok(bytes) => {
                    let sha256 = content_hash(&bytes);
                    store.record_hash(&url, &sha256)?;
                    package.sha256 = Some(sha256);
                    fetched += 1;
                }
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "archive download failed");
                    failures.push(HashFailure { url, error: format!("{err:#}") });
                }
            }
        }

        let set_sha256 = store.save_reconciled_set(&set)?;
        Ok(HashFetchOutcome { archive_date, fetched, already_known, failures, set_sha256 })
    }
}

/// Parse a date list file: one `YYYY-MM-DD` per line, blank lines and `#` comments ignored.
///
/// # Errors
/// Returns an error when the file cannot be read or a line is not a date.
pub fn read_date_list(path: &Path) -> Result<Vec<SnapshotDate>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read date list {}", path.display()))?;
    let mut dates = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| SnapshotDate::parse(line).with_context(|| format!("invalid date list {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    dates.sort();
    dates.dedup();
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rewind_core::ValidityRange;

    use super::*;

    const PRIMARY_INDEX: &str = "Package: zoo
Version: 1.8-9
Depends: R (>= 3.1.0), stats

Package: xts
Version: 0.12.1
Depends: zoo (>= 1.7-12)
NeedsCompilation: yes

Package: ghost
Version: 0.1
";

    const SOFTWARE_INDEX: &str = "Package: limma
Version: 3.48.0

Package: tsbio
Version: 1.0.0
Imports: xts, limma
";

    const CONFIG: &str = r#"
primary:
  index_url: "https://cran.example/{date}/src/contrib/PACKAGES.gz"
  listing_url: "https://cran.example/{date}/src/contrib/"
  tarball_url: "https://cran.example/{date}/src/contrib/{name}_{version}.tar.gz"
releases:
  - epoch: "3.13"
    start: "2021-05-20"
    end: "2021-10-27"
"#;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_nanos());
        std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()))
    }

    fn date(raw: &str) -> Result<SnapshotDate> {
        Ok(SnapshotDate::parse(raw)?)
    }

    fn gzip(text: &str) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        Ok(encoder.finish()?)
    }

    fn fixture_api(dir: &Path, overrides: Option<&str>) -> Result<RewindApi> {
        fs::create_dir_all(dir)?;
        let mut config = RewindConfig::from_yaml_str(CONFIG)?;
        if let Some(raw) = overrides {
            let path = dir.join("overrides.yaml");
            fs::write(&path, raw)?;
            config.overrides = Some(path);
        }
        Ok(RewindApi::new(dir.join("rewind.sqlite3"), config))
    }

    fn seed(api: &RewindApi, dir: &Path) -> Result<()> {
        api.sync_releases()?;
        let primary_path = dir.join("PACKAGES.gz");
        fs::write(&primary_path, gzip(PRIMARY_INDEX)?)?;
        api.import_snapshot(&SnapshotTarget::primary(date("2021-06-02")?), &primary_path, None, None)?;

        let software_path = dir.join("PACKAGES");
        fs::write(&software_path, SOFTWARE_INDEX)?;
        api.import_snapshot(
            &SnapshotTarget::secondary(Partition::Software, EpochId::new("3.13"), date("2021-05-20")?),
            &software_path,
            None,
            None,
        )?;
        Ok(())
    }

    #[test]
    fn migrate_dry_run_then_apply() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-migrate");
        let api = fixture_api(&dir, None)?;

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn reconcile_aligns_snapshot_and_attaches_origin_urls() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-reconcile");
        let api = fixture_api(&dir, None)?;
        seed(&api, &dir)?;

        let outcomes = api.reconcile(&[ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None }])?;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success(), "unexpected failure: {:?}", outcomes[0].error);
        let Some(summary) = &outcomes[0].set else {
            panic!("successful outcome must carry a set summary");
        };
        assert_eq!(summary.snapshot_date, date("2021-06-02")?);
        assert_eq!(summary.epoch, EpochId::new("3.13"));
        assert_eq!(summary.package_count, 5);

        let set = api.show_set(date("2021-06-01")?)?;
        let Some(zoo) = set.packages.get("zoo") else {
            panic!("zoo must be in the set");
        };
        assert_eq!(zoo.url.as_deref(), Some("https://cran.example/2021-06-02/src/contrib/zoo_1.8-9.tar.gz"));
        let Some(tsbio) = set.packages.get("tsbio") else {
            panic!("tsbio must be in the set");
        };
        assert_eq!(
            tsbio.url.as_deref(),
            Some("https://bioconductor.org/packages/3.13/bioc/src/contrib/tsbio_1.0.0.tar.gz")
        );
        assert!(tsbio.depends.contains("xts"));
        Ok(())
    }

    #[test]
    fn failing_date_does_not_abort_other_dates() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-partial");
        let api = fixture_api(&dir, None)?;
        seed(&api, &dir)?;

        let outcomes = api.reconcile(&[
            ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None },
            ReconcileRequest { archive_date: date("2022-01-01")?, snapshot_date: None },
        ])?;
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[1].error.as_deref().is_some_and(|error| error.contains("2022-01-01")));
        assert_eq!(api.list_sets()?.len(), 1);
        Ok(())
    }

    #[test]
    fn exclusions_from_overrides_file_propagate() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-exclusions");
        let overrides = r#"
exclusions:
  - key: "3.13"
    additions:
      zoo: "fails to build"
"#;
        let api = fixture_api(&dir, Some(overrides))?;
        seed(&api, &dir)?;

        let outcomes = api.reconcile(&[ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None }])?;
        assert!(outcomes[0].is_success(), "unexpected failure: {:?}", outcomes[0].error);

        let set = api.show_set(date("2021-06-01")?)?;
        assert!(!set.packages.contains_key("zoo"));
        assert!(!set.packages.contains_key("xts"));
        assert!(!set.packages.contains_key("tsbio"));
        assert!(set.packages.contains_key("limma"));
        assert!(set.notes.iter().any(|note| note.contains("Excluding tsbio because of (indirect) dependency on zoo")));

        let check = api.check_overrides()?;
        assert_eq!(check.entry_count, 1);
        assert_eq!(check.tables.get("exclusions"), Some(&1));
        Ok(())
    }

    #[test]
    fn fetch_snapshot_cross_checks_listing() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-fetch");
        let api = fixture_api(&dir, None)?;
        let fetcher = StaticFetcher::new()
            .with_response("https://cran.example/2021-06-02/src/contrib/PACKAGES.gz", gzip(PRIMARY_INDEX)?)
            .with_response(
                "https://cran.example/2021-06-02/src/contrib/",
                r#"<a href="zoo_1.8-9.tar.gz">zoo</a> <a href="xts_0.12.1.tar.gz">xts</a>"#,
            );

        let outcome = api.fetch_snapshot(&fetcher, &SnapshotTarget::primary(date("2021-06-02")?), true)?;
        assert_eq!(outcome.record_count, 2);
        assert_eq!(outcome.dropped_unlisted, vec!["ghost".to_string()]);
        assert_eq!(outcome.sha256.len(), 64);
        assert_eq!(api.list_snapshots(Some(Partition::Cran))?.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_index_stores_nothing() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-corrupt");
        let api = fixture_api(&dir, None)?;
        let mut truncated = gzip(PRIMARY_INDEX)?;
        truncated.truncate(truncated.len() / 2);
        let fetcher = StaticFetcher::new()
            .with_response("https://cran.example/2021-06-02/src/contrib/PACKAGES.gz", truncated);

        assert!(api.fetch_snapshot(&fetcher, &SnapshotTarget::primary(date("2021-06-02")?), false).is_err());
        assert!(api.list_snapshots(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn secondary_target_requires_epoch() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-target");
        let api = fixture_api(&dir, None)?;
        let target = SnapshotTarget { partition: Partition::Software, epoch: None, date: date("2021-06-02")? };
        assert!(api.fetch_snapshot(&StaticFetcher::new(), &target, false).is_err());
        Ok(())
    }

    #[test]
    fn fetch_hashes_records_and_reuses_digests() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-hashes");
        let api = fixture_api(&dir, None)?;
        seed(&api, &dir)?;
        api.reconcile(&[ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None }])?;

        let zoo_url = "https://cran.example/2021-06-02/src/contrib/zoo_1.8-9.tar.gz";
        let fetcher = StaticFetcher::new().with_response(zoo_url, "zoo tarball");
        let first = api.fetch_hashes(date("2021-06-01")?, &fetcher)?;
        assert_eq!(first.fetched, 1);
        assert_eq!(first.failures.len(), 4);

        let set = api.show_set(date("2021-06-01")?)?;
        let zoo_hash = set.packages.get("zoo").and_then(|package| package.sha256.clone());
        assert_eq!(zoo_hash, Some(content_hash(b"zoo tarball")));

        let second = api.fetch_hashes(date("2021-06-01")?, &fetcher)?;
        assert_eq!(second.fetched, 0);
        assert_eq!(second.already_known, 1);

        // Re-reconciling picks the recorded hash up from the side table.
        api.reconcile(&[ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None }])?;
        let set = api.show_set(date("2021-06-01")?)?;
        assert_eq!(set.packages.get("zoo").and_then(|package| package.sha256.clone()), zoo_hash);
        Ok(())
    }

    #[test]
    fn required_dates_align_archive_supersessions() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-dates");
        let api = fixture_api(&dir, None)?;
        api.add_release(StoredRelease {
            epoch: EpochId::new("3.13"),
            validity: ValidityRange { start: date("2021-05-20")?, end: Some(date("2021-10-27")?) },
            archived: true,
        })?;

        let archive_path = dir.join("archive.yaml");
        fs::write(
            &archive_path,
            r#"
- record:
    name: limma
    version: "3.48.0"
  superseded_on: "2021-06-10"
- record:
    name: limma
    version: "3.48.1"
  superseded_on: "2021-12-01"
"#,
        )?;
        assert_eq!(api.import_archive(&EpochId::new("3.13"), Partition::Software, &archive_path)?, 2);

        let dates_path = dir.join("dates.txt");
        fs::write(&dates_path, "# known snapshots\n2021-05-21\n2021-06-11\n\n2021-05-21\n")?;
        let alignment = api.required_dates(&EpochId::new("3.13"), Some(&dates_path))?;
        assert_eq!(alignment.required.into_iter().collect::<Vec<_>>(), vec![date("2021-05-21")?, date("2021-06-11")?]);
        assert_eq!(alignment.unaligned.len(), 1);
        assert_eq!(alignment.unaligned[0].version.as_deref(), Some("3.48.1"));
        Ok(())
    }

    #[test]
    fn export_writes_manifest() -> Result<()> {
        let dir = unique_temp_dir("rewind-api-export");
        let api = fixture_api(&dir, None)?;
        seed(&api, &dir)?;
        api.reconcile(&[ReconcileRequest { archive_date: date("2021-06-01")?, snapshot_date: None }])?;

        let out_dir = dir.join("export");
        let manifest = api.export(date("2021-06-01")?, &out_dir)?;
        assert!(out_dir.join("manifest.json").exists());
        let cran = manifest.files.iter().find(|file| file.path == "cran.ndjson");
        assert_eq!(cran.map(|file| file.records), Some(3));
        Ok(())
    }
}
