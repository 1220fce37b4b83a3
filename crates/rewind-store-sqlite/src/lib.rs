use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rewind_core::{
    ArchiveEntry, EpochId, PackageHistory, PackageIndex, PackageRecord, Partition, ReconciledSet,
    Release, ReleaseArchive, ResolvedPackage, SnapshotDate, ValidityRange,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS releases (
  epoch TEXT PRIMARY KEY,
  start_date TEXT NOT NULL,
  end_date TEXT,
  archived INTEGER NOT NULL CHECK (archived IN (0, 1)),
  CHECK (end_date IS NULL OR end_date > start_date)
);

CREATE TABLE IF NOT EXISTS snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  partition TEXT NOT NULL CHECK (partition IN ('cran','software','annotation','experiment')),
  epoch TEXT NOT NULL DEFAULT '',
  snapshot_date TEXT NOT NULL,
  source_url TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  record_count INTEGER NOT NULL CHECK (record_count >= 0),
  imported_at TEXT NOT NULL,
  UNIQUE(partition, epoch, snapshot_date)
);

CREATE TABLE IF NOT EXISTS package_records (
  snapshot_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  record_json TEXT NOT NULL,
  PRIMARY KEY (snapshot_id, name),
  FOREIGN KEY (snapshot_id) REFERENCES snapshots(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS archive_entries (
  epoch TEXT NOT NULL,
  partition TEXT NOT NULL CHECK (partition IN ('software','annotation','experiment')),
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  superseded_on TEXT NOT NULL,
  record_json TEXT NOT NULL,
  PRIMARY KEY (epoch, partition, name, version),
  FOREIGN KEY (epoch) REFERENCES releases(epoch)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_partition_date ON snapshots(partition, snapshot_date);
CREATE INDEX IF NOT EXISTS idx_package_records_name ON package_records(name);
CREATE INDEX IF NOT EXISTS idx_archive_entries_name ON archive_entries(name);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS content_hashes (
  url TEXT PRIMARY KEY,
  sha256 TEXT NOT NULL CHECK (length(sha256) = 64),
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciled_sets (
  archive_date TEXT PRIMARY KEY,
  snapshot_date TEXT NOT NULL,
  epoch TEXT NOT NULL,
  package_count INTEGER NOT NULL CHECK (package_count >= 0),
  set_json TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (epoch) REFERENCES releases(epoch)
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRelease {
    pub epoch: EpochId,
    pub validity: ValidityRange,
    /// Whether superseded versions of this release are kept in an archive.
    pub archived: bool,
}

/// Where a snapshot came from; `epoch` is set for secondary partitions only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSource {
    pub partition: Partition,
    pub epoch: Option<EpochId>,
    pub date: SnapshotDate,
    pub source_url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub id: i64,
    pub partition: Partition,
    pub epoch: Option<EpochId>,
    pub date: SnapshotDate,
    pub source_url: String,
    pub sha256: String,
    pub record_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetSummary {
    pub archive_date: SnapshotDate,
    pub snapshot_date: SnapshotDate,
    pub epoch: EpochId,
    pub package_count: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub archive_date: SnapshotDate,
    pub snapshot_date: SnapshotDate,
    pub epoch: EpochId,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Serialize)]
struct BatchRow<'a> {
    batch: usize,
    packages: &'a [String],
}

impl SqliteStore {
    /// Open a SQLite-backed registry store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version < target {
                let tx = self.conn.transaction().context("failed to start migration transaction")?;
                tx.execute_batch(sql).with_context(|| format!("failed to apply migration {target}"))?;
                record_schema_version(&tx, target)?;
                tx.commit().with_context(|| format!("failed to commit migration {target}"))?;
                tracing::info!(version = target, "applied schema migration");
                version = target;
            }
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or update one release row.
    ///
    /// # Errors
    /// Returns an error when the row violates the release constraints or cannot be written.
    pub fn save_release(&mut self, release: &StoredRelease) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO releases(epoch, start_date, end_date, archived) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(epoch) DO UPDATE SET
                   start_date = excluded.start_date,
                   end_date = excluded.end_date,
                   archived = excluded.archived",
                params![
                    release.epoch.as_str(),
                    release.validity.start.to_string(),
                    release.validity.end.map(|end| end.to_string()),
                    i64::from(release.archived),
                ],
            )
            .with_context(|| format!("failed to persist release {}", release.epoch))?;
        Ok(())
    }

    /// List releases in epoch order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or contain invalid dates.
    pub fn list_releases(&self) -> Result<Vec<StoredRelease>> {
        let mut stmt = self
            .conn
            .prepare("SELECT epoch, start_date, end_date, archived FROM releases")
            .context("failed to prepare release listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut releases = Vec::new();
        for row in rows {
            let (epoch, start, end, archived) = row?;
            releases.push(StoredRelease {
                epoch: EpochId::new(epoch),
                validity: ValidityRange {
                    start: parse_date(&start)?,
                    end: end.as_deref().map(parse_date).transpose()?,
                },
                archived: archived == 1,
            });
        }
        releases.sort_by(|lhs, rhs| lhs.epoch.cmp(&rhs.epoch));
        Ok(releases)
    }

    /// The release whose validity range contains `date`.
    ///
    /// # Errors
    /// Returns an error when the release table cannot be read.
    pub fn release_covering(&self, date: SnapshotDate) -> Result<Option<StoredRelease>> {
        Ok(self.list_releases()?.into_iter().find(|release| release.validity.contains(date)))
    }

    /// Replace the snapshot identified by `source` with `index`, atomically.
    ///
    /// # Errors
    /// Returns an error when the source is inconsistent or any write fails; nothing is stored then.
    pub fn save_snapshot(&mut self, source: &SnapshotSource, index: &PackageIndex) -> Result<i64> {
        if source.partition.is_secondary() != source.epoch.is_some() {
            return Err(anyhow!(
                "snapshot of partition {} must {}carry an epoch",
                source.partition,
                if source.partition.is_secondary() { "" } else { "not " }
            ));
        }

        let epoch = source.epoch.as_ref().map_or("", EpochId::as_str);
        let date = source.date.to_string();
        let tx = self.conn.transaction().context("failed to start snapshot transaction")?;
        tx.execute(
            "DELETE FROM snapshots WHERE partition = ?1 AND epoch = ?2 AND snapshot_date = ?3",
            params![source.partition.as_str(), epoch, date],
        )
        .context("failed to replace existing snapshot")?;
        tx.execute(
            "INSERT INTO snapshots(partition, epoch, snapshot_date, source_url, sha256, record_count, imported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source.partition.as_str(),
                epoch,
                date,
                source.source_url,
                source.sha256,
                i64::try_from(index.len()).context("snapshot record count overflows i64")?,
                now_rfc3339()?,
            ],
        )
        .context("failed to persist snapshot")?;
        let snapshot_id = tx.last_insert_rowid();
        insert_records(&tx, snapshot_id, index)?;
        tx.commit().context("failed to commit snapshot transaction")?;

        tracing::info!(
            partition = %source.partition,
            epoch,
            date = %source.date,
            records = index.len(),
            "stored snapshot"
        );
        Ok(snapshot_id)
    }

    /// List stored snapshots, optionally restricted to one partition, by date then partition.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_snapshots(&self, partition: Option<Partition>) -> Result<Vec<SnapshotSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, partition, epoch, snapshot_date, source_url, sha256, record_count
                 FROM snapshots
                 WHERE ?1 IS NULL OR partition = ?1
                 ORDER BY snapshot_date ASC, partition ASC, epoch ASC",
            )
            .context("failed to prepare snapshot listing")?;
        let rows = stmt.query_map(params![partition.map(Partition::as_str)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (id, partition, epoch, date, source_url, sha256, record_count) = row?;
            snapshots.push(SnapshotSummary {
                id,
                partition: parse_partition(&partition)?,
                epoch: (!epoch.is_empty()).then(|| EpochId::new(epoch)),
                date: parse_date(&date)?,
                source_url,
                sha256,
                record_count: usize::try_from(record_count).context("negative record count")?,
            });
        }
        Ok(snapshots)
    }

    /// Sorted dates of every stored primary snapshot.
    ///
    /// # Errors
    /// Returns an error when the snapshot table cannot be read.
    pub fn primary_snapshot_dates(&self) -> Result<Vec<SnapshotDate>> {
        Ok(self.list_snapshots(Some(Partition::Cran))?.into_iter().map(|snapshot| snapshot.date).collect())
    }

    /// Load the records of one stored snapshot.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read or decoded.
    pub fn load_snapshot(
        &self,
        partition: Partition,
        epoch: Option<&EpochId>,
        date: SnapshotDate,
    ) -> Result<Option<PackageIndex>> {
        let snapshot_id = self
            .conn
            .query_row(
                "SELECT id FROM snapshots WHERE partition = ?1 AND epoch = ?2 AND snapshot_date = ?3",
                params![partition.as_str(), epoch.map_or("", EpochId::as_str), date.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up snapshot")?;

        snapshot_id.map(|id| self.load_records(id)).transpose()
    }

    /// Most recent stored index of a secondary partition for `epoch`.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read or decoded.
    pub fn latest_secondary_index(&self, epoch: &EpochId, partition: Partition) -> Result<Option<PackageIndex>> {
        let snapshot_id = self
            .conn
            .query_row(
                "SELECT id FROM snapshots WHERE partition = ?1 AND epoch = ?2
                 ORDER BY snapshot_date DESC LIMIT 1",
                params![partition.as_str(), epoch.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up secondary index")?;

        snapshot_id.map(|id| self.load_records(id)).transpose()
    }

    /// Store archive entries of one release partition; existing entries are replaced.
    ///
    /// # Errors
    /// Returns an error for the primary partition, an unknown release, or a failed write.
    pub fn save_archive_entries(
        &mut self,
        epoch: &EpochId,
        partition: Partition,
        entries: &[ArchiveEntry],
    ) -> Result<usize> {
        if !partition.is_secondary() {
            return Err(anyhow!("partition {partition} has no release archive"));
        }

        let tx = self.conn.transaction().context("failed to start archive transaction")?;
        for entry in entries {
            tx.execute(
                "INSERT OR REPLACE INTO archive_entries(epoch, partition, name, version, superseded_on, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    epoch.as_str(),
                    partition.as_str(),
                    entry.record.name,
                    entry.record.version,
                    entry.superseded_on.to_string(),
                    serde_json::to_string(&entry.record).context("failed to serialize archived record")?,
                ],
            )
            .with_context(|| {
                format!("failed to persist archive entry {} {}", entry.record.name, entry.record.version)
            })?;
        }
        tx.commit().context("failed to commit archive transaction")?;
        tracing::info!(%epoch, %partition, entries = entries.len(), "stored archive entries");
        Ok(entries.len())
    }

    /// Load every archive entry of `epoch`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_archive(&self, epoch: &EpochId) -> Result<ReleaseArchive> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT partition, superseded_on, record_json FROM archive_entries
                 WHERE epoch = ?1 ORDER BY partition, name, superseded_on",
            )
            .context("failed to prepare archive listing")?;
        let rows = stmt.query_map(params![epoch.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut archive = ReleaseArchive::new();
        for row in rows {
            let (partition, superseded_on, record_json) = row?;
            let record: PackageRecord =
                serde_json::from_str(&record_json).context("failed to deserialize archived record")?;
            archive.insert(
                parse_partition(&partition)?,
                ArchiveEntry { record, superseded_on: parse_date(&superseded_on)? },
            );
        }
        Ok(archive)
    }

    /// Assemble a [`Release`] from its row, the latest stored secondary indices and its archive.
    ///
    /// # Errors
    /// Returns an error when the release is unknown or stored rows cannot be decoded.
    pub fn load_release(&self, epoch: &EpochId) -> Result<Release> {
        let stored = self
            .list_releases()?
            .into_iter()
            .find(|release| &release.epoch == epoch)
            .ok_or_else(|| anyhow!("unknown release {epoch}"))?;

        let mut release = Release::new(stored.epoch.clone(), stored.validity);
        for partition in Partition::SECONDARY {
            if let Some(index) = self.latest_secondary_index(epoch, partition)? {
                release = release.with_index(partition, index)?;
            }
        }
        if stored.archived {
            release = release.with_archive(self.load_archive(epoch)?);
        }
        Ok(release)
    }

    /// History of every primary snapshot and every release archive, for back-filling.
    ///
    /// # Errors
    /// Returns an error when stored rows cannot be read or decoded.
    pub fn build_history(&self) -> Result<PackageHistory> {
        let mut history = PackageHistory::new();
        for snapshot in self.list_snapshots(Some(Partition::Cran))? {
            history.record_index(snapshot.date, &self.load_records(snapshot.id)?);
        }
        for release in self.list_releases()? {
            history.record_archive(&self.load_archive(&release.epoch)?);
        }
        tracing::debug!(names = history.names(), "built package history");
        Ok(history)
    }

    /// Remember the content hash of a fetched archive.
    ///
    /// # Errors
    /// Returns an error when the hash is not a SHA-256 hex digest or cannot be stored.
    pub fn record_hash(&mut self, url: &str, sha256: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO content_hashes(url, sha256, recorded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(url) DO UPDATE SET sha256 = excluded.sha256, recorded_at = excluded.recorded_at",
                params![url, sha256, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record content hash for {url}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the hash table cannot be read.
    pub fn known_hash(&self, url: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT sha256 FROM content_hashes WHERE url = ?1", params![url], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to look up content hash")
    }

    /// Persist a reconciled set, replacing any earlier set of the same archive date.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn save_reconciled_set(&mut self, set: &ReconciledSet) -> Result<String> {
        let set_json = serde_json::to_string(set).context("failed to serialize reconciled set")?;
        let sha256 = sha256_hex(set_json.as_bytes());
        self.conn
            .execute(
                "INSERT OR REPLACE INTO reconciled_sets(archive_date, snapshot_date, epoch, package_count, set_json, sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    set.archive_date.to_string(),
                    set.snapshot_date.to_string(),
                    set.epoch.as_str(),
                    i64::try_from(set.packages.len()).context("package count overflows i64")?,
                    set_json,
                    sha256,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to persist reconciled set for {}", set.archive_date))?;
        Ok(sha256)
    }

    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn load_reconciled_set(&self, archive_date: SnapshotDate) -> Result<Option<ReconciledSet>> {
        let value = self
            .conn
            .query_row(
                "SELECT set_json FROM reconciled_sets WHERE archive_date = ?1",
                params![archive_date.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up reconciled set")?;

        match value {
            Some(json) => {
                let set = serde_json::from_str(&json).context("failed to deserialize stored reconciled set")?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_reconciled_sets(&self) -> Result<Vec<SetSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT archive_date, snapshot_date, epoch, package_count, sha256
                 FROM reconciled_sets ORDER BY archive_date",
            )
            .context("failed to prepare reconciled set listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut sets = Vec::new();
        for row in rows {
            let (archive_date, snapshot_date, epoch, package_count, sha256) = row?;
            sets.push(SetSummary {
                archive_date: parse_date(&archive_date)?,
                snapshot_date: parse_date(&snapshot_date)?,
                epoch: EpochId::new(epoch),
                package_count: usize::try_from(package_count).context("negative package count")?,
                sha256,
            });
        }
        Ok(sets)
    }

    /// Export a stored set as one NDJSON file per partition plus batches, notes and a manifest.
    ///
    /// # Errors
    /// Returns an error when the set is missing or export files cannot be written.
    pub fn export_set(&self, archive_date: SnapshotDate, out_dir: &Path) -> Result<ExportManifest> {
        let set = self
            .load_reconciled_set(archive_date)?
            .ok_or_else(|| anyhow!("no reconciled set stored for {archive_date}"))?;

        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut files = Vec::new();
        for partition in Partition::ALL {
            let packages: Vec<&ResolvedPackage> = set.partition_packages(partition);
            let file_name = format!("{partition}.ndjson");
            files.push(write_export_file(out_dir, &file_name, &packages)?);
        }

        let batches: Vec<BatchRow<'_>> = set
            .batches
            .iter()
            .enumerate()
            .map(|(batch, packages)| BatchRow { batch, packages })
            .collect();
        files.push(write_export_file(out_dir, "batches.ndjson", &batches)?);
        files.push(write_export_file(out_dir, "notes.ndjson", &set.notes)?);

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            archive_date: set.archive_date,
            snapshot_date: set.snapshot_date,
            epoch: set.epoch.clone(),
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn load_records(&self, snapshot_id: i64) -> Result<PackageIndex> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM package_records WHERE snapshot_id = ?1 ORDER BY name")
            .context("failed to prepare record listing")?;
        let rows = stmt.query_map(params![snapshot_id], |row| row.get::<_, String>(0))?;

        let mut index = PackageIndex::new();
        for row in rows {
            let record: PackageRecord =
                serde_json::from_str(&row?).context("failed to deserialize stored package record")?;
            index.replace(record);
        }
        Ok(index)
    }
}

fn insert_records(tx: &Transaction<'_>, snapshot_id: i64, index: &PackageIndex) -> Result<()> {
    let mut stmt = tx
        .prepare(
            "INSERT INTO package_records(snapshot_id, name, version, record_json) VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare record insert")?;
    for record in index.records() {
        stmt.execute(params![
            snapshot_id,
            record.name,
            record.version,
            serde_json::to_string(record).context("failed to serialize package record")?,
        ])
        .with_context(|| format!("failed to persist record {} {}", record.name, record.version))?;
    }
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_date(raw: &str) -> Result<SnapshotDate> {
    SnapshotDate::parse(raw).with_context(|| format!("invalid stored date: {raw}"))
}

fn parse_partition(raw: &str) -> Result<Partition> {
    Partition::parse(raw).ok_or_else(|| anyhow!("invalid stored partition: {raw}"))
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_export_file<T: Serialize>(out_dir: &Path, file_name: &str, values: &[T]) -> Result<ExportFileDigest> {
    let (sha256, records) = write_ndjson_file(&out_dir.join(file_name), values)?;
    Ok(ExportFileDigest { path: file_name.to_string(), sha256, records })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

/// Known hashes for a batch of URLs; unknown URLs are omitted.
///
/// # Errors
/// Returns an error when the hash table cannot be read.
pub fn known_hashes<'a>(
    store: &SqliteStore,
    urls: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for url in urls {
        if let Some(sha256) = store.known_hash(url)? {
            hashes.insert(url.to_string(), sha256);
        }
    }
    Ok(hashes)
}
