use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rewind_api::{HttpFetcher, ReconcileRequest, RewindApi, RewindConfig, SnapshotTarget};
use rewind_core::{EpochId, Partition, SnapshotDate, ValidityRange};
use rewind_store_sqlite::StoredRelease;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rw")]
#[command(about = "Rewind package registries to a consistent set at past dates")]
struct Cli {
    #[arg(long, default_value = "./rewind.sqlite3")]
    db: PathBuf,

    /// Path to `rewind.yaml`; built-in registry URLs are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Release {
        #[command(subcommand)]
        command: Box<ReleaseCommand>,
    },
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
    Archive {
        #[command(subcommand)]
        command: Box<ArchiveCommand>,
    },
    Overrides {
        #[command(subcommand)]
        command: Box<OverridesCommand>,
    },
    /// Primary snapshot dates needed to reconcile a release.
    Dates(DatesArgs),
    Reconcile(ReconcileArgs),
    Set {
        #[command(subcommand)]
        command: Box<SetCommand>,
    },
    Export(ExportArgs),
    Hashes {
        #[command(subcommand)]
        command: Box<HashesCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ReleaseCommand {
    Add(ReleaseAddArgs),
    List,
    /// Store the release table of the config file.
    Sync,
}

#[derive(Debug, Args)]
struct ReleaseAddArgs {
    #[arg(long)]
    epoch: String,
    #[arg(long)]
    start: SnapshotDate,
    #[arg(long)]
    end: Option<SnapshotDate>,
    #[arg(long)]
    archived: bool,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Import(SnapshotImportArgs),
    Fetch(SnapshotFetchArgs),
    List(SnapshotListArgs),
}

#[derive(Debug, Args)]
struct SnapshotTargetArgs {
    #[arg(long, default_value = "cran", value_parser = parse_partition)]
    partition: Partition,
    /// Required for secondary partitions.
    #[arg(long)]
    epoch: Option<String>,
    #[arg(long)]
    date: SnapshotDate,
}

impl SnapshotTargetArgs {
    fn target(&self) -> SnapshotTarget {
        SnapshotTarget { partition: self.partition, epoch: self.epoch.clone().map(EpochId::new), date: self.date }
    }
}

#[derive(Debug, Args)]
struct SnapshotImportArgs {
    #[command(flatten)]
    target: SnapshotTargetArgs,
    /// `PACKAGES` or `PACKAGES.gz` file.
    #[arg(long)]
    file: PathBuf,
    /// Saved HTML directory listing to cross-check archives against.
    #[arg(long)]
    listing: Option<PathBuf>,
    #[arg(long)]
    source_url: Option<String>,
}

#[derive(Debug, Args)]
struct SnapshotFetchArgs {
    #[command(flatten)]
    target: SnapshotTargetArgs,
    #[arg(long)]
    cross_check: bool,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Args)]
struct SnapshotListArgs {
    #[arg(long, value_parser = parse_partition)]
    partition: Option<Partition>,
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    Import(ArchiveImportArgs),
}

#[derive(Debug, Args)]
struct ArchiveImportArgs {
    #[arg(long)]
    epoch: String,
    #[arg(long, value_parser = parse_partition)]
    partition: Partition,
    /// YAML list of `{record, superseded_on}` entries.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum OverridesCommand {
    Check,
}

#[derive(Debug, Args)]
struct DatesArgs {
    #[arg(long)]
    epoch: String,
    /// File of known snapshot dates, one per line; stored snapshots are used when omitted.
    #[arg(long)]
    available: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long = "date", required = true)]
    dates: Vec<SnapshotDate>,
    /// Primary snapshot to use; only valid with a single `--date`.
    #[arg(long)]
    snapshot_date: Option<SnapshotDate>,
}

#[derive(Debug, Subcommand)]
enum SetCommand {
    List,
    Show(SetShowArgs),
}

#[derive(Debug, Args)]
struct SetShowArgs {
    #[arg(long)]
    date: SnapshotDate,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    date: SnapshotDate,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum HashesCommand {
    Fetch(HashesFetchArgs),
}

#[derive(Debug, Args)]
struct HashesFetchArgs {
    #[arg(long)]
    date: SnapshotDate,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn parse_partition(raw: &str) -> Result<Partition, String> {
    Partition::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = Partition::ALL.iter().map(|partition| partition.as_str()).collect();
        format!("unknown partition `{raw}` (expected one of {})", known.join(", "))
    })
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Value> {
    serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: Option<&Path>) -> Result<RewindConfig> {
    match path {
        Some(path) => RewindConfig::load(path),
        None => Ok(RewindConfig::default()),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = RewindApi::new(cli.db.clone(), load_config(cli.config.as_deref())?);

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Release { command } => run_release(*command, &api),
        Command::Snapshot { command } => run_snapshot(*command, &api),
        Command::Archive { command } => run_archive(*command, &api),
        Command::Overrides { command } => run_overrides(*command, &api),
        Command::Dates(args) => run_dates(&args, &api),
        Command::Reconcile(args) => run_reconcile(&args, &api),
        Command::Set { command } => run_set(*command, &api),
        Command::Export(args) => run_export(&args, &api),
        Command::Hashes { command } => run_hashes(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &RewindApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(to_json(&api.migrate(args.dry_run)?, "migration result")?),
        DbCommand::IntegrityCheck => emit_json(to_json(&api.integrity_check()?, "integrity report")?),
    }
}

fn run_release(command: ReleaseCommand, api: &RewindApi) -> Result<()> {
    match command {
        ReleaseCommand::Add(args) => {
            let release = api.add_release(StoredRelease {
                epoch: EpochId::new(args.epoch),
                validity: ValidityRange { start: args.start, end: args.end },
                archived: args.archived,
            })?;
            emit_json(to_json(&release, "release")?)
        }
        ReleaseCommand::List => {
            let releases = api.list_releases()?;
            emit_json(serde_json::json!({ "releases": to_json(&releases, "releases")? }))
        }
        ReleaseCommand::Sync => {
            let releases = api.sync_releases()?;
            emit_json(serde_json::json!({ "releases": to_json(&releases, "releases")? }))
        }
    }
}

fn run_snapshot(command: SnapshotCommand, api: &RewindApi) -> Result<()> {
    match command {
        SnapshotCommand::Import(args) => {
            let outcome = api.import_snapshot(
                &args.target.target(),
                &args.file,
                args.listing.as_deref(),
                args.source_url,
            )?;
            emit_json(to_json(&outcome, "import outcome")?)
        }
        SnapshotCommand::Fetch(args) => {
            let fetcher = HttpFetcher::new(Duration::from_secs(args.timeout_secs));
            let outcome = api.fetch_snapshot(&fetcher, &args.target.target(), args.cross_check)?;
            emit_json(to_json(&outcome, "fetch outcome")?)
        }
        SnapshotCommand::List(args) => {
            let snapshots = api.list_snapshots(args.partition)?;
            emit_json(serde_json::json!({ "snapshots": to_json(&snapshots, "snapshots")? }))
        }
    }
}

fn run_archive(command: ArchiveCommand, api: &RewindApi) -> Result<()> {
    match command {
        ArchiveCommand::Import(args) => {
            let epoch = EpochId::new(args.epoch);
            let stored = api.import_archive(&epoch, args.partition, &args.file)?;
            emit_json(serde_json::json!({
                "epoch": epoch.as_str(),
                "partition": args.partition.as_str(),
                "entries": stored
            }))
        }
    }
}

fn run_overrides(command: OverridesCommand, api: &RewindApi) -> Result<()> {
    match command {
        OverridesCommand::Check => emit_json(to_json(&api.check_overrides()?, "overrides check")?),
    }
}

fn run_dates(args: &DatesArgs, api: &RewindApi) -> Result<()> {
    let alignment = api.required_dates(&EpochId::new(args.epoch.clone()), args.available.as_deref())?;
    emit_json(to_json(&alignment, "date alignment")?)
}

fn run_reconcile(args: &ReconcileArgs, api: &RewindApi) -> Result<()> {
    if args.snapshot_date.is_some() && args.dates.len() != 1 {
        return Err(anyhow!("--snapshot-date requires exactly one --date"));
    }
    let requests: Vec<ReconcileRequest> = args
        .dates
        .iter()
        .map(|archive_date| ReconcileRequest { archive_date: *archive_date, snapshot_date: args.snapshot_date })
        .collect();

    let outcomes = api.reconcile(&requests)?;
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|outcome| !outcome.is_success())
        .map(|outcome| outcome.archive_date.to_string())
        .collect();
    emit_json(serde_json::json!({
        "outcomes": to_json(&outcomes, "reconcile outcomes")?,
        "failed_dates": failed
    }))?;

    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("reconcile failed for {}", failed.join(", ")))
    }
}

fn run_set(command: SetCommand, api: &RewindApi) -> Result<()> {
    match command {
        SetCommand::List => {
            let sets = api.list_sets()?;
            emit_json(serde_json::json!({ "sets": to_json(&sets, "set summaries")? }))
        }
        SetCommand::Show(args) => emit_json(to_json(&api.show_set(args.date)?, "reconciled set")?),
    }
}

fn run_export(args: &ExportArgs, api: &RewindApi) -> Result<()> {
    let manifest = api.export(args.date, &args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out.display().to_string(),
        "manifest": to_json(&manifest, "export manifest")?
    }))
}

fn run_hashes(command: HashesCommand, api: &RewindApi) -> Result<()> {
    match command {
        HashesCommand::Fetch(args) => {
            let fetcher = HttpFetcher::new(Duration::from_secs(args.timeout_secs));
            let outcome = api.fetch_hashes(args.date, &fetcher)?;
            emit_json(to_json(&outcome, "hash fetch outcome")?)
        }
    }
}
