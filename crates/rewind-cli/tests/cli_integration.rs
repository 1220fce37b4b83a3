use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

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
overrides: overrides.yaml
"#;

const OVERRIDES: &str = r#"
exclusions:
  - key: "3.13"
    additions:
      ghost: "removed upstream"
native_build_inputs:
  - key: "3.13"
    additions:
      xts: [gfortran]
skip_check:
  - key: ["3.13", "2021-06-01"]
    additions: [tsbio]
"#;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rw<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rw"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rw binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rw(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rw command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

struct Fixture {
    dir: PathBuf,
    db: PathBuf,
    config: PathBuf,
}

impl Fixture {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let config = dir.join("rewind.yaml");
        write_file(&config, CONFIG);
        write_file(&dir.join("overrides.yaml"), OVERRIDES);
        write_file(&dir.join("PACKAGES.cran"), PRIMARY_INDEX);
        write_file(&dir.join("PACKAGES.software"), SOFTWARE_INDEX);
        let db = dir.join("rewind.sqlite3");
        Self { dir, db, config }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["--db", path_str(&self.db), "--config", path_str(&self.config)];
        args.extend_from_slice(rest);
        args
    }

    fn json(&self, rest: &[&str]) -> Value {
        run_json(self.args(rest))
    }

    fn path(&self, name: &str) -> String {
        path_str(&self.dir.join(name)).to_string()
    }

    fn seed(&self) {
        self.json(&["release", "sync"]);
        let primary = self.path("PACKAGES.cran");
        self.json(&["snapshot", "import", "--date", "2021-06-02", "--file", primary.as_str()]);
        let software = self.path("PACKAGES.software");
        self.json(&[
            "snapshot", "import", "--partition", "software", "--epoch", "3.13", "--date", "2021-05-20", "--file",
            software.as_str(),
        ]);
    }
}

#[test]
fn db_migrate_dry_run_then_apply() {
    let fixture = Fixture::new("rw-cli-migrate");

    let planned = fixture.json(&["db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(planned.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&planned, "current_version"), 0);

    let applied = fixture.json(&["db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);

    let status = fixture.json(&["db", "schema-version"]);
    assert_eq!(status.get("up_to_date"), Some(&Value::Bool(true)));

    let integrity = fixture.json(&["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));
}

#[test]
fn release_add_and_list_in_epoch_order() {
    let fixture = Fixture::new("rw-cli-release");
    fixture.json(&["release", "add", "--epoch", "3.10", "--start", "2019-10-30", "--end", "2020-04-28"]);
    fixture.json(&["release", "add", "--epoch", "3.9", "--start", "2019-05-03", "--end", "2019-10-30"]);

    let listed = fixture.json(&["release", "list"]);
    let epochs: Vec<&str> = as_array(&listed, "releases").iter().map(|release| as_str(release, "epoch")).collect();
    assert_eq!(epochs, vec!["3.9", "3.10"]);
}

#[test]
fn reconcile_show_and_export_round_trip() {
    let fixture = Fixture::new("rw-cli-reconcile");
    fixture.seed();

    let snapshots = fixture.json(&["snapshot", "list"]);
    assert_eq!(as_array(&snapshots, "snapshots").len(), 2);

    let check = fixture.json(&["overrides", "check"]);
    assert_eq!(as_i64(&check, "entry_count"), 3);

    let reconciled = fixture.json(&["reconcile", "--date", "2021-06-01"]);
    assert!(as_array(&reconciled, "failed_dates").is_empty());
    let outcome = &as_array(&reconciled, "outcomes")[0];
    let summary = outcome.get("set").unwrap_or_else(|| panic!("missing set summary: {outcome}"));
    assert_eq!(as_str(summary, "snapshot_date"), "2021-06-02");
    assert_eq!(as_i64(summary, "package_count"), 4);

    let set = fixture.json(&["set", "show", "--date", "2021-06-01"]);
    let packages = set.get("packages").unwrap_or_else(|| panic!("missing packages: {set}"));
    assert!(packages.get("ghost").is_none());
    let xts = packages.get("xts").unwrap_or_else(|| panic!("missing xts: {packages}"));
    assert_eq!(as_str(xts, "url"), "https://cran.example/2021-06-02/src/contrib/xts_0.12.1.tar.gz");
    let tsbio = packages.get("tsbio").unwrap_or_else(|| panic!("missing tsbio: {packages}"));
    let tsbio_overrides = tsbio.get("overrides").unwrap_or_else(|| panic!("missing overrides: {tsbio}"));
    assert_eq!(tsbio_overrides.get("skip_check"), Some(&Value::Bool(true)));
    assert!(as_array(&set, "notes").iter().any(|note| note.as_str() == Some("excluded ghost (removed upstream)")));

    let out = fixture.dir.join("export");
    let exported = fixture.json(&["export", "--date", "2021-06-01", "--out", path_str(&out)]);
    let manifest = exported.get("manifest").unwrap_or_else(|| panic!("missing manifest: {exported}"));
    assert_eq!(as_array(manifest, "files").len(), 6);
    assert!(out.join("manifest.json").exists());
    let software = fs::read_to_string(out.join("software.ndjson"))
        .unwrap_or_else(|err| panic!("failed to read software export: {err}"));
    assert_eq!(software.lines().count(), 2);

    let sets = fixture.json(&["set", "list"]);
    assert_eq!(as_array(&sets, "sets").len(), 1);
}

#[test]
fn failing_date_exits_non_zero_and_reports_it() {
    let fixture = Fixture::new("rw-cli-failing");
    fixture.seed();

    let output = run_rw(fixture.args(&["reconcile", "--date", "2021-06-01", "--date", "2023-01-01"]));
    assert!(!output.status.success());
    let payload = parse_stdout(&output);
    let failed: Vec<&str> = as_array(&payload, "failed_dates").iter().filter_map(Value::as_str).collect();
    assert_eq!(failed, vec!["2023-01-01"]);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("2023-01-01"), "stderr should name the failing date:\n{stderr}");

    let sets = fixture.json(&["set", "list"]);
    assert_eq!(as_array(&sets, "sets").len(), 1);
}

#[test]
fn dates_reports_unaligned_release_start() {
    let fixture = Fixture::new("rw-cli-dates");
    fixture.json(&["release", "sync"]);
    let available = fixture.dir.join("dates.txt");
    write_file(&available, "2021-01-04\n2021-05-21\n");

    let alignment = fixture.json(&["dates", "--epoch", "3.13", "--available", path_str(&available)]);
    let required: Vec<&str> = as_array(&alignment, "required").iter().filter_map(Value::as_str).collect();
    assert_eq!(required, vec!["2021-05-21"]);
    assert!(as_array(&alignment, "unaligned").is_empty());
}

#[test]
fn unknown_partition_is_rejected() {
    let fixture = Fixture::new("rw-cli-partition");
    let file = fixture.path("PACKAGES.cran");
    let output = run_rw(fixture.args(&[
        "snapshot", "import", "--partition", "bioc", "--date", "2021-06-02", "--file", file.as_str(),
    ]));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown partition"), "unexpected stderr:\n{stderr}");
}

#[test]
fn shipped_config_and_overrides_validate() {
    let root = repo_root();
    let config = root.join("config/rewind.yaml");
    let db = unique_temp_dir("rw-cli-shipped").join("rewind.sqlite3");

    let check = run_json(["--db", path_str(&db), "--config", path_str(&config), "overrides", "check"]);
    assert!(as_i64(&check, "entry_count") > 0);

    let releases = run_json(["--db", path_str(&db), "--config", path_str(&config), "release", "sync"]);
    assert!(!as_array(&releases, "releases").is_empty());
}
