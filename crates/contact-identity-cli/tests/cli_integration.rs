use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_cid<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_cid"))
        .args(args)
        .env_remove("IDENTITY_DB")
        .env_remove("IDENTITY_MAX_ATTEMPTS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute cid binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_cid(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "cid command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
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

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_schema_version_migrate_and_integrity() {
    let sandbox = unique_temp_dir("contact-identity-cli-db");
    let db = sandbox.join("contacts.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    assert_eq!(as_str(&schema_before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(dry_run.get("would_apply_versions"), Some(&serde_json::json!([1])));

    let schema_after_dry_run = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);
    assert_eq!(migrate.get("up_to_date").and_then(Value::as_bool), Some(true));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));
    assert_eq!(integrity.get("cluster_violations"), Some(&serde_json::json!([])));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[test]
fn identify_command_creates_extends_and_merges_clusters() {
    let sandbox = unique_temp_dir("contact-identity-cli-identify");
    let db = sandbox.join("contacts.sqlite3");

    let george = run_json([
        "--db",
        path_str(&db),
        "identify",
        "--email",
        "george@hillvalley.edu",
        "--phone",
        "919191",
    ]);
    assert_eq!(as_str(&george, "outcome"), "created");
    let george_id = as_i64(&george["contact"], "primaryContactId");

    let biff = run_json([
        "--db",
        path_str(&db),
        "identify",
        "--email",
        "biffsucks@hillvalley.edu",
        "--phone",
        "717171",
    ]);
    assert_eq!(as_str(&biff, "outcome"), "created");

    let unchanged = run_json(["--db", path_str(&db), "identify", "--phone", "717171"]);
    assert_eq!(as_str(&unchanged, "outcome"), "unchanged");

    let merged = run_json([
        "--db",
        path_str(&db),
        "identify",
        "--email",
        "george@hillvalley.edu",
        "--phone",
        "717171",
    ]);
    assert_eq!(as_str(&merged, "outcome"), "merged");
    assert_eq!(as_i64(&merged["contact"], "primaryContactId"), george_id);
    assert_eq!(
        merged["contact"]["emails"],
        serde_json::json!(["george@hillvalley.edu", "biffsucks@hillvalley.edu"])
    );
    assert_eq!(merged["contact"]["phoneNumbers"], serde_json::json!(["919191", "717171"]));
    assert_eq!(
        merged["contact"]["secondaryContactIds"],
        serde_json::json!([as_i64(&biff["contact"], "primaryContactId")])
    );

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn identify_command_rejects_missing_attributes() {
    let sandbox = unique_temp_dir("contact-identity-cli-invalid");
    let db = sandbox.join("contacts.sqlite3");

    let output = run_cid(["--db", path_str(&db), "identify", "--email", "   "]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("email or phoneNumber MUST be provided"), "stderr:\n{stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}
