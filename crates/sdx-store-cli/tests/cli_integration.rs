use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const TX_ID: &str = "ed7d29ed-612b-e981-d5ed-0e2e3c9951e3";

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

fn run_cli<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sdx-store"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sdx-store binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_cli(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sdx-store command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn submission_file(dir: &std::path::Path) -> PathBuf {
    let payload = serde_json::json!({
        "type": "uk.gov.ons.edc.eq:surveyresponse",
        "tx_id": TX_ID,
        "survey_id": "194825",
        "collection": {"period": "0616"},
        "metadata": {"user_id": "789473423", "ru_ref": "1234570071A"},
        "data": {"1": "2", "2": "4"}
    });
    let path = dir.join("submission.json");
    fs::write(&path, payload.to_string())
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

#[test]
fn schema_save_get_and_search_round_trip() {
    let dir = unique_temp_dir("sdx-store-cli");
    let db = dir.join("store.sqlite3");
    let db_arg = db.display().to_string();
    let file = submission_file(&dir);
    let file_arg = file.display().to_string();

    let value = run_json(["--db", db_arg.as_str(), "schema"]);
    assert_eq!(value.get("schema").and_then(Value::as_str), Some("ok"));

    let value = run_json([
        "--db",
        db_arg.as_str(),
        "response",
        "save",
        "--file",
        file_arg.as_str(),
    ]);
    assert_eq!(value.get("tx_id").and_then(Value::as_str), Some(TX_ID));
    assert_eq!(value.get("feedback").and_then(Value::as_bool), Some(false));

    let value = run_json(["--db", db_arg.as_str(), "response", "get", TX_ID]);
    assert_eq!(value.get("tx_id").and_then(Value::as_str), Some(TX_ID));
    assert_eq!(
        value.pointer("/data/survey_id").and_then(Value::as_str),
        Some("194825")
    );

    let value =
        run_json(["--db", db_arg.as_str(), "search", "--survey-id", "194825"]);
    assert_eq!(value.get("total_hits").and_then(Value::as_u64), Some(1));

    let value = run_json(["--db", db_arg.as_str(), "search", "--survey-id", "999999"]);
    assert_eq!(value.get("total_hits").and_then(Value::as_u64), Some(0));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn purge_respects_the_retention_window() {
    let dir = unique_temp_dir("sdx-store-cli-purge");
    let db = dir.join("store.sqlite3");
    let db_arg = db.display().to_string();
    let file = submission_file(&dir);
    let file_arg = file.display().to_string();

    run_json(["--db", db_arg.as_str(), "schema"]);
    run_json([
        "--db",
        db_arg.as_str(),
        "response",
        "save",
        "--file",
        file_arg.as_str(),
    ]);

    // A fresh row is inside any plausible window.
    let value = run_json(["--db", db_arg.as_str(), "purge", "--days", "90"]);
    assert_eq!(value.get("deleted").and_then(Value::as_u64), Some(0));

    let value = run_json(["--db", db_arg.as_str(), "response", "get", TX_ID]);
    assert_eq!(value.get("tx_id").and_then(Value::as_str), Some(TX_ID));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn purge_without_a_window_fails() {
    let dir = unique_temp_dir("sdx-store-cli-nowindow");
    let db = dir.join("store.sqlite3");
    let db_arg = db.display().to_string();

    let output = Command::new(env!("CARGO_BIN_EXE_sdx-store"))
        .args(["--db", db_arg.as_str(), "purge"])
        .env_remove("SDX_STORE_RETENTION_DAYS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sdx-store binary: {err}"));

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("retention"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_documents_are_reported_as_errors() {
    let dir = unique_temp_dir("sdx-store-cli-missing");
    let db = dir.join("store.sqlite3");
    let db_arg = db.display().to_string();

    run_json(["--db", db_arg.as_str(), "schema"]);

    let output = run_cli(["--db", db_arg.as_str(), "response", "get", TX_ID]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no response stored"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}
