//! Smoke tests -- verify the binary runs and the local commands work.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn runwarden() -> Command {
    let mut cmd = Command::cargo_bin("runwarden").unwrap();
    cmd.env_remove("RUNWARDEN_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("runwarden.toml");
    let body = format!(
        "[storage]\ndb_path = \"{}\"\n\n[policy]\nmax_attempts = 5\n",
        dir.join("ledger.db").display()
    );
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    runwarden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Retrying, time-bounded"));
}

#[test]
fn test_cli_version() {
    runwarden()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("runwarden"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["submit", "--help"],
        vec!["status", "--help"],
        vec!["cancel", "--help"],
        vec!["executions", "list", "--help"],
        vec!["executions", "show", "--help"],
    ] {
        runwarden().args(&args).assert().success();
    }
}

#[test]
fn test_config_prints_effective_values() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    runwarden()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[policy]"))
        .stdout(predicate::str::contains("max_attempts = 5"));
}

#[test]
fn test_missing_config_file_is_an_error() {
    runwarden()
        .args(["--config", "/nonexistent/runwarden.toml", "config"])
        .assert()
        .failure();
}

#[test]
fn test_executions_list_on_empty_ledger() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    runwarden()
        .arg("--config")
        .arg(&config)
        .args(["executions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No executions found."));
    assert!(dir.path().join("ledger.db").exists());
}

#[test]
fn test_executions_list_rejects_unknown_status() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    runwarden()
        .arg("--config")
        .arg(&config)
        .args(["executions", "list", "--status", "sleeping"])
        .assert()
        .failure();
}

#[test]
fn test_status_rejects_malformed_id() {
    runwarden()
        .args(["status", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed execution id"));
}

#[test]
fn test_submit_missing_file_fails() {
    runwarden()
        .args(["submit", "/nonexistent/test.js"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read test file"));
}
