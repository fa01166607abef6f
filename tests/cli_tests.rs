//! Integration tests for the `afk` CLI surface: argument parsing and the
//! bare entry-point behaviors that don't require a running assistant.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("afk").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("tail"));
}

#[test]
fn start_help_documents_options() {
    let mut cmd = Command::cargo_bin("afk").unwrap();
    cmd.arg("start")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--iterations"))
        .stdout(predicate::str::contains("--background"))
        .stdout(predicate::str::contains("--allowed-tools"));
}

#[test]
fn invalid_subcommand_fails_with_usage_error() {
    let mut cmd = Command::cargo_bin("afk").unwrap();
    cmd.arg("not-a-real-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn status_on_empty_data_root_reports_no_sessions() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("afk").unwrap();
    cmd.env("AFK_HOME", dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no sessions"));
}
