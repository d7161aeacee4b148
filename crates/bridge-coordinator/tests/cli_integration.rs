//! Integration tests for the `bridge-coordinator` binary.
//!
//! These exercise the CLI surface directly rather than the library, the
//! same way as the teacher crate's own CLI tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("bridge-coordinator").unwrap()
}

#[test]
fn cli_help_succeeds() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bridge-coordinator"));
}

#[test]
fn cli_no_subcommand_fails_with_usage() {
    cli().assert().failure();
}

#[test]
fn cli_status_reports_when_nothing_running() {
    // No coordinator is listening on the configured port during tests, so
    // `status` must fail cleanly instead of hanging or panicking.
    cli()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("is the coordinator running?"));
}

#[test]
fn cli_restart_reports_when_nothing_running() {
    cli()
        .arg("restart")
        .assert()
        .failure()
        .stderr(predicate::str::contains("is the coordinator running?"));
}
