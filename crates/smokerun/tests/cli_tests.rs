//! CLI integration tests for the `smokerun` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[allow(deprecated)]
fn smokerun_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("smokerun").unwrap();
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

fn write_commands(dir: &TempDir, lines: &[&str]) -> String {
    let path = dir.path().join("commands.txt");
    fs::write(&path, lines.join("\n")).unwrap();
    path.display().to_string()
}

// =============================================================================
// Help
// =============================================================================

#[test]
fn test_help_lists_harness_options() {
    let dir = TempDir::new().unwrap();

    smokerun_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("--only-old-fails"))
        .stdout(predicate::str::contains("--small-oplog-rs"));
}

#[test]
fn test_oplog_modes_are_exclusive() {
    let dir = TempDir::new().unwrap();

    smokerun_cmd(&dir)
        .args(["--small-oplog", "--small-oplog-rs", "js"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

// =============================================================================
// Runs without a server
// =============================================================================

#[test]
#[cfg(unix)]
fn test_raw_commands_pass() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["true", "true"]);

    // Act & Assert
    smokerun_cmd(&dir)
        .args(["--mode", "files", "--dont-start-mongod", "--from-file"])
        .arg(&commands)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 tests succeeded"));

    assert!(!dir.path().join("failfile.smoke").exists());
}

#[test]
#[cfg(unix)]
fn test_failing_command_is_reported_and_recorded() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["true", "false", "true"]);

    // Act
    smokerun_cmd(&dir)
        .args(["--mode", "files", "--dont-start-mongod", "--from-file"])
        .arg(&commands)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 tests succeeded"))
        .stdout(predicate::str::contains("1 tests didn't get run"))
        .stdout(predicate::str::contains("false\t1"));

    // Assert
    let ledger = fs::read_to_string(dir.path().join("failfile.smoke")).unwrap();
    assert!(ledger.contains("\"false\""));
}

#[test]
#[cfg(unix)]
fn test_harness_error_still_reports_and_records() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["false", "true", "/definitely/not/a/test", "true"]);

    // Act
    smokerun_cmd(&dir)
        .args([
            "--mode",
            "files",
            "--dont-start-mongod",
            "--continue-on-failure",
            "--from-file",
        ])
        .arg(&commands)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 tests succeeded"))
        .stdout(predicate::str::contains("false\t1"))
        .stdout(predicate::str::contains(
            "running when the run was aborted:\n/definitely/not/a/test",
        ))
        .stdout(predicate::str::contains("run aborted: [SMOKE-004]"));

    // Assert
    let ledger = fs::read_to_string(dir.path().join("failfile.smoke")).unwrap();
    assert!(ledger.contains("\"false\""));
    assert!(ledger.contains("/definitely/not/a/test"));
}

#[test]
#[cfg(unix)]
fn test_continue_on_failure_runs_everything() {
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["false", "true"]);

    smokerun_cmd(&dir)
        .args([
            "--mode",
            "files",
            "--dont-start-mongod",
            "--continue-on-failure",
            "--from-file",
        ])
        .arg(&commands)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 tests succeeded"))
        .stdout(predicate::str::contains("didn't get run").not());
}

#[test]
#[cfg(unix)]
fn test_quiet_mode_prints_tap() {
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["true", "false"]);

    smokerun_cmd(&dir)
        .args([
            "--mode",
            "files",
            "--dont-start-mongod",
            "--continue-on-failure",
            "--quiet",
            "--from-file",
        ])
        .arg(&commands)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1..2"))
        .stdout(predicate::str::contains("ok 1 "))
        .stdout(predicate::str::contains("not ok 2 "));

    assert!(dir.path().join("tests.log").exists());
}

#[test]
fn test_ignore_filters_everything_out() {
    let dir = TempDir::new().unwrap();
    let commands = write_commands(&dir, &["true"]);

    smokerun_cmd(&dir)
        .args([
            "--mode",
            "files",
            "--dont-start-mongod",
            "--ignore",
            "tru",
            "--from-file",
        ])
        .arg(&commands)
        .assert()
        .success()
        .stderr(predicate::str::contains("no tests specified"));
}

#[test]
fn test_unknown_suite_fails() {
    let dir = TempDir::new().unwrap();

    smokerun_cmd(&dir)
        .args(["--dont-start-mongod", "no-such-suite"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-suite"));
}

#[test]
fn test_missing_server_executable_fails_early() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("a.js");
    fs::write(&script, "").unwrap();

    smokerun_cmd(&dir)
        .args(["--mode", "files", "--mongod", "./not-there"])
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no server executable"));
}

#[test]
fn test_partial_buildlogger_options_are_rejected() {
    let dir = TempDir::new().unwrap();

    smokerun_cmd(&dir)
        .args(["--buildlogger-builder", "linux64", "js"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--buildlogger-buildnum"));
}

// =============================================================================
// Failure ledger
// =============================================================================

#[test]
fn test_reset_old_fails_removes_ledger() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let failfile = dir.path().join("failfile.smoke");
    fs::write(&failfile, "[]").unwrap();

    // Act
    smokerun_cmd(&dir).arg("--reset-old-fails").assert().success();

    // Assert
    assert!(!failfile.exists());
}

#[test]
fn test_only_old_fails_with_empty_ledger() {
    let dir = TempDir::new().unwrap();

    smokerun_cmd(&dir)
        .args(["--only-old-fails", "--dont-start-mongod"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tests succeeded"));
}

#[test]
fn test_only_old_fails_drops_vanished_tests() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let failfile = dir.path().join("custom.fails");
    let entry = serde_json::json!([{
        "test": { "path": dir.path().join("gone.js"), "requires_server": true },
        "options": smokerun::ServerOptions::default(),
    }]);
    fs::write(&failfile, entry.to_string()).unwrap();

    // Act
    smokerun_cmd(&dir)
        .args(["--only-old-fails", "--dont-start-mongod", "--failfile"])
        .arg(&failfile)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 tests succeeded"));

    // Assert
    assert!(!failfile.exists());
}
