//! Smoke tests of the CLI surface.

use assert_cmd::Command;

#[test]
fn help_lists_both_servers() {
    let assert = Command::cargo_bin("labscan").unwrap().arg("--help").assert();
    let output = assert.success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.contains("record"), "missing record subcommand:\n{stdout}");
    assert!(stdout.contains("server"), "missing server subcommand:\n{stdout}");
}

#[test]
fn record_help_shows_flags() {
    let assert = Command::cargo_bin("labscan")
        .unwrap()
        .args(["record", "--help"])
        .assert();
    let output = assert.success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    for flag in ["--port", "--datapath", "--url", "--timeout"] {
        assert!(stdout.contains(flag), "missing {flag}:\n{stdout}");
    }
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("labscan")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}
