//! Integration tests for the `meridian` CLI binary.
//!
//! These exercise the CLI as a subprocess, verifying exit codes and stdout
//! output. They do not require a running server — commands that need one
//! are pointed at a non-existent address and checked for a clean failure.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

fn meridian_bin() -> String {
    let path = env!("CARGO_BIN_EXE_meridian");
    assert!(Path::new(path).exists(), "meridian binary not found at {path}");
    path.to_owned()
}

fn run(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(meridian_bin())
        .args(args)
        .env("MERIDIAN_ADDR", "http://127.0.0.1:19999")
        .output()
        .expect("failed to execute meridian");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0, "meridian --version should exit 0");
    assert!(stdout.contains("meridian"), "version output should contain 'meridian': {stdout}");
}

#[test]
fn test_help_flag() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0, "meridian --help should exit 0");
    assert!(stdout.contains("apps"), "help should list 'apps' command");
    assert!(stdout.contains("cluster"), "help should list 'cluster' command");
}

#[test]
fn test_apps_subcommand_help() {
    let (code, stdout, _) = run(&["apps", "--help"]);
    assert_eq!(code, 0);
    for sub in ["register", "up", "down", "scale", "ls", "show", "rm"] {
        assert!(stdout.contains(sub), "apps help should list '{sub}': {stdout}");
    }
}

#[test]
fn test_unreachable_server_fails_cleanly() {
    let (code, _, stderr) = run(&["apps", "ls"]);
    assert_ne!(code, 0, "command against an unreachable server should fail");
    assert!(stderr.contains("error:"), "stderr should carry an error message: {stderr}");
}

#[test]
fn test_missing_required_arg_fails() {
    let (code, _, stderr) = run(&["apps", "register", "web"]);
    assert_ne!(code, 0, "register without --image/--port should fail argument parsing");
    assert!(!stderr.is_empty());
}
