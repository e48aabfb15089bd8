//! CLI subprocess integration tests.
//!
//! These tests invoke the `overseer` binary against a temporary state root
//! with the mock backend and check exit codes and JSON output.

use std::path::PathBuf;
use std::process::{Command, Output};

struct Root {
    dir: tempfile::TempDir,
    config: PathBuf,
}

fn temp_root() -> Root {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("overseer.toml");
    std::fs::write(
        &config,
        format!(
            "root = \"{}\"\nbackend = \"mock\"\nretry_backoff_ms = 10\n",
            dir.path().join("state").display()
        ),
    )
    .unwrap();
    Root { dir, config }
}

fn overseer(root: &Root, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_overseer"))
        .arg("--config")
        .arg(&root.config)
        .args(args)
        .output()
        .unwrap()
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_overseer"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("overseer"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_overseer"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["changes", "install", "connect", "restart-done"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn cli_install_and_inspect() {
    let root = temp_root();
    let output = overseer(&root, &["--json", "install", "foo", "1"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let result = json(&output);
    assert_eq!(result["status"], "Done");
    assert_eq!(result["kind"], "install-snap");
    assert_eq!(result["ready"], true);

    let output = overseer(&root, &["--json", "changes", "--all"]);
    assert!(output.status.success());
    let changes = json(&output);
    assert_eq!(changes.as_array().unwrap().len(), 1);
    assert_eq!(changes[0]["id"], "1");
    assert_eq!(changes[0]["summary"], "Install \"foo\" snap");

    let output = overseer(&root, &["--json", "changes"]);
    assert!(json(&output).as_array().unwrap().is_empty());

    let output = overseer(&root, &["--json", "tasks", "1"]);
    assert!(output.status.success());
    let tasks = json(&output);
    let kinds: Vec<&str> = tasks["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["link-snap", "run-hook"]);
    assert!(tasks["err"].is_null());
}

#[test]
fn cli_remove_unknown_snap_fails() {
    let root = temp_root();
    let output = overseer(&root, &["remove", "ghost"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("snap \"ghost\" is not installed"));
}

#[test]
fn cli_install_rejects_path_like_name() {
    let root = temp_root();
    let output = overseer(&root, &["install", "../../escaped", "1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("invalid name"));
    assert!(!root.dir.path().join("escaped.json").exists());

    let output = overseer(&root, &["--json", "changes", "--all"]);
    assert!(output.status.success());
    assert_eq!(json(&output).as_array().map(Vec::len), Some(0));
}

#[test]
fn cli_connect_rejects_bad_reference() {
    let root = temp_root();
    let output = overseer(&root, &["connect", "consumer", "producer:net"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("expected <snap>:<name>"));
}

#[test]
fn cli_connect_and_disconnect() {
    let root = temp_root();
    for snap in ["consumer", "producer"] {
        assert!(overseer(&root, &["install", snap, "1"]).status.success());
    }
    let output = overseer(&root, &["--json", "connect", "consumer:net", "producer:net"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(json(&output)["kind"], "connect-snap");

    let output = overseer(&root, &["connect", "consumer:net", "producer:net"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("already connected"));

    let output = overseer(&root, &["--json", "disconnect", "consumer:net", "producer:net"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(json(&output)["status"], "Done");
}

#[test]
fn cli_kernel_install_waits_for_restart() {
    let root = temp_root();
    let output = overseer(
        &root,
        &["--json", "install", "pc-kernel", "7", "--type", "kernel"],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let result = json(&output);
    assert_eq!(result["ready"], false);
    assert_eq!(result["restart-pending"][0], "system");

    // The pending change keeps other changes off the snap.
    let output = overseer(&root, &["remove", "pc-kernel"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("conflict: snap \"pc-kernel\""));

    let output = overseer(&root, &["--json", "restart-done", "system"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(json(&output)["resumed"], 1);

    let output = overseer(&root, &["--json", "changes", "--all"]);
    assert_eq!(json(&output)[0]["status"], "Done");
}

#[test]
fn cli_abort_of_ready_change_fails() {
    let root = temp_root();
    assert!(overseer(&root, &["install", "foo", "1"]).status.success());
    let output = overseer(&root, &["abort", "1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("already ready"));
}

#[test]
fn cli_unknown_change_fails() {
    let root = temp_root();
    let output = overseer(&root, &["tasks", "42"]);
    assert_eq!(output.status.code(), Some(1));
    let output = overseer(&root, &["tasks", "forty-two"]);
    assert!(stderr(&output).contains("invalid change id"));
}

#[test]
fn cli_settle_prune_and_warnings_on_empty_root() {
    let root = temp_root();
    let output = overseer(&root, &["--json", "settle", "--timeout", "5"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(json(&output)["settled"], true);

    let output = overseer(&root, &["--json", "prune"]);
    assert!(output.status.success());
    assert_eq!(json(&output)["removed-tasks"], 0);

    let output = overseer(&root, &["warnings"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no warnings"));
}

#[test]
fn cli_root_flag_overrides_config() {
    let root = temp_root();
    let other = root.dir.path().join("elsewhere");
    let output = overseer(
        &root,
        &["--root", &other.to_string_lossy(), "install", "foo", "1"],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(other.is_dir());
    let output = overseer(&root, &["--json", "changes", "--all"]);
    assert!(json(&output).as_array().unwrap().is_empty());
}

#[test]
fn cli_bad_config_fails() {
    let root = temp_root();
    std::fs::write(&root.config, "backend = \"docker\"\n").unwrap();
    let output = overseer(&root, &["changes"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("unknown backend"));
}

#[test]
fn cli_completions_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_overseer"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("overseer"));
}
