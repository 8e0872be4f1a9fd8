//! CLI integration tests for `ferry`.
//!
//! These tests invoke the compiled `ferry` binary as a subprocess and verify
//! its behavior end-to-end. Each test operates in an isolated temp directory.
//!
//! # Running
//!
//! ```bash
//! cargo test --test integration_test
//! ```
//!
//! `ferry run` with a valid configuration blocks until Ctrl-C, so the run
//! tests here exercise only the paths that exit immediately.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

// ============================================================================
// Infrastructure
// ============================================================================

/// Path to the compiled `ferry` binary, injected by Cargo at compile time.
const FERRY: &str = env!("CARGO_BIN_EXE_ferry");

/// Invoke `ferry` with the given arguments in `cwd` and return the full Output.
fn run_ferry(cwd: &Path, args: &[&str]) -> Output {
    Command::new(FERRY)
        .args(args)
        .current_dir(cwd)
        .env_remove("FERRY_LOG") // keep test output clean
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn ferry binary: {e}"))
}

/// Assert exit-success and return stdout as a String.
#[track_caller]
fn expect_success(out: &Output) -> String {
    assert!(
        out.status.success(),
        "ferry exited {:?}\nstdout: {}\nstderr: {}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Assert that the command exited with a non-zero status.
#[track_caller]
fn expect_failure(out: &Output) {
    assert!(
        !out.status.success(),
        "Expected ferry to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
}

// ============================================================================
// A. Config command tests
// ============================================================================

#[test]
fn test_config_init_creates_project_config() {
    let dir = TempDir::new().unwrap();
    let out = run_ferry(dir.path(), &["config", "init"]);
    expect_success(&out);

    let config_path = dir.path().join(".ferry").join("ferry.toml");
    assert!(config_path.exists(), ".ferry/ferry.toml was not created");
    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(
        toml::from_str::<toml::Value>(&contents).is_ok(),
        "Generated config is not valid TOML:\n{contents}"
    );
}

#[test]
fn test_config_init_fails_if_already_exists() {
    let dir = TempDir::new().unwrap();
    // First init should succeed
    expect_success(&run_ferry(dir.path(), &["config", "init"]));
    // Second init should fail with a clear error
    let out = run_ferry(dir.path(), &["config", "init"]);
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("already exists") || stderr.contains("Config file"),
        "Expected 'already exists' in stderr, got: {stderr}"
    );
}

#[test]
fn test_config_show_toml_is_valid() {
    let dir = TempDir::new().unwrap();
    expect_success(&run_ferry(dir.path(), &["config", "init"]));

    let out = run_ferry(dir.path(), &["config", "show", "--format", "toml"]);
    let stdout = expect_success(&out);
    assert!(
        toml::from_str::<toml::Value>(&stdout).is_ok(),
        "config show --format toml is not valid TOML:\n{stdout}"
    );
}

#[test]
fn test_config_show_json_has_forwarder_and_containers_keys() {
    let dir = TempDir::new().unwrap();
    expect_success(&run_ferry(dir.path(), &["config", "init"]));

    let out = run_ferry(dir.path(), &["config", "show", "--format", "json"]);
    let stdout = expect_success(&out);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert!(json.get("forwarder").is_some(), "Missing 'forwarder' key");
    assert!(json.get("containers").is_some(), "Missing 'containers' key");
}

#[test]
fn test_config_show_without_config_file_uses_defaults() {
    // No config init — should still produce valid output using defaults
    let dir = TempDir::new().unwrap();
    let out = run_ferry(dir.path(), &["config", "show", "--format", "json"]);
    let stdout = expect_success(&out);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(json.get("forwarder").is_some());
    assert!(json.get("containers").is_some());
}

#[test]
fn test_config_show_reflects_project_containers() {
    let dir = TempDir::new().unwrap();

    let dot_ferry = dir.path().join(".ferry");
    fs::create_dir_all(&dot_ferry).unwrap();
    fs::write(
        dot_ferry.join("ferry.toml"),
        "[containers.whatsapp]\nkind = \"socks5\"\nhost = \"proxy.example\"\nport = 1080\n",
    )
    .unwrap();

    let out = run_ferry(dir.path(), &["config", "show", "--format", "json"]);
    let stdout = expect_success(&out);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(
        json["containers"]["whatsapp"]["host"].as_str(),
        Some("proxy.example"),
        "Expected project container in output, got: {json}"
    );
}

// ============================================================================
// B. Check command
// ============================================================================

#[test]
fn test_check_reports_platform() {
    // `ferry check` should always print platform info even when binding
    // loopback ports is not permitted. The exit status may be non-zero in
    // restricted envs.
    let dir = TempDir::new().unwrap();
    let out = run_ferry(dir.path(), &["check"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        stdout.contains("Platform:"),
        "Expected 'Platform:' in check output, got: {stdout}"
    );
}

// ============================================================================
// C. Run command — immediate-exit paths
// ============================================================================

#[test]
fn test_run_without_containers_fails() {
    let dir = TempDir::new().unwrap();
    let out = run_ferry(dir.path(), &["run", "--no-config"]);
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("No containers configured"),
        "Expected 'No containers configured' in stderr, got: {stderr}"
    );
}

#[test]
fn test_run_rejects_malformed_container_entry() {
    let dir = TempDir::new().unwrap();
    // Missing the ID= prefix entirely
    let out = run_ferry(
        dir.path(),
        &["run", "--no-config", "--container", "justanid"],
    );
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Invalid --container entry"),
        "Expected entry-format error in stderr, got: {stderr}"
    );
}

#[test]
fn test_run_rejects_invalid_descriptor() {
    let dir = TempDir::new().unwrap();
    let out = run_ferry(
        dir.path(),
        &["run", "--no-config", "--container", "wa=notaurl"],
    );
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Invalid proxy rule"),
        "Expected 'Invalid proxy rule' in stderr, got: {stderr}"
    );
}

#[test]
fn test_run_rejects_unsupported_scheme() {
    let dir = TempDir::new().unwrap();
    let out = run_ferry(
        dir.path(),
        &[
            "run",
            "--no-config",
            "--container",
            "wa=socks4://u:p@proxy.example:1080",
        ],
    );
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Unsupported proxy type"),
        "Expected 'Unsupported proxy type' in stderr, got: {stderr}"
    );
}
