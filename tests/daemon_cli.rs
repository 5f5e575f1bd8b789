//! Binary-level tests for the fatal startup gate: bad configs must exit 1
//! with a diagnostic, a pre-planted shutdown signal must yield a clean 0.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("omc-bridge").unwrap();
    cmd.env("HOME", home).env_remove("OMC_STATE_DIR");
    cmd
}

fn write_config(path: &Path, working_directory: &Path) {
    let doc = serde_json::json!({
        "teamName": "t",
        "workerName": "w",
        "provider": "gemini",
        "workingDirectory": working_directory,
    });
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
}

#[test]
fn config_flag_is_required() {
    let tmp = tempfile::tempdir().unwrap();
    cmd(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn missing_config_file_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    cmd(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("nope.json"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("config"));
}

#[test]
fn config_outside_state_root_and_omc_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let config_path = home.join("stray.json");
    write_config(&config_path, home);

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("state root"));
}

#[test]
fn malformed_config_json_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let config_path = home.join(".omc").join("config.json");
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(&config_path, "{ truncated").unwrap();

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn unknown_provider_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let config_path = home.join(".omc").join("config.json");
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(
        &config_path,
        r#"{"teamName":"t","workerName":"w","provider":"claude","workingDirectory":"/tmp"}"#,
    )
    .unwrap();

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn missing_working_directory_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let config_path = home.join(".omc").join("config.json");
    write_config(&config_path, &home.join("does-not-exist"));

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("workingDirectory"));
}

#[test]
fn working_directory_outside_home_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home");
    let outside = tmp.path().join("elsewhere");
    fs::create_dir_all(outside.join(".git")).unwrap();
    let config_path = home.join(".omc").join("config.json");
    write_config(&config_path, &outside);

    cmd(&home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must be under"));
}

#[test]
fn working_directory_without_worktree_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let wd = home.join("repo");
    fs::create_dir_all(&wd).unwrap();
    let config_path = home.join(".omc").join("config.json");
    write_config(&config_path, &wd);

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("worktree"));
}

#[test]
fn planted_shutdown_signal_yields_clean_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path();
    let wd = home.join("repo");
    fs::create_dir_all(wd.join(".git")).unwrap();
    let config_path = home.join(".omc").join("config.json");
    write_config(&config_path, &wd);

    // Pre-plant the stop order so the first cycle shuts straight down.
    let signals_dir = home.join(".omc").join("teams").join("t").join("signals");
    fs::create_dir_all(&signals_dir).unwrap();
    fs::write(
        signals_dir.join("w.shutdown"),
        r#"{"requestId":"req-cli","reason":"test","timestamp":"2026-08-02T10:00:00Z"}"#,
    )
    .unwrap();

    cmd(home)
        .arg("--config")
        .arg(&config_path)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    // The ack landed in the outbox and the signal file was consumed.
    let outbox = fs::read_to_string(home.join(".omc/teams/t/outbox/w")).unwrap();
    assert!(outbox.contains(r#""type":"shutdown_ack""#));
    assert!(outbox.contains(r#""requestId":"req-cli""#));
    assert!(!signals_dir.join("w.shutdown").exists());
}
