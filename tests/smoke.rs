//! Smoke tests -- verify the binary runs and its subcommands are wired.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("dnscensus.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("DNS resolution census"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("dnscensus"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["collect", "runs", "show", "check-config"] {
        Command::cargo_bin("dnscensus")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "[run]\ndns_servers = [\"8.8.8.8\", \"1.1.1.1\"]\n");

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("2 DNS server(s)"));
}

#[test]
fn test_config_path_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "[run]\ndns_servers = [\"9.9.9.9\"]\n");

    Command::cargo_bin("dnscensus")
        .unwrap()
        .env("DNSCENSUS_CONFIG", &config)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("1 DNS server(s)"));
}

#[test]
fn test_check_config_rejects_empty_server_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "[run]\ndns_servers = []\n");

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicates::str::contains("at least one DNS server"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("runs")
        .assert()
        .failure();
}

#[test]
fn test_runs_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db").join("census.db");
    let config = write_config(
        &dir,
        &format!(
            "[run]\ndns_servers = [\"8.8.8.8\"]\n[database]\npath = {:?}\n",
            db.display().to_string()
        ),
    );

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicates::str::contains("No runs found."));
    assert!(db.exists());

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .args(["runs", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_show_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("census.db");
    let config = write_config(
        &dir,
        &format!("[database]\npath = {:?}\n", db.display().to_string()),
    );

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .args(["show", "42"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot show run 42"));
}

#[test]
fn test_collect_with_missing_target_list_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        &format!(
            "[run]\ninput_path = {:?}\ndns_servers = [\"127.0.0.1:9\"]\n[database]\npath = {:?}\n",
            dir.path().join("missing.txt").display().to_string(),
            dir.path().join("census.db").display().to_string()
        ),
    );

    Command::cargo_bin("dnscensus")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("collect")
        .assert()
        .failure()
        .stderr(predicates::str::contains("missing.txt"));
}
