//! Command-line smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn tpmfuzz(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("tpmfuzz").expect("binary builds");
    cmd.current_dir(dir).env("NO_COLOR", "1").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_commands_lists_catalogue() {
    let dir = tempfile::tempdir().expect("tempdir");
    tpmfuzz(dir.path())
        .arg("commands")
        .assert()
        .success()
        .stdout(predicate::str::contains("CreatePrimary"))
        .stdout(predicate::str::contains("NV_DefineSpace"));
}

#[test]
fn test_config_prints_project_overrides() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("tpmfuzz.toml"), "[series]\nmax_fuzz_count = 77\n")
        .expect("write config");
    tpmfuzz(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_fuzz_count = 77"));
}

#[test]
fn test_run_emits_json_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    tpmfuzz(dir.path())
        .args([
            "run",
            "--seed",
            "3",
            "--duration-secs",
            "30",
            "--max-test-runs",
            "20",
            "--json",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"seeds\""))
        .stdout(predicate::str::contains("\"tests_run\": 20"));
}

#[test]
fn test_unknown_exclusive_command_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    tpmfuzz(dir.path())
        .args(["run", "--exclusive", "NoSuchCommand", "--duration-secs", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown command 'NoSuchCommand'"));
}
