use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn shardckpt() -> Command {
    Command::cargo_bin("shardckpt").unwrap()
}

fn simulate(root: &Path, extra: &[&str]) -> assert_cmd::assert::Assert {
    shardckpt()
        .arg("simulate")
        .arg("--root")
        .arg(root)
        .args(["--experiment-id", "cli"])
        .args(extra)
        .assert()
}

#[test]
fn test_cli_help() {
    shardckpt()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("checkpointing for sharded training state"))
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("verify"));
}

#[test]
fn test_cli_simulate_keeps_window() {
    let dir = tempfile::tempdir().unwrap();
    simulate(
        dir.path(),
        &["--world-size", "3", "--keep", "2", "--steps", "4", "--samples-per-step", "10"],
    )
    .success()
    .stdout(predicate::str::contains("marker       40  saved  deleted [20]"))
    .stdout(predicate::str::contains("Retained: [30, 40]"));

    shardckpt()
        .args(["list", "--experiment-id", "cli", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("Latest complete: 40"));
}

#[test]
fn test_cli_simulate_then_resume() {
    let dir = tempfile::tempdir().unwrap();
    simulate(dir.path(), &["--keep", "2", "--steps", "2", "--samples-per-step", "5"]).success();

    simulate(
        dir.path(),
        &["--keep", "2", "--steps", "2", "--samples-per-step", "5", "--resume", "10", "--world-size", "4"],
    )
    .success()
    .stdout(predicate::str::contains("marker       15  saved"))
    .stdout(predicate::str::contains("Retained: [15, 20]"));
}

#[test]
fn test_cli_resume_missing_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    simulate(dir.path(), &["--steps", "1", "--resume", "77"]).failure();
}

#[test]
fn test_cli_inspect() {
    let dir = tempfile::tempdir().unwrap();
    simulate(dir.path(), &["--steps", "1", "--samples-per-step", "99"]).success();
    let artifact = dir
        .path()
        .join("cli")
        .join("eid_cli-optimizer-num_samples_100.bin");

    shardckpt()
        .arg("inspect")
        .arg(&artifact)
        .assert()
        .success()
        .stdout(predicate::str::contains("entity: optimizer"))
        .stdout(predicate::str::contains("optimizer step: 1"))
        .stdout(predicate::str::contains("embed.weight"));

    shardckpt()
        .arg("inspect")
        .arg("--json")
        .arg(&artifact)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"marker\": 99"));
}

#[test]
fn test_cli_verify_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    simulate(dir.path(), &["--steps", "2"]).success();

    shardckpt()
        .args(["verify", "--experiment-id", "cli", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("4 artifacts checked, 0 corrupt"));

    let model = dir.path().join("cli").join("eid_cli-model-num_samples_65.bin");
    let mut bytes = std::fs::read(&model).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&model, bytes).unwrap();

    shardckpt()
        .args(["verify", "--experiment-id", "cli", "--root"])
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("CORRUPT"));
}

#[test]
fn test_cli_inspect_largest_marker() {
    use shardckpt::checkpoint::format::write_artifact;
    use shardckpt::prelude::{EntityKind, StateDict};

    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("edge.bin");
    write_artifact(&artifact, EntityKind::Model, u64::MAX, &StateDict::new()).unwrap();

    shardckpt()
        .arg("inspect")
        .arg(&artifact)
        .assert()
        .success()
        .stdout(predicate::str::contains("marker: 18446744073709551615"));

    shardckpt()
        .arg("inspect")
        .arg("--json")
        .arg(&artifact)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"num_samples\": 18446744073709551615"));
}
