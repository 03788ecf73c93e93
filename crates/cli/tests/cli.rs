//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `lims` binary and check exit codes and
//! output. Nothing here opens hardware or network connections.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn lims() -> Command {
    let mut cmd = cargo_bin_cmd!("lims");
    cmd.env_remove("LIMS_LOG");
    cmd
}

// ──────────────────────────────────────────────
// Help and version
// ──────────────────────────────────────────────

#[test]
fn help_lists_subcommands() {
    lims()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("relay"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("crc"));
}

#[test]
fn version_exits_0() {
    lims()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("lims"));
}

#[test]
fn no_subcommand_is_a_usage_error() {
    lims().assert().failure().code(2);
}

// ──────────────────────────────────────────────
// crc
// ──────────────────────────────────────────────

#[test]
fn crc_appends_checksum_low_byte_first() {
    lims()
        .args(["crc", "01 03 00 00 00 01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0x0A84"))
        .stdout(predicate::str::contains("010300000001840A"));
}

#[test]
fn crc_verify_accepts_a_valid_frame() {
    lims()
        .args(["crc", "--verify", "010300000001840A"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn crc_verify_rejects_a_corrupted_frame() {
    lims()
        .args(["crc", "--verify", "010300000001840B"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("checksum mismatch"));
}

#[test]
fn crc_rejects_bad_hex() {
    lims()
        .args(["crc", "0g"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid hex"));
}

// ──────────────────────────────────────────────
// worker
// ──────────────────────────────────────────────

#[test]
fn worker_rejects_unparseable_config() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("station.toml");
    fs::write(&path, "[station]\nkind = \"nmr\"\n").unwrap();

    lims()
        .arg("worker")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn worker_reports_missing_config_file() {
    let tmp = tempfile::tempdir().unwrap();

    lims()
        .arg("worker")
        .arg("--config")
        .arg(tmp.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn worker_rejects_unknown_kind_flag() {
    lims()
        .args(["worker", "--kind", "nmr"])
        .assert()
        .failure()
        .code(2);
}
