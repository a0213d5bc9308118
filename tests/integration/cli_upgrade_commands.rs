#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sombra_upgrade::{
    primitives::lock::StoreLock,
    storage::DatabaseLayout,
    types::SombraError,
};
use tempfile::TempDir;

fn init_db(generation: &str, unclean: bool) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("graph");
    let mut cmd = cargo_bin_cmd!("sombra-upgrade");
    cmd.args(["init", "--generation", generation, "--nodes", "24"])
        .arg(&path);
    if unclean {
        cmd.arg("--unclean");
    }
    cmd.assert().success();
    (dir, path)
}

fn json_output(args: &[&str], path: &PathBuf, code: i32) -> Value {
    let output = cargo_bin_cmd!("sombra-upgrade")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .env_remove("SOMBRA_UPGRADE_CONFIG")
        .assert()
        .code(code)
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn detect_reports_legacy_store() {
    let (_dir, path) = init_db("1", false);
    let json = json_output(&["detect"], &path, 0);
    assert_eq!(json["status"], "upgradable");
    assert_eq!(json["version"]["generation"], 1);
    assert_eq!(json["kernel"]["generation"], 2);
    assert_eq!(json["files"].as_array().map(Vec::len), Some(5));
}

#[test]
fn check_reports_unclean_shutdown() {
    let (_dir, clean) = init_db("1", false);
    let json = json_output(&["check"], &clean, 0);
    assert_eq!(json["clean"], true);
    assert!(json["checkpoint"].is_number());

    let (_dir2, dirty) = init_db("1", true);
    let json = json_output(&["check"], &dirty, 2);
    assert_eq!(json["clean"], false);
    assert!(json["reason"]
        .as_str()
        .unwrap_or_default()
        .contains("not shut down cleanly"));
}

#[test]
fn migrate_requires_permission() {
    let (dir, path) = init_db("1", false);
    let config = dir.path().join("upgrade.toml");
    fs::write(&config, "allow_upgrade = false\n").expect("write config");

    let output = cargo_bin_cmd!("sombra-upgrade")
        .args(["--format", "json", "migrate", "--config"])
        .arg(&config)
        .arg(&path)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["refused"], true);
    assert!(json["reason"]
        .as_str()
        .unwrap_or_default()
        .contains("allow_upgrade"));

    let output = cargo_bin_cmd!("sombra-upgrade")
        .args(["--format", "json", "migrate", "--allow-upgrade", "--config"])
        .arg(&config)
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["from"]["generation"], 1);
    assert_eq!(json["to"]["generation"], 2);

    let json = json_output(&["detect"], &path, 0);
    assert_eq!(json["status"], "current");
    let json = json_output(&["verify", "--level", "full"], &path, 0);
    assert_eq!(json["success"], true);
    assert_eq!(json["counts"]["nodes_in_use"], 24);
}

#[test]
fn verify_fails_on_damaged_store() {
    let (_dir, path) = init_db("2", false);
    let nodes = path.join("nodes.db");
    let mut bytes = fs::read(&nodes).expect("read nodes");
    bytes.truncate(bytes.len() - 3);
    fs::write(&nodes, bytes).expect("truncate nodes");

    let json = json_output(&["verify", "--level", "fast"], &path, 2);
    assert_eq!(json["success"], false);
    assert!(!json["findings"].as_array().expect("findings").is_empty());
}

#[test]
fn text_output_is_human_readable() {
    let (_dir, path) = init_db("2", false);
    let output = cargo_bin_cmd!("sombra-upgrade")
        .arg("detect")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("sombra-record/2 (current"), "{text}");
}

#[test]
fn refused_second_owner_does_not_release_the_store_lock() {
    let (_dir, path) = init_db("1", false);
    let layout = DatabaseLayout::new(&path);
    let nodes_before = fs::read(path.join("nodes.db")).expect("read nodes");

    let _held = StoreLock::try_acquire(layout.lock_file()).expect("first owner");
    assert!(matches!(
        StoreLock::try_acquire(layout.lock_file()),
        Err(SombraError::Locked(_))
    ));

    // Another process must still be shut out.
    let output = cargo_bin_cmd!("sombra-upgrade")
        .args(["migrate", "--allow-upgrade"])
        .arg(&path)
        .env_remove("SOMBRA_UPGRADE_CONFIG")
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("locked"), "{stderr}");
    assert_eq!(fs::read(path.join("nodes.db")).expect("read nodes"), nodes_before);
}
