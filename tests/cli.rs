//! CLI end-to-end tests
//!
//! None of these need ffmpeg or the packager installed.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

#[allow(deprecated)]
fn vaultstream_cmd(videos_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vaultstream").unwrap();
    cmd.env("VIDEOS_DIR", videos_dir).env_remove("RUST_LOG");
    cmd
}

#[test]
fn no_args_shows_help() {
    let dir = tempdir().unwrap();
    vaultstream_cmd(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_flag() {
    let dir = tempdir().unwrap();
    vaultstream_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vaultstream"));
}

#[test]
fn options_derived_from_analysis() {
    let dir = tempdir().unwrap();
    let analysis = dir.path().join("analysis.json");
    fs::write(
        &analysis,
        r#"{"duration": 600, "bitrate": 2500, "audio_bitrate": 128, "audio_codec": "aac", "height": 1080}"#,
    )
    .unwrap();

    let output = vaultstream_cmd(dir.path())
        .args(["options", analysis.to_str().unwrap(), "--codec", "libx264"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["kind"], "enhanced");
    assert_eq!(json["codec"], "libx264");
    assert_eq!(json["quality_param"], "crf");
    assert_eq!(json["target_video_bitrate"], 2322);
    assert_eq!(json["audio_settings"]["codec"], "copy");
}

#[test]
fn key_matches_reference_derivation() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"keys": {"rounds": 1000}}"#).unwrap();

    vaultstream_cmd(dir.path())
        .env("VIDEO_KEY_MASTER_SEED", "test-seed")
        .args(["--config", config.to_str().unwrap(), "key", "abc"])
        .assert()
        .success()
        .stdout("deffe21621c10ab0429bd0e95481fd22\n");
}

#[test]
fn key_store_writes_key_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"keys": {"rounds": 1000}}"#).unwrap();

    vaultstream_cmd(dir.path())
        .args(["--config", config.to_str().unwrap(), "key", "abc", "--store"])
        .assert()
        .success()
        .stdout(predicate::str::contains("key.bin"));
    assert_eq!(fs::read(dir.path().join("abc").join("key.bin")).unwrap().len(), 16);
}

#[test]
fn invalid_video_id_rejected() {
    let dir = tempdir().unwrap();
    vaultstream_cmd(dir.path())
        .args(["key", "../escape"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid character"));
}

#[test]
fn process_missing_input_fails_in_validation() {
    let dir = tempdir().unwrap();
    vaultstream_cmd(dir.path())
        .args(["process", "vid", dir.path().join("nope.mp4").to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("phase validation"))
        .stderr(predicate::str::contains("NOT_FOUND"));
    assert!(!dir.path().join("vid").exists());
}

#[test]
fn check_reports_json() {
    let dir = tempdir().unwrap();
    let output = vaultstream_cmd(dir.path())
        .args(["check", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    for key in ["ffmpeg", "ffprobe", "packager", "disk", "gpu"] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
}

#[test]
fn cleanup_of_missing_workspace_succeeds() {
    let dir = tempdir().unwrap();
    vaultstream_cmd(dir.path())
        .args(["cleanup", "ghost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Freed 0 bytes"));
}

#[test]
fn validate_reports_warnings() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(
        &config,
        r#"{"keys": {"rounds": 10}, "packaging": {"encryption_scheme": "aes"}}"#,
    )
    .unwrap();

    vaultstream_cmd(dir.path())
        .env_remove("VIDEO_KEY_MASTER_SEED")
        .args(["validate", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("rounds is 10"))
        .stdout(predicate::str::contains("'aes' is not recognized"));
}
