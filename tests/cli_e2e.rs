//! End-to-end CLI tests for the downloader binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A command running in an empty directory with credentials and fast settings.
fn downloader(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("thinkific-downloader").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env("CLIENT_DATE", "2024-05-01T00:00:00.000Z")
        .env("COOKIE_DATA", "_thinkific_session=e2e")
        .env("OUTPUT_DIR", dir.path().join("out"))
        .env("DOWNLOAD_DELAY", "0")
        .env("RETRY_ATTEMPTS", "0");
    cmd
}

fn write_manifest(dir: &TempDir, json: &str) -> std::path::PathBuf {
    let path = dir.path().join("tasks.json");
    std::fs::write(&path, json).unwrap();
    path
}

#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("thinkific-downloader").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("<MANIFEST>"));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("thinkific-downloader").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("thinkific-downloader"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("thinkific-downloader").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_missing_credentials_fail_before_any_work() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(&dir, "[]");
    downloader(&dir)
        .env_remove("COOKIE_DATA")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("COOKIE_DATA"));
}

#[test]
fn test_empty_manifest_succeeds() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(&dir, "[]");
    downloader(&dir).arg(&manifest).assert().success();
}

#[test]
fn test_malformed_manifest_fails() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(&dir, r#"{"url": "not a list"}"#);
    downloader(&dir)
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid manifest"));
}

#[test]
fn test_existing_valid_files_succeed_without_network() {
    let dir = TempDir::new().unwrap();
    let lesson_dir = dir.path().join("out").join("01-intro");
    std::fs::create_dir_all(&lesson_dir).unwrap();
    std::fs::write(lesson_dir.join("notes.pdf"), b"%PDF-1.7 already here").unwrap();

    // Port 9 (discard) is never served; any request would fail the run.
    let manifest = write_manifest(
        &dir,
        r#"[{"url": "http://127.0.0.1:9/notes.pdf", "dest": "01-intro/notes.pdf", "content_type": "pdf"}]"#,
    );
    downloader(&dir).arg(&manifest).arg("-q").assert().success();
    assert_eq!(
        std::fs::read(lesson_dir.join("notes.pdf")).unwrap(),
        b"%PDF-1.7 already here"
    );
}

#[test]
fn test_failed_download_sets_exit_code() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        &dir,
        r#"[{"url": "http://127.0.0.1:9/missing.pdf", "dest": "missing.pdf", "content_type": "pdf"}]"#,
    );
    downloader(&dir).arg(&manifest).arg("-q").assert().code(1);
    assert!(!dir.path().join("out").join("missing.pdf").exists());
}
