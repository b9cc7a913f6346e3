use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tilestack_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tilestack");
    path
}

fn write_config(root: &Path, content: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("tilestack.toml");
    fs::write(&path, content).unwrap();
    path
}

fn run(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tilestack_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tilestack binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn chunks_split_window_and_clip_last() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "[search]\nchunk_size_days = 30\n");

    let (stdout, stderr, ok) = run(
        &config,
        &["chunks", "--start", "2021-01-01", "--end", "2021-02-15"],
    );
    assert!(ok, "chunks failed: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "2021-01-01T00:00:00Z/2021-01-31T00:00:00Z",
            "2021-01-31T00:00:00Z/2021-02-15T00:00:00Z",
        ]
    );
}

#[test]
fn chunk_days_flag_overrides_config() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "");

    let (stdout, _, ok) = run(
        &config,
        &["chunks", "--start", "2021-01-01", "--end", "2021-01-08", "--chunk-days", "7"],
    );
    assert!(ok);
    assert_eq!(stdout.lines().count(), 1);
}

#[test]
fn inverted_window_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "");

    let (_, stderr, ok) = run(
        &config,
        &["chunks", "--start", "2021-02-01", "--end", "2021-01-01"],
    );
    assert!(!ok);
    assert!(!stderr.is_empty());
}

#[test]
fn invalid_config_fails_before_work() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "[quality]\nmin_tile_coverage = 2.0\n");

    let (stdout, stderr, ok) = run(
        &config,
        &["chunks", "--start", "2021-01-01", "--end", "2021-02-01"],
    );
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("min_tile_coverage"), "stderr: {}", stderr);
}

#[test]
fn missing_explicit_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run(
        &tmp.path().join("nope.toml"),
        &["chunks", "--start", "2021-01-01", "--end", "2021-02-01"],
    );
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn huge_chunk_days_is_an_error_not_a_panic() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "");

    let (stdout, stderr, ok) = run(
        &config,
        &[
            "chunks",
            "--start",
            "2021-01-01",
            "--end",
            "2021-02-01",
            "--chunk-days",
            "200000000000",
        ],
    );
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("out of range"), "stderr: {}", stderr);
    assert!(!stderr.contains("panicked"), "stderr: {}", stderr);
}
