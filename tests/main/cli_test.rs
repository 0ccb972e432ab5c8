//! CLI argument and path handling. No kernel access is needed here:
//! every case fails or exits before the first syscall.

use std::fs;

use assert_cmd::Command;

fn bpflink() -> Command {
    match Command::cargo_bin("bpflink") {
        Ok(cmd) => cmd,
        Err(err) => panic!("bpflink binary should build: {err}"),
    }
}

fn confined_config() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[bpffs]\nroot = \"/sys/fs/bpf\"\nconfine = true\n")
        .expect("should write config");
    (dir, path)
}

#[test]
fn help_lists_subcommands() {
    let output = bpflink().arg("--help").output().expect("run --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cat"));
    assert!(stdout.contains("info"));
    assert!(stdout.contains("unpin"));
}

#[test]
fn missing_subcommand_fails() {
    bpflink().assert().failure();
}

#[test]
fn cat_rejects_path_outside_bpffs() {
    let (_dir, config) = confined_config();
    let output = bpflink()
        .arg("--config")
        .arg(&config)
        .args(["cat", "../../etc/passwd"])
        .output()
        .expect("run cat");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not inside bpffs root"), "stderr: {stderr}");
}

#[test]
fn unreadable_config_fails() {
    let output = bpflink()
        .args(["--config", "/nonexistent/bpflink.toml", "info", "x"])
        .output()
        .expect("run info");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load"), "stderr: {stderr}");
}
