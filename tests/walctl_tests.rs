//! Integration tests for walctl: config precedence and the maintenance subcommands.

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

use headwal::record::HEADER_LEN;
use headwal::segments::segment_path;
use headwal::{Head, HeadOptions, LabelSet, Sample};

/// Run walctl in `cwd` with the given args and env. Returns (exit code, stdout, stderr).
fn run_walctl(cwd: &Path, args: &[&str], env_extra: &[(&str, &str)]) -> (i32, String, String) {
    let exe = env!("CARGO_BIN_EXE_walctl");
    let mut cmd = Command::new(exe);
    cmd.current_dir(cwd).args(args);
    for key in [
        "WALCTL_CONFIG",
        "WALCTL_WAL_DIR",
        "WALCTL_CHUNK_CAPACITY",
        "WALCTL_SEGMENT_CAPACITY_BYTES",
        "WALCTL_SYNC_TIMEOUT_MS",
    ] {
        cmd.env_remove(key);
    }
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run walctl");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.code().unwrap_or(-1), stdout, stderr)
}

fn populate(wal_dir: &Path, samples: i64) {
    let head = Head::open(HeadOptions {
        wal_dir: wal_dir.to_path_buf(),
        segment_capacity_bytes: 100,
        ..HeadOptions::default()
    })
    .unwrap();
    let cpu = LabelSet::from_pairs([("__name__", "cpu")]);
    for t in 0..samples {
        head.append(&cpu, Sample::new(t, t as f64)).unwrap();
    }
    head.close().unwrap();
}

#[test]
fn validate_config_defaults() {
    let cwd = tempdir().unwrap();
    let (code, stdout, stderr) = run_walctl(cwd.path(), &["--validate-config", "--no-config"], &[]);
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("wal_dir=./data/wal"), "stdout: {}", stdout);
    assert!(stdout.contains("chunk_capacity=120"), "stdout: {}", stdout);
    assert!(
        stdout.contains("segment_capacity_bytes=134217728"),
        "stdout: {}",
        stdout
    );
    assert!(stdout.contains("sync_timeout_ms=none"), "stdout: {}", stdout);
}

#[test]
fn validate_config_file_then_env_then_cli() {
    let cwd = tempdir().unwrap();
    let cfg = cwd.path().join("custom.toml");
    fs::write(
        &cfg,
        concat!(
            "wal_dir = \"/from/file\"\n",
            "chunk_capacity = 7\n",
            "segment_capacity_bytes = 4096\n",
            "sync_timeout_ms = 250\n",
        ),
    )
    .unwrap();
    let cfg = cfg.to_string_lossy().into_owned();

    let (code, stdout, stderr) =
        run_walctl(cwd.path(), &["--validate-config", "--config", &cfg], &[]);
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("wal_dir=/from/file"), "stdout: {}", stdout);
    assert!(stdout.contains("chunk_capacity=7"), "stdout: {}", stdout);
    assert!(stdout.contains("segment_capacity_bytes=4096"), "stdout: {}", stdout);
    assert!(stdout.contains("sync_timeout_ms=250"), "stdout: {}", stdout);

    let (code, stdout, _) = run_walctl(
        cwd.path(),
        &["--validate-config", "--config", &cfg],
        &[("WALCTL_CHUNK_CAPACITY", "9")],
    );
    assert_eq!(code, 0);
    assert!(stdout.contains("chunk_capacity=9"), "env should beat file: {}", stdout);

    let (code, stdout, _) = run_walctl(
        cwd.path(),
        &["--validate-config", "--config", &cfg, "--chunk-capacity", "11"],
        &[("WALCTL_CHUNK_CAPACITY", "9")],
    );
    assert_eq!(code, 0);
    assert!(stdout.contains("chunk_capacity=11"), "CLI should win: {}", stdout);
}

#[test]
fn validate_config_picks_up_walctl_toml_in_cwd() {
    let cwd = tempdir().unwrap();
    fs::write(cwd.path().join("walctl.toml"), "wal_dir = \"/implicit\"\n").unwrap();

    let (code, stdout, _) = run_walctl(cwd.path(), &["--validate-config"], &[]);
    assert_eq!(code, 0);
    assert!(stdout.contains("wal_dir=/implicit"), "stdout: {}", stdout);

    let (code, stdout, _) = run_walctl(cwd.path(), &["--validate-config", "--no-config"], &[]);
    assert_eq!(code, 0);
    assert!(stdout.contains("wal_dir=./data/wal"), "stdout: {}", stdout);
}

#[test]
fn invalid_config_is_rejected() {
    let cwd = tempdir().unwrap();
    let (code, _, stderr) = run_walctl(
        cwd.path(),
        &["--validate-config", "--no-config", "--chunk-capacity", "0"],
        &[],
    );
    assert_eq!(code, 2);
    assert!(stderr.contains("chunk_capacity"), "stderr: {}", stderr);

    let (code, _, stderr) = run_walctl(
        cwd.path(),
        &["--validate-config", "--config", "/definitely/missing.toml"],
        &[],
    );
    assert_eq!(code, 2);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

#[test]
fn verify_and_inspect_report_damage() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    populate(&wal_dir, 6);
    let wal = wal_dir.to_string_lossy().into_owned();

    let (code, stdout, stderr) =
        run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "verify"], &[]);
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.starts_with("ok segments=3 records=7"), "stdout: {}", stdout);

    let path = segment_path(&wal_dir, 1);
    let mut bytes = fs::read(&path).unwrap();
    bytes[HEADER_LEN + 1] ^= 0x10;
    fs::write(&path, &bytes).unwrap();

    let (code, stdout, _) =
        run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "verify"], &[]);
    assert_eq!(code, 1);
    assert!(stdout.contains("CRC mismatch"), "stdout: {}", stdout);

    let (code, stdout, _) =
        run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "inspect"], &[]);
    assert_eq!(code, 0);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "stdout: {}", stdout);
    assert!(lines[0].starts_with("segment=00000000"));
    assert!(lines[0].contains("series=1 samples=2 checkpoints=0 status=ok"));
    assert!(lines[1].contains("status=CRC mismatch at offset 0"));
}

#[test]
fn recover_repairs_and_summarises() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    populate(&wal_dir, 6);
    let wal = wal_dir.to_string_lossy().into_owned();

    let path = segment_path(&wal_dir, 1);
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let (code, stdout, stderr) = run_walctl(
        dir.path(),
        &["--no-config", "--wal-dir", &wal, "--chunk-capacity", "2", "recover"],
        &[],
    );
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("series=1\n"), "stdout: {}", stdout);
    assert!(stdout.contains("samples=4\n"), "stdout: {}", stdout);
    assert!(stdout.contains("chunks=2\n"), "stdout: {}", stdout);
    assert!(stdout.contains("min_time=0 max_time=3"), "stdout: {}", stdout);

    let (code, _, _) = run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "verify"], &[]);
    assert_eq!(code, 0);
}

#[test]
fn checkpoint_removes_flushed_segments() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    populate(&wal_dir, 9);
    let wal = wal_dir.to_string_lossy().into_owned();

    let (code, stdout, stderr) = run_walctl(
        dir.path(),
        &["--no-config", "--wal-dir", &wal, "--segment-capacity-bytes", "100", "checkpoint"],
        &[],
    );
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("removed=2"), "stdout: {}", stdout);
    assert!(stdout.contains("segments=2"), "stdout: {}", stdout);
}

#[test]
fn checkpoint_repairs_torn_tail_before_writing_marker() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    populate(&wal_dir, 9);
    let wal = wal_dir.to_string_lossy().into_owned();

    // Segment 3 holds a single sample frame; cut it short.
    let path = segment_path(&wal_dir, 3);
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let (code, stdout, stderr) = run_walctl(
        dir.path(),
        &["--no-config", "--wal-dir", &wal, "--segment-capacity-bytes", "100", "checkpoint"],
        &[],
    );
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("repaired=segment 3"), "stdout: {}", stdout);
    assert!(stdout.contains("removed=2"), "stdout: {}", stdout);

    let (code, _, _) = run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "verify"], &[]);
    assert_eq!(code, 0);

    let (_, stdout, _) =
        run_walctl(dir.path(), &["--no-config", "--wal-dir", &wal, "inspect"], &[]);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "stdout: {}", stdout);
    assert_eq!(
        lines[1],
        "segment=00000003 bytes=13 series=0 samples=0 checkpoints=1 status=ok"
    );
}

#[test]
fn missing_command_is_an_error() {
    let cwd = tempdir().unwrap();
    let (code, _, stderr) = run_walctl(cwd.path(), &["--no-config"], &[]);
    assert_eq!(code, 2);
    assert!(stderr.contains("no command"), "stderr: {}", stderr);
}
