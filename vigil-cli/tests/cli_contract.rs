use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "vigil_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn vigil(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vigil"))
        .args(args)
        .env_remove("GST_DEBUG_DUMP_DOT_DIR")
        .env("NO_COLOR", "1")
        .output()
        .expect("run vigil")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_the_documented_flags() {
    let output = vigil(&["--help"]);
    assert!(output.status.success());
    let help = stdout(&output);
    for flag in [
        "--video-path",
        "--pgie-config",
        "--tracker-config",
        "--n_sources",
        "--disable-tracker",
        "--sync",
        "--json",
        "--dry-run",
    ] {
        assert!(help.contains(flag), "help is missing {flag}:\n{help}");
    }
}

#[test]
fn video_path_is_required() {
    let output = vigil(&["--dry-run"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--video-path"));
}

#[test]
fn zero_sources_is_a_configuration_error() {
    let output = vigil(&["--video-path", "clip.mp4", "-n", "0", "--dry-run"]);
    assert_eq!(output.status.code(), Some(20), "stderr:\n{}", stderr(&output));
    assert!(stderr(&output).contains("at least 1"));
    assert!(!stdout(&output).contains("Total count"));
}

#[test]
fn dry_run_prints_counts_after_end_of_stream() {
    let output = vigil(&[
        "--video-path",
        "clip.mp4",
        "-n",
        "2",
        "--disable-tracker",
        "--dry-run",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr:\n{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("End-of-stream"), "stdout:\n{out}");
    assert!(out.contains("Total count: {0: 10, 1: 10}"), "stdout:\n{out}");

    let err = stderr(&output);
    assert!(err.contains("Creating file-source-0"), "stderr:\n{err}");
    assert!(!err.contains("Creating tracker"), "stderr:\n{err}");
}

#[test]
fn dry_run_json_is_a_single_object() {
    let output = vigil(&[
        "--video-path",
        "clip.mp4",
        "-n",
        "1",
        "--disable-tracker",
        "--dry-run",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr:\n{}", stderr(&output));
    let out = stdout(&output);
    let lines: Vec<_> = out.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1, "stdout:\n{out}");
    let value: serde_json::Value = serde_json::from_str(lines[0]).expect("stdout is JSON");
    assert_eq!(value["outcome"], "end_of_stream");
    assert_eq!(value["counts"]["0"], 10);
    assert_eq!(value["frames"]["0"], 10);
}

#[test]
fn missing_tracker_config_fails_construction() {
    let dir = unique_temp_dir("missing_tracker");
    let tracker = dir.join("absent.txt");
    let output = vigil(&[
        "--video-path",
        "clip.mp4",
        "--tracker-config",
        tracker.to_str().expect("utf-8 path"),
        "--dry-run",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(21), "stderr:\n{}", stderr(&output));
    let value: serde_json::Value =
        serde_json::from_str(stdout(&output).trim()).expect("stdout is JSON");
    assert_eq!(value["outcome"], "error");
    assert_eq!(value["error_code"], 21);
}

#[test]
fn tracker_config_and_dot_dir_are_honored() {
    let dir = unique_temp_dir("tracker_dot");
    let tracker = dir.join("tracker.txt");
    fs::write(&tracker, "[tracker]\ntracker-width=640\ngpu-id=0\n").expect("write tracker");
    let dot_dir = dir.join("dot");

    let output = vigil(&[
        "--video-path",
        "clip.mp4",
        "-n",
        "3",
        "--tracker-config",
        tracker.to_str().expect("utf-8 path"),
        "--dot-dir",
        dot_dir.to_str().expect("utf-8 path"),
        "--sync",
        "--dry-run",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr:\n{}", stderr(&output));
    assert!(stdout(&output).contains("Total count: {0: 10, 1: 10, 2: 10}"));
    assert!(stderr(&output).contains("Creating tracker"));
    assert!(stderr(&output).contains("Setting sync to true"));

    let dot = fs::read_to_string(dot_dir.join("debug_graph.model.dot")).expect("model dot");
    assert!(dot.contains("\"tracker\" -> \"streamdemux\""));
}

#[cfg(not(feature = "gstreamer-runtime"))]
#[test]
fn stub_build_reports_missing_runtime() {
    let output = vigil(&["--video-path", "clip.mp4", "--disable-tracker"]);
    assert_eq!(output.status.code(), Some(40), "stderr:\n{}", stderr(&output));
    assert!(stderr(&output).contains("gstreamer-runtime"));
}
