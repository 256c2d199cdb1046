//! End-to-end window pipeline tests.
//!
//! These drive the real scheduler/supervisor/merger/emitter chain against
//! a fake `perf` executable (a shell script emitting canned `perf script`
//! output for this test process), so the pipeline runs without root or a
//! real sampler.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hostscope::artifact::{Emitter, EmitterConfig};
use hostscope::drivers::{perf::PerfDriver, Driver};
use hostscope::hostmeta;
use hostscope::session::{Session, SessionConfig};
use hostscope::supervisor::Supervisor;

/// Write a fake `perf` that creates the record file and then replays a
/// canned profile for the given pid.
fn install_fake_perf(dir: &Path, pid: u32) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
cmd="$1"
if [ "$cmd" = "record" ]; then
    out=""
    while [ $# -gt 0 ]; do
        if [ "$1" = "-o" ]; then out="$2"; fi
        shift
    done
    : > "$out"
    exit 0
fi
if [ "$cmd" = "script" ]; then
    printf 'testproc  {pid}/{pid}  [000] 100.000000: 1 cycles: \n'
    printf '\t            55f1a0b2c3d4 busy_loop+0x24 (/usr/bin/testproc)\n'
    printf '\t            55f1a0b2aaaa main+0x120 (/usr/bin/testproc)\n'
    printf '\n'
    printf 'testproc  {pid}/{pid}  [000] 100.100000: 1 cycles: \n'
    printf '\t            55f1a0b2c3d4 busy_loop+0x24 (/usr/bin/testproc)\n'
    printf '\t            55f1a0b2aaaa main+0x120 (/usr/bin/testproc)\n'
    printf '\n'
    exit 0
fi
exit 1
"#,
        pid = pid
    );

    let path = dir.join("fake-perf");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn emitter(output_dir: &Path) -> Arc<Emitter> {
    Arc::new(Emitter::new(
        EmitterConfig {
            output_dir: Some(output_dir.to_path_buf()),
            rotating: false,
            flamegraph: false,
            flamegraph_renderer: String::new(),
        },
        hostmeta::collect(),
        Vec::new(),
    ))
}

fn config(continuous: bool) -> SessionConfig {
    SessionConfig {
        duration: Duration::from_secs(1),
        interval: Duration::from_secs(1),
        frequency: 10,
        continuous,
    }
}

fn read_artifact(output_dir: &Path) -> String {
    let link = output_dir.join("last_profile.col");
    let target = fs::read_link(&link).expect("last_profile.col symlink");
    fs::read_to_string(output_dir.join(target)).expect("artifact readable")
}

#[tokio::test]
async fn test_single_window_produces_artifact() {
    let tools = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let perf = install_fake_perf(tools.path(), std::process::id());

    let drivers = vec![Driver::System(PerfDriver::new(
        perf.display().to_string(),
        tools.path().to_path_buf(),
    ))];
    let mut session = Session::new(
        config(false),
        Supervisor::new(drivers),
        emitter(output.path()),
        CancellationToken::new(),
    );

    let summary = session.run().await.unwrap();
    assert_eq!(summary.windows_run, 1);
    assert_eq!(summary.windows_degraded, 0);

    let artifact = read_artifact(output.path());
    let mut lines = artifact.lines();

    // Metadata preamble: one line, valid JSON behind "# ".
    let preamble = lines.next().unwrap();
    assert!(preamble.starts_with("# "));
    let metadata: serde_json::Value = serde_json::from_str(&preamble[2..]).unwrap();
    assert_eq!(metadata["degraded"], false);
    let apps = metadata["applications_metadata"].as_array().unwrap();
    assert!(!apps.is_empty());

    // The canned samples belong to this test process; both samples share
    // one stack, so exactly one line with count 2 must exist for it.
    let own_pid = u64::from(std::process::id());
    let own_idx = apps
        .iter()
        .position(|app| app["process_id"].as_u64() == Some(own_pid))
        .expect("own process in applications_metadata");

    let own_lines: Vec<&str> = artifact
        .lines()
        .skip(1)
        .filter(|line| line.split(';').next() == Some(own_idx.to_string().as_str()))
        .collect();
    assert_eq!(own_lines.len(), 1, "artifact: {artifact}");
    let line = own_lines[0];
    assert!(line.ends_with(" 2"), "line: {line}");
    assert!(line.contains(";main;busy_loop "), "line: {line}");

    // Every stack line indexes a valid applications_metadata entry.
    for line in artifact.lines().skip(1) {
        let idx: usize = line.split(';').next().unwrap().parse().unwrap();
        assert!(idx < apps.len());
    }
}

#[tokio::test]
async fn test_failed_driver_marks_window_degraded() {
    let output = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();

    // A sampler binary that does not exist: environmental failure, empty
    // partial, degraded window - but an artifact is still emitted.
    let drivers = vec![Driver::System(PerfDriver::new(
        "definitely-not-a-sampler",
        storage.path().to_path_buf(),
    ))];
    let mut session = Session::new(
        config(false),
        Supervisor::new(drivers),
        emitter(output.path()),
        CancellationToken::new(),
    );

    let summary = session.run().await.unwrap();
    assert_eq!(summary.windows_run, 1);
    assert_eq!(summary.windows_degraded, 1);

    let artifact = read_artifact(output.path());
    let preamble = artifact.lines().next().unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&preamble[2..]).unwrap();
    assert_eq!(metadata["degraded"], true);
}

#[tokio::test]
async fn test_continuous_mode_emits_one_artifact_per_window() {
    let tools = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let perf = install_fake_perf(tools.path(), std::process::id());

    let drivers = vec![Driver::System(PerfDriver::new(
        perf.display().to_string(),
        tools.path().to_path_buf(),
    ))];
    let shutdown = CancellationToken::new();
    let mut session = Session::new(
        config(true),
        Supervisor::new(drivers),
        emitter(output.path()),
        shutdown.clone(),
    );

    let run = tokio::spawn(async move { session.run().await });

    // Wait until at least two numbered artifacts exist, then stop.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let count = fs::read_dir(output.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("profile_") && name.ends_with(".col")
            })
            .count();
        if count >= 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "windows too slow");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.cancel();

    let summary = run.await.unwrap().unwrap();
    assert!(summary.windows_run >= 2, "expected >= 2 windows, got {}", summary.windows_run);
}
