//! Folded-stacks artifact rendering and emission.
//!
//! One artifact per window: a single-line JSON metadata preamble
//! (`# {...}`), then one line per unique stack:
//!
//! ```text
//! <idx>;<container>;<command>[;appid: <id>];<frame>;<frame>;... <count>
//! ```
//!
//! `idx` is the position of the process in the preamble's
//! `applications_metadata` array. Frames render root-first with their
//! provenance suffixes. Files appear atomically (temp file + rename), so a
//! concurrent reader never sees a torn artifact.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::domain::{Pid, ProcessDescriptor, StackCounts};
use crate::hostmeta::HostMetadata;
use crate::sink::{submit_with_retry, Sink};

/// Fixed artifact names maintained in the output directory.
pub const LAST_PROFILE_NAME: &str = "last_profile.col";
pub const LAST_FLAMEGRAPH_NAME: &str = "last_flamegraph.html";

const RENDERER_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the emitter needs for one window, decoupled from the
/// scheduler loop.
#[derive(Debug)]
pub struct EmitJob {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub merged: HashMap<Pid, StackCounts>,
    pub descriptors: HashMap<Pid, ProcessDescriptor>,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub output_dir: Option<PathBuf>,
    pub rotating: bool,
    pub flamegraph: bool,
    /// External folded-to-HTML renderer; reads the .col path as argv\[1\]
    /// and writes HTML to stdout.
    pub flamegraph_renderer: String,
}

pub struct Emitter {
    config: EmitterConfig,
    host_metadata: HostMetadata,
    sinks: Vec<Arc<dyn Sink>>,
}

/// A rendered artifact: the folded text plus its parsed-out metadata.
pub struct RenderedArtifact {
    pub text: String,
    pub metadata: Value,
}

/// Render one window into artifact text and its metadata object.
///
/// Processes are ordered by pid so identical windows render identically.
#[must_use]
pub fn render(job: &EmitJob, host: &HostMetadata) -> RenderedArtifact {
    let mut pids: Vec<Pid> = job.merged.keys().copied().collect();
    pids.sort_unstable();

    let applications_metadata: Vec<Value> = pids
        .iter()
        .map(|pid| {
            let desc = &job.descriptors[pid];
            json!({
                "process_id": desc.pid.0,
                "command": desc.comm,
                "appid": desc.appid,
                "container": desc.container_id,
                "runtime": desc.runtime.as_str(),
                "runtime_version": desc.runtime_version,
            })
        })
        .collect();

    let metadata = json!({
        "start_time": job.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        "end_time": job.end_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        "hostname": host.hostname,
        "host_metadata": host,
        "applications_metadata": applications_metadata,
        "degraded": job.degraded,
    });

    // The preamble must stay a single line: serde_json never emits raw
    // newlines, and compact formatting keeps it that way.
    let mut text = format!("# {metadata}\n");

    for (idx, pid) in pids.iter().enumerate() {
        let stacks = &job.merged[pid];
        for (stack, count) in stacks.iter() {
            text.push_str(&idx.to_string());
            // Root-first render; label frames carry empty suffixes.
            for frame in stack.0.iter().rev() {
                text.push(';');
                text.push_str(&frame.symbol);
                text.push_str(frame.kind.suffix());
            }
            text.push(' ');
            text.push_str(&count.to_string());
            text.push('\n');
        }
    }

    RenderedArtifact { text, metadata }
}

/// Write `contents` so the file appears atomically at `path`.
fn write_atomically(path: &Path, contents: &str) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Point `link_name` in `dir` at `target` atomically (symlink to a temp
/// name, then rename over). In rotating mode the previous target is
/// unlinked afterwards.
fn update_last_symlink(dir: &Path, link_name: &str, target: &Path, rotating: bool) -> anyhow::Result<()> {
    let link_path = dir.join(link_name);
    let previous = std::fs::read_link(&link_path).ok().map(|t| dir.join(t));

    let tmp_link = dir.join(format!(".{link_name}.tmp"));
    let _ = std::fs::remove_file(&tmp_link);
    let target_name = target.file_name().unwrap_or(target.as_os_str());
    std::os::unix::fs::symlink(target_name, &tmp_link)?;
    std::fs::rename(&tmp_link, &link_path)?;

    if rotating {
        if let Some(previous) = previous {
            if previous != *target && previous.file_name() != Some(std::ffi::OsStr::new(link_name)) {
                let _ = std::fs::remove_file(previous);
            }
        }
    }
    Ok(())
}

impl Emitter {
    #[must_use]
    pub fn new(config: EmitterConfig, host_metadata: HostMetadata, sinks: Vec<Arc<dyn Sink>>) -> Self {
        Emitter { config, host_metadata, sinks }
    }

    /// Emit one window: render, write local files, submit to every sink.
    ///
    /// Local write failures are errors; sink failures are handled by the
    /// retry policy and never propagate.
    pub async fn emit(&self, job: EmitJob) -> anyhow::Result<()> {
        let rendered = render(&job, &self.host_metadata);

        if let Some(dir) = &self.config.output_dir {
            self.write_local(dir, &job, &rendered).await?;
        }

        if !self.sinks.is_empty() {
            let payload = Arc::new(rendered.text.into_bytes());
            for sink in &self.sinks {
                submit_with_retry(Arc::clone(sink), Arc::clone(&payload), rendered.metadata.clone())
                    .await;
            }
        }
        Ok(())
    }

    async fn write_local(
        &self,
        dir: &Path,
        job: &EmitJob,
        rendered: &RenderedArtifact,
    ) -> anyhow::Result<()> {
        // Rotating mode keeps no numbered history: the artifact goes
        // straight to the fixed name, atomically replacing the previous
        // window's.
        let col_path = if self.config.rotating {
            dir.join(LAST_PROFILE_NAME)
        } else {
            dir.join(format!("profile_{}.col", file_stamp(job.end_time)))
        };
        write_atomically(&col_path, &rendered.text)?;
        if !self.config.rotating {
            update_last_symlink(dir, LAST_PROFILE_NAME, &col_path, false)?;
        }
        log::info!("saved collapsed stacks to {}", col_path.display());

        if self.config.flamegraph {
            if let Err(e) = self.render_flamegraph(dir, job, &col_path).await {
                // A broken renderer must not degrade profiling itself.
                log::warn!("flamegraph rendering failed: {e}");
            }
        }
        Ok(())
    }

    async fn render_flamegraph(
        &self,
        dir: &Path,
        job: &EmitJob,
        col_path: &Path,
    ) -> anyhow::Result<()> {
        let renderer = crate::drivers::command::resolve_tool(&self.config.flamegraph_renderer)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let output = tokio::time::timeout(
            RENDERER_TIMEOUT,
            tokio::process::Command::new(&renderer)
                .arg(col_path)
                .stdin(std::process::Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("renderer timed out"))??;
        if !output.status.success() {
            anyhow::bail!("renderer exited with {}", output.status);
        }

        let html_path = if self.config.rotating {
            dir.join(LAST_FLAMEGRAPH_NAME)
        } else {
            dir.join(format!("profile_{}.html", file_stamp(job.end_time)))
        };
        write_atomically(&html_path, &String::from_utf8_lossy(&output.stdout))?;
        if !self.config.rotating {
            update_last_symlink(dir, LAST_FLAMEGRAPH_NAME, &html_path, false)?;
        }
        log::info!("saved flamegraph to {}", html_path.display());
        Ok(())
    }
}

/// Filesystem-friendly timestamp for artifact names. Millisecond
/// resolution keeps short back-to-back windows from colliding.
fn file_stamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H-%M-%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Frame, FrameKind, RuntimeKind, Stack, StartTimeToken};

    fn descriptor(pid: u32, comm: &str, container: &str, appid: &str) -> ProcessDescriptor {
        ProcessDescriptor {
            pid: Pid(pid),
            ppid: Pid(1),
            start_time: StartTimeToken(1),
            comm: comm.to_string(),
            cmdline: Vec::new(),
            exe_path: PathBuf::new(),
            module_sonames: Vec::new(),
            container_id: container.to_string(),
            pid_ns: None,
            mnt_ns: None,
            runtime: RuntimeKind::Native,
            runtime_version: None,
            appid: appid.to_string(),
        }
    }

    fn host() -> HostMetadata {
        HostMetadata {
            hostname: "testhost".into(),
            kernel_release: "6.1.0".into(),
            cpu_count: 4,
            agent_version: "0.0.0".into(),
        }
    }

    /// Merged stacks arrive from the merger already labeled: leaf-first
    /// with [frame.., appid?, command, container] at the tail.
    fn labeled_stack(frames: &[(&str, FrameKind)]) -> Stack {
        Stack::new(frames.iter().map(|(s, k)| Frame::new(*s, *k)).collect())
    }

    fn job() -> EmitJob {
        let mut merged = HashMap::new();
        let mut stacks = StackCounts::new();
        stacks.add(
            labeled_stack(&[
                ("do_work", FrameKind::Native),
                ("main", FrameKind::Native),
                ("myapp", FrameKind::Label),
                ("", FrameKind::Label),
            ]),
            10,
        );
        merged.insert(Pid(100), stacks);

        let mut descriptors = HashMap::new();
        descriptors.insert(Pid(100), descriptor(100, "myapp", "", ""));

        EmitJob {
            start_time: "2026-08-02T10:00:00Z".parse().unwrap(),
            end_time: "2026-08-02T10:01:00Z".parse().unwrap(),
            merged,
            descriptors,
            degraded: false,
        }
    }

    #[test]
    fn test_render_preamble_shape() {
        let rendered = render(&job(), &host());
        let first_line = rendered.text.lines().next().unwrap();
        assert!(first_line.starts_with("# "));

        let metadata: Value = serde_json::from_str(&first_line[2..]).unwrap();
        assert_eq!(metadata["hostname"], "testhost");
        assert_eq!(metadata["degraded"], false);
        assert_eq!(metadata["start_time"], "2026-08-02T10:00:00Z");
        assert_eq!(metadata["applications_metadata"][0]["process_id"], 100);
    }

    #[test]
    fn test_render_stack_line_format() {
        let rendered = render(&job(), &host());
        let lines: Vec<&str> = rendered.text.lines().collect();
        assert_eq!(lines.len(), 2);
        // idx;container(empty);command;root;leaf count
        assert_eq!(lines[1], "0;;myapp;main;do_work 10");
    }

    #[test]
    fn test_render_applies_provenance_suffixes() {
        let mut merged = HashMap::new();
        let mut stacks = StackCounts::new();
        stacks.add(
            labeled_stack(&[
                ("mmput", FrameKind::Kernel),
                ("handler", FrameKind::Python),
                ("python3", FrameKind::Label),
                ("abc", FrameKind::Label),
            ]),
            3,
        );
        merged.insert(Pid(1), stacks);
        let mut descriptors = HashMap::new();
        descriptors.insert(Pid(1), descriptor(1, "python3", "abc", ""));

        let job = EmitJob {
            start_time: Utc::now(),
            end_time: Utc::now(),
            merged,
            descriptors,
            degraded: true,
        };
        let rendered = render(&job, &host());
        let line = rendered.text.lines().nth(1).unwrap();
        assert_eq!(line, "0;abc;python3;handler_[p];mmput_[k] 3");
        assert_eq!(rendered.metadata["degraded"], true);
    }

    #[test]
    fn test_render_indexes_follow_pid_order() {
        let mut merged = HashMap::new();
        for pid in [30u32, 10, 20] {
            let mut stacks = StackCounts::new();
            stacks.add(labeled_stack(&[("f", FrameKind::Native)]), 1);
            merged.insert(Pid(pid), stacks);
        }
        let descriptors: HashMap<Pid, ProcessDescriptor> = [10u32, 20, 30]
            .into_iter()
            .map(|p| (Pid(p), descriptor(p, "c", "", "")))
            .collect();

        let job = EmitJob {
            start_time: Utc::now(),
            end_time: Utc::now(),
            merged,
            descriptors,
            degraded: false,
        };
        let rendered = render(&job, &host());
        let apps = rendered.metadata["applications_metadata"].as_array().unwrap();
        let pids: Vec<u64> = apps.iter().map(|a| a["process_id"].as_u64().unwrap()).collect();
        assert_eq!(pids, vec![10, 20, 30]);

        // Every stack line's idx points into applications_metadata.
        for line in rendered.text.lines().skip(1) {
            let idx: usize = line.split(';').next().unwrap().parse().unwrap();
            assert!(idx < apps.len());
        }
    }

    #[tokio::test]
    async fn test_emit_writes_file_and_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = Emitter::new(
            EmitterConfig {
                output_dir: Some(dir.path().to_path_buf()),
                rotating: false,
                flamegraph: false,
                flamegraph_renderer: String::new(),
            },
            host(),
            Vec::new(),
        );
        emitter.emit(job()).await.unwrap();

        let link = dir.path().join(LAST_PROFILE_NAME);
        let target = std::fs::read_link(&link).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(target)).unwrap();
        assert!(contents.starts_with("# "));
        assert!(contents.contains("myapp"));
    }

    #[tokio::test]
    async fn test_rotating_emit_keeps_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = Emitter::new(
            EmitterConfig {
                output_dir: Some(dir.path().to_path_buf()),
                rotating: true,
                flamegraph: false,
                flamegraph_renderer: String::new(),
            },
            host(),
            Vec::new(),
        );
        for _ in 0..5 {
            emitter.emit(job()).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![LAST_PROFILE_NAME.to_string()]);
    }
}
