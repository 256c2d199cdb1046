//! Python driver: eBPF-based sampling with attach-based fallback.
//!
//! Two backends hide behind one driver:
//!
//! * **eBPF (`pyperf`)** — a single long-lived child samples every CPython
//!   on the host and streams pid-prefixed collapsed lines. A reader thread
//!   timestamps each sample and hands it over a bounded channel; windows
//!   are sliced out of that stream by sample timestamp, not by when the
//!   slice is read. pyperf interleaves native and kernel frames into its
//!   stacks, so its partial *replaces* the system sampler's stacks for
//!   those pids instead of being merged.
//! * **Attach (`py-spy`)** — one short-lived child per target process,
//!   bounded by the window duration. Emits interpreter-only stacks that the
//!   merger scales against the native sample counts.
//!
//! In Auto mode the eBPF backend is probed once; if the kernel or
//! permissions rule it out the driver demotes itself to Attach for the
//! remainder of the agent run.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};

use crate::collapse;
use crate::domain::{
    DriverError, DriverMode, FrameKind, PartialProfile, Pid, ProcessDescriptor, Stack,
};

use super::command::{self, configure_std_child, run_tool, signal_group};
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};

/// Bound on buffered stream samples between reads; the reader drops (and
/// counts) samples beyond it rather than blocking the child's stdout.
const STREAM_CHANNEL_CAPACITY: usize = 16 * 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One timestamped sample off the streaming sampler's stdout.
#[derive(Debug)]
struct StreamSample {
    at: Instant,
    pid: Pid,
    stack: Stack,
    count: u64,
}

enum Backend {
    /// Auto mode before the first readiness probe.
    Undecided,
    /// eBPF sampler; the child is (re)spawned lazily.
    Ebpf(Option<EbpfSampler>),
    Attach,
}

pub struct PythonDriver {
    pub machine: StateMachine,
    backend: Backend,
    pyperf_tool: String,
    pyspy_tool: String,
    storage_dir: PathBuf,
}

impl PythonDriver {
    #[must_use]
    pub fn new(
        mode: DriverMode,
        pyperf_tool: impl Into<String>,
        pyspy_tool: impl Into<String>,
        storage_dir: PathBuf,
    ) -> Self {
        let backend = match mode {
            DriverMode::Auto => Backend::Undecided,
            DriverMode::Ebpf => Backend::Ebpf(None),
            DriverMode::Attach | DriverMode::Disabled => Backend::Attach,
        };
        PythonDriver {
            machine: StateMachine::new(mode != DriverMode::Disabled),
            backend,
            pyperf_tool: pyperf_tool.into(),
            pyspy_tool: pyspy_tool.into(),
            storage_dir,
        }
    }

    /// True while the eBPF backend is (or may still become) active: its
    /// stacks carry native frames and replace the system sampler's.
    #[must_use]
    pub fn emits_native_frames(&self) -> bool {
        matches!(self.backend, Backend::Ebpf(_) | Backend::Undecided)
    }

    pub fn shutdown(&mut self) {
        if let Backend::Ebpf(Some(sampler)) = &mut self.backend {
            sampler.kill();
        }
        if let Backend::Ebpf(slot) = &mut self.backend {
            *slot = None;
        }
    }

    pub(crate) async fn collect(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        if matches!(self.backend, Backend::Undecided) {
            self.decide_backend(ctx).await;
        }

        if matches!(self.backend, Backend::Attach) {
            return self.collect_attach(ctx, targets).await;
        }
        let pyperf_tool = self.pyperf_tool.clone();
        match &mut self.backend {
            Backend::Ebpf(slot) => Self::collect_ebpf(slot, &pyperf_tool, ctx, &targets).await,
            Backend::Attach | Backend::Undecided => unreachable!("backend decided above"),
        }
    }

    /// Probe pyperf once (Auto mode only). A failed probe — kernel support
    /// missing, permission denied, binary absent — demotes the driver to
    /// Attach for the remainder of the agent run.
    async fn decide_backend(&mut self, ctx: &WindowContext) {
        match probe_pyperf(&self.pyperf_tool, ctx).await {
            Ok(()) => {
                log::info!("pyperf readiness probe passed, using the eBPF python sampler");
                self.backend = Backend::Ebpf(None);
            }
            Err(err) => {
                log::warn!("pyperf unavailable ({err}); falling back to attach-based python profiling");
                self.backend = Backend::Attach;
            }
        }
    }

    async fn collect_ebpf(
        slot: &mut Option<EbpfSampler>,
        tool: &str,
        ctx: &WindowContext,
        targets: &[ProcessDescriptor],
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = command::resolve_tool(tool)?;

        let needs_spawn = match slot.as_mut() {
            None => true,
            Some(sampler) => !sampler.alive(),
        };
        if needs_spawn {
            *slot = Some(EbpfSampler::spawn(&tool_path, ctx.window.frequency)?);
            log::info!("started streaming python sampler");
        }
        let sampler = slot.as_mut().expect("sampler just ensured");

        // Let the window elapse; the stream accumulates meanwhile.
        let deadline = ctx.window.sampling_deadline();
        tokio::select! {
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            () = ctx.cancel.cancelled() => {}
        }

        if !sampler.alive() {
            let err = sampler.exit_error();
            *slot = None;
            return Err(err);
        }

        let mut profile = sampler.collect_window(ctx.window.started_at, deadline);
        // pyperf samples every CPython on the host; stacks for processes we
        // were not asked about are dropped here (arriving mid-window or
        // raced with the snapshot).
        let requested: std::collections::HashSet<Pid> = targets.iter().map(|d| d.pid).collect();
        profile.retain(|pid, _| requested.contains(pid));
        Ok(profile)
    }

    async fn collect_attach(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = Arc::new(command::resolve_tool(&self.pyspy_tool)?);
        let window = ctx.window.clone();
        let storage_dir = self.storage_dir.clone();
        let timeout = ctx.target_timeout();
        let cancel = ctx.cancel.clone();

        let profile_one = move |desc: ProcessDescriptor| {
            let tool_path = Arc::clone(&tool_path);
            let storage_dir = storage_dir.clone();
            let cancel = cancel.clone();
            let window = window.clone();
            async move {
                let output_path =
                    storage_dir.join(format!("pyspy.{}.{}.col", window.index, desc.pid));
                let args = vec![
                    "record".to_string(),
                    "-r".to_string(),
                    window.frequency.to_string(),
                    "-d".to_string(),
                    window.duration.as_secs().max(1).to_string(),
                    "--nonblocking".to_string(),
                    "--format".to_string(),
                    "raw".to_string(),
                    "--output".to_string(),
                    output_path.display().to_string(),
                    "-p".to_string(),
                    desc.pid.to_string(),
                    "--full-filenames".to_string(),
                ];

                if let Err(err) = run_tool(&tool_path, &args, timeout, &cancel).await {
                    return Err(classify_pyspy_error(desc.pid, err));
                }

                let text = std::fs::read_to_string(&output_path)
                    .map_err(|_| DriverError::MissingOutput(output_path.clone()))?;
                let _ = std::fs::remove_file(&output_path);

                let (stacks, stats) = collapse::parse_collapsed(&text, FrameKind::Python);
                if stats.exceeds_threshold() {
                    return Err(DriverError::UnparseableOutput {
                        tool: "py-spy".to_string(),
                        malformed: stats.malformed,
                        total: stats.total,
                    });
                }
                Ok(stacks)
            }
        };

        let (profile, _failures) = run_per_target(ctx, targets, MAX_PER_DRIVER, profile_one).await;
        Ok(profile)
    }
}

async fn probe_pyperf(tool: &str, ctx: &WindowContext) -> Result<(), DriverError> {
    let tool_path = command::resolve_tool(tool)?;
    run_tool(&tool_path, &["--check".to_string()], PROBE_TIMEOUT, &ctx.cancel).await.map_err(
        |err| DriverError::ProbeFailed { tool: tool.to_string(), reason: err.to_string() },
    )?;
    Ok(())
}

/// py-spy exits nonzero both when the target vanished and when attaching
/// was refused; tell them apart so the supervisor books them correctly.
fn classify_pyspy_error(pid: Pid, err: DriverError) -> DriverError {
    match err {
        DriverError::ChildFailed { stderr_tail, .. } => {
            if stderr_tail.contains("No such process") || stderr_tail.contains("process exited") {
                DriverError::TargetGone(pid)
            } else {
                DriverError::AttachFailed { pid, reason: stderr_tail }
            }
        }
        other => other,
    }
}

// ── streaming sampler ────────────────────────────────────────────────────

struct EbpfSampler {
    child: std::process::Child,
    rx: Receiver<StreamSample>,
    /// Samples drained from the channel but belonging to a future window.
    pending: Vec<StreamSample>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl EbpfSampler {
    fn spawn(tool_path: &Path, frequency: u32) -> Result<Self, DriverError> {
        let mut cmd = std::process::Command::new(tool_path);
        cmd.arg("-F")
            .arg(frequency.to_string())
            .arg("-o")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        configure_std_child(&mut cmd);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout piped");

        let (tx, rx) = bounded(STREAM_CHANNEL_CAPACITY);
        let reader = std::thread::Builder::new()
            .name("pyperf-reader".to_string())
            .spawn(move || {
                let mut dropped: u64 = 0;
                for line in std::io::BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    let Some((pid, stack, count)) =
                        collapse::parse_pid_folded_line(&line, FrameKind::Python)
                    else {
                        continue;
                    };
                    let sample = StreamSample { at: Instant::now(), pid, stack, count };
                    if tx.try_send(sample).is_err() {
                        dropped += 1;
                        if dropped % 1000 == 1 {
                            log::warn!("python stream buffer full, dropped {dropped} samples so far");
                        }
                    }
                }
            })?;

        Ok(EbpfSampler { child, rx, pending: Vec::new(), reader: Some(reader) })
    }

    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn exit_error(&mut self) -> DriverError {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.code().unwrap_or(-1),
            _ => -1,
        };
        DriverError::ChildFailed {
            tool: "pyperf".to_string(),
            status,
            stderr_tail: "streaming sampler exited".to_string(),
        }
    }

    /// Slice the stream to `[start, end]` by sample timestamp. Samples
    /// before the window are stale leftovers and dropped; samples after it
    /// stay pending for the next window.
    fn collect_window(&mut self, start: Instant, end: Instant) -> PartialProfile {
        while let Ok(sample) = self.rx.try_recv() {
            self.pending.push(sample);
        }
        slice_window(&mut self.pending, start, end)
    }

    fn kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            signal_group(self.child.id(), libc::SIGTERM);
            // Escalate if the sampler lingers; this runs only at shutdown.
            let mut waited = Duration::ZERO;
            while waited < super::command::ESCALATION_TIMEOUT {
                if !matches!(self.child.try_wait(), Ok(None)) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
                waited += Duration::from_millis(100);
            }
            if matches!(self.child.try_wait(), Ok(None)) {
                signal_group(self.child.id(), libc::SIGKILL);
            }
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for EbpfSampler {
    fn drop(&mut self) {
        self.kill();
    }
}

fn slice_window(pending: &mut Vec<StreamSample>, start: Instant, end: Instant) -> PartialProfile {
    let mut profile = PartialProfile::new();
    let mut later = Vec::new();

    for sample in pending.drain(..) {
        if sample.at < start {
            continue;
        }
        if sample.at > end {
            later.push(sample);
            continue;
        }
        profile.entry(sample.pid).or_default().add(sample.stack, sample.count);
    }

    *pending = later;
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Frame;

    fn sample(at: Instant, pid: u32, sym: &str, count: u64) -> StreamSample {
        StreamSample {
            at,
            pid: Pid(pid),
            stack: Stack::new(vec![Frame::new(sym, FrameKind::Python)]),
            count,
        }
    }

    #[test]
    fn test_slice_window_by_timestamp() {
        let t0 = Instant::now();
        let start = t0 + Duration::from_secs(10);
        let end = t0 + Duration::from_secs(20);

        let mut pending = vec![
            sample(t0 + Duration::from_secs(5), 1, "stale", 1),
            sample(t0 + Duration::from_secs(12), 1, "in_window", 2),
            sample(t0 + Duration::from_secs(19), 2, "also_in", 3),
            sample(t0 + Duration::from_secs(25), 2, "next_window", 4),
        ];

        let profile = slice_window(&mut pending, start, end);
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[&Pid(1)].total(), 2);
        assert_eq!(profile[&Pid(2)].total(), 3);

        // The future sample stays buffered for the next slice.
        assert_eq!(pending.len(), 1);
        let next = slice_window(&mut pending, end, end + Duration::from_secs(10));
        assert_eq!(next[&Pid(2)].total(), 4);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_slice_window_same_stack_accumulates() {
        let t0 = Instant::now();
        let mut pending = vec![
            sample(t0 + Duration::from_secs(1), 1, "f", 2),
            sample(t0 + Duration::from_secs(2), 1, "f", 5),
        ];
        let profile = slice_window(&mut pending, t0, t0 + Duration::from_secs(3));
        assert_eq!(profile[&Pid(1)].total(), 7);
        assert_eq!(profile[&Pid(1)].len(), 1);
    }

    #[test]
    fn test_auto_mode_reports_native_frames_until_decided() {
        let driver =
            PythonDriver::new(DriverMode::Auto, "pyperf", "py-spy", PathBuf::from("/tmp"));
        assert!(driver.emits_native_frames());

        let attach =
            PythonDriver::new(DriverMode::Attach, "pyperf", "py-spy", PathBuf::from("/tmp"));
        assert!(!attach.emits_native_frames());
    }

    #[test]
    fn test_disabled_mode_machine_state() {
        let mut driver =
            PythonDriver::new(DriverMode::Disabled, "pyperf", "py-spy", PathBuf::from("/tmp"));
        assert_eq!(driver.machine.poll(), super::super::DriverState::Disabled);
    }

    #[test]
    fn test_classify_pyspy_error() {
        let gone = classify_pyspy_error(
            Pid(9),
            DriverError::ChildFailed { tool: "py-spy".into(), status: 1, stderr_tail: "Error: process exited".into() },
        );
        assert!(matches!(gone, DriverError::TargetGone(_)));

        let attach = classify_pyspy_error(
            Pid(9),
            DriverError::ChildFailed { tool: "py-spy".into(), status: 1, stderr_tail: "permission denied".into() },
        );
        assert!(matches!(attach, DriverError::AttachFailed { .. }));
    }
}
