//! Profiling session scheduler: the periodic window loop.
//!
//! Window N starts at `t0 + N * interval`. Each window runs snapshot →
//! supervise → merge inline, then hands the artifact to a bounded emit
//! queue so a slow sink or disk never delays the next window's start. On
//! overflow the queue drops its *oldest* pending artifact — fresh data
//! beats stale data.
//!
//! Shutdown (SIGTERM/SIGINT) stops tick generation, cancels in-flight
//! drivers through the shared token, emits a best-effort final artifact
//! from whatever partials completed, and gives the emitter a bounded grace
//! to drain.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::artifact::{EmitJob, Emitter};
use crate::domain::{Pid, ProcessDescriptor, Window};
use crate::supervisor::Supervisor;
use crate::{appid, classify, merge, registry};

/// Wait this long for in-flight work and pending emits at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Pending artifacts allowed behind the emitter before the oldest is
/// dropped.
pub const EMIT_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The process snapshot source is unreadable and no driver produced
    /// any data in the first window; the host cannot be profiled at all.
    #[error("no process snapshot and no profiler produced data in the startup window")]
    StartupProbeFailed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub duration: Duration,
    pub interval: Duration,
    pub frequency: u32,
    pub continuous: bool,
}

#[derive(Debug, Default)]
pub struct SessionSummary {
    pub windows_run: u64,
    pub windows_degraded: u64,
}

pub struct Session {
    config: SessionConfig,
    supervisor: Supervisor,
    emitter: Arc<Emitter>,
    shutdown: CancellationToken,
}

impl Session {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        supervisor: Supervisor,
        emitter: Arc<Emitter>,
        shutdown: CancellationToken,
    ) -> Self {
        Session { config, supervisor, emitter, shutdown }
    }

    pub async fn run(&mut self) -> Result<SessionSummary, SessionError> {
        let queue = Arc::new(EmitQueue::new());
        let emit_task = {
            let queue = Arc::clone(&queue);
            let emitter = Arc::clone(&self.emitter);
            tokio::spawn(async move { emit_loop(queue, emitter).await })
        };

        let mut summary = SessionSummary::default();
        let mut ticker = tokio::time::interval(self.config.interval);

        let mut index: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.shutdown.cancelled() => break,
            }

            let window = Window {
                index,
                start_time: Utc::now(),
                started_at: Instant::now(),
                duration: self.config.duration,
                frequency: self.config.frequency,
            };
            log::info!("starting window {index} ({:?} at {} Hz)", window.duration, window.frequency);

            let mut snapshot = registry::snapshot();
            classify::annotate(&mut snapshot);
            appid::annotate(&mut snapshot);
            let snapshot_empty = snapshot.is_empty();

            let collection = self.supervisor.run(&window, &snapshot, &self.shutdown).await;
            let produced_any = !collection.native.is_empty()
                || collection.runtime.iter().any(|partial| !partial.profile.is_empty());

            let degraded = collection.degraded || snapshot_empty;
            for line in &collection.summaries {
                log::info!("window {index}: {line}");
            }
            log::info!(
                "window {index} finished (degraded={degraded}, processes={})",
                snapshot.len()
            );

            if index == 0 && snapshot_empty && !produced_any {
                // The agent cannot observe anything on this host.
                queue.close();
                let _ = emit_task.await;
                return Err(SessionError::StartupProbeFailed);
            }

            let descriptors: HashMap<Pid, ProcessDescriptor> =
                snapshot.into_iter().map(|desc| (desc.pid, desc)).collect();
            let merged = merge::merge_window(&descriptors, collection.native, collection.runtime);

            queue.push(EmitJob {
                start_time: window.start_time,
                end_time: Utc::now(),
                merged,
                descriptors,
                degraded,
            });

            summary.windows_run += 1;
            if degraded {
                summary.windows_degraded += 1;
            }
            index += 1;

            if !self.config.continuous || self.shutdown.is_cancelled() {
                break;
            }
        }

        log::info!(
            "stopping after {} windows ({} degraded)",
            summary.windows_run,
            summary.windows_degraded
        );
        self.supervisor.shutdown_drivers();

        queue.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, emit_task).await.is_err() {
            log::warn!("emitter did not drain within {SHUTDOWN_GRACE:?}, abandoning pending artifacts");
        }

        Ok(summary)
    }
}

// ── emit queue ───────────────────────────────────────────────────────────

/// Bounded FIFO between the window loop and the emitter task. Overflow
/// drops the oldest pending job.
struct EmitQueue {
    jobs: Mutex<VecDeque<EmitJob>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl EmitQueue {
    fn new() -> Self {
        EmitQueue {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, job: EmitJob) {
        {
            let mut jobs = self.jobs.lock().expect("emit queue poisoned");
            if jobs.len() >= EMIT_QUEUE_DEPTH {
                jobs.pop_front();
                log::warn!("emit queue full, dropping the oldest pending artifact");
            }
            jobs.push_back(job);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<EmitJob> {
        self.jobs.lock().expect("emit queue poisoned").pop_front()
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

async fn emit_loop(queue: Arc<EmitQueue>, emitter: Arc<Emitter>) {
    loop {
        if let Some(job) = queue.pop() {
            if let Err(e) = emitter.emit(job).await {
                log::error!("emitting artifact failed: {e:#}");
            }
            continue;
        }
        if queue.is_closed() {
            return;
        }
        queue.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(tag: u32) -> EmitJob {
        let mut descriptors = HashMap::new();
        descriptors.insert(
            Pid(tag),
            ProcessDescriptor {
                pid: Pid(tag),
                ppid: Pid(1),
                start_time: crate::domain::StartTimeToken(1),
                comm: "x".into(),
                cmdline: Vec::new(),
                exe_path: std::path::PathBuf::new(),
                module_sonames: Vec::new(),
                container_id: String::new(),
                pid_ns: None,
                mnt_ns: None,
                runtime: crate::domain::RuntimeKind::Native,
                runtime_version: None,
                appid: String::new(),
            },
        );
        EmitJob {
            start_time: Utc::now(),
            end_time: Utc::now(),
            merged: HashMap::new(),
            descriptors,
            degraded: false,
        }
    }

    #[test]
    fn test_emit_queue_drops_oldest_on_overflow() {
        let queue = EmitQueue::new();
        queue.push(job(1));
        queue.push(job(2));
        queue.push(job(3));

        // Depth is 2: job 1 was dropped, jobs 2 and 3 remain in order.
        let first = queue.pop().unwrap();
        assert!(first.descriptors.contains_key(&Pid(2)));
        let second = queue.pop().unwrap();
        assert!(second.descriptors.contains_key(&Pid(3)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_emit_queue_close_flag() {
        let queue = EmitQueue::new();
        assert!(!queue.is_closed());
        queue.close();
        assert!(queue.is_closed());
    }
}
