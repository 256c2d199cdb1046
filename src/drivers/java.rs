//! Java driver: per-JVM async-profiler attach.
//!
//! Each target JVM gets one `asprof` run per window, producing a collapsed
//! file. Attaching injects an agent library into the target, which can fail
//! persistently on some JVMs (custom launchers, hardened configs, agents
//! already loaded). To avoid probe storms, a JVM that fails attach
//! [`ATTACH_DENYLIST_THRESHOLD`] windows in a row is denylisted for the
//! rest of the agent's life, keyed by (pid, start-time token) so a reused
//! pid gets a fresh chance.
//!
//! The denylist is owned and written here only; the supervisor observes it
//! through [`JavaDriver::denylist_len`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::collapse;
use crate::domain::{
    DriverError, FrameKind, PartialProfile, Pid, ProcessDescriptor, StartTimeToken,
};

use super::command::{self, run_tool};
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};

/// Consecutive attach failures before a JVM is denylisted.
pub const ATTACH_DENYLIST_THRESHOLD: u32 = 3;

type JvmKey = (Pid, StartTimeToken);

pub struct JavaDriver {
    pub machine: StateMachine,
    tool: String,
    storage_dir: PathBuf,
    attach_failures: HashMap<JvmKey, u32>,
    denylist: HashSet<JvmKey>,
}

impl JavaDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, storage_dir: PathBuf, enabled: bool) -> Self {
        JavaDriver {
            machine: StateMachine::new(enabled),
            tool: tool.into(),
            storage_dir,
            attach_failures: HashMap::new(),
            denylist: HashSet::new(),
        }
    }

    #[must_use]
    pub fn denylist_len(&self) -> usize {
        self.denylist.len()
    }

    #[must_use]
    pub fn is_denylisted(&self, desc: &ProcessDescriptor) -> bool {
        self.denylist.contains(&(desc.pid, desc.start_time))
    }

    pub(crate) async fn collect(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = Arc::new(command::resolve_tool(&self.tool)?);

        let targets: Vec<_> = targets
            .into_iter()
            .filter(|desc| {
                let denied = self.is_denylisted(desc);
                if denied {
                    log::debug!("skipping denylisted JVM {} this window", desc.pid);
                }
                !denied
            })
            .collect();
        if targets.is_empty() {
            return Ok(PartialProfile::new());
        }

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
                    storage_dir.join(format!("asprof.{}.{}.col", window.index, desc.pid));
                // interval in ns; async-profiler takes an interval, not Hz
                let interval_ns = 1_000_000_000u64 / u64::from(window.frequency.max(1));
                let args = vec![
                    "-e".to_string(),
                    "cpu".to_string(),
                    "-d".to_string(),
                    window.duration.as_secs().max(1).to_string(),
                    "-i".to_string(),
                    interval_ns.to_string(),
                    "-o".to_string(),
                    "collapsed".to_string(),
                    "-f".to_string(),
                    output_path.display().to_string(),
                    desc.pid.to_string(),
                ];

                let run = run_tool(&tool_path, &args, timeout, &cancel).await;
                if let Err(err) = run {
                    return Err(classify_attach_error(desc.pid, err));
                }

                let text = std::fs::read_to_string(&output_path)
                    .map_err(|_| DriverError::MissingOutput(output_path.clone()))?;
                let _ = std::fs::remove_file(&output_path);

                let (stacks, stats) = collapse::parse_collapsed(&text, FrameKind::Java);
                if stats.exceeds_threshold() {
                    return Err(DriverError::UnparseableOutput {
                        tool: "asprof".to_string(),
                        malformed: stats.malformed,
                        total: stats.total,
                    });
                }
                Ok(stacks)
            }
        };

        let (profile, failures) =
            run_per_target(ctx, targets.clone(), MAX_PER_DRIVER, profile_one).await;

        self.record_attach_failures(&targets, &failures);
        Ok(profile)
    }

    /// Count consecutive attach failures per JVM and denylist repeat
    /// offenders. A successful window clears the JVM's failure count.
    fn record_attach_failures(
        &mut self,
        targets: &[ProcessDescriptor],
        failures: &[(Pid, DriverError)],
    ) {
        let failed: HashSet<Pid> = failures
            .iter()
            .filter(|(_, err)| matches!(err, DriverError::AttachFailed { .. }))
            .map(|(pid, _)| *pid)
            .collect();

        for desc in targets {
            let key = (desc.pid, desc.start_time);
            if failed.contains(&desc.pid) {
                let count = self.attach_failures.entry(key).or_insert(0);
                *count += 1;
                if *count >= ATTACH_DENYLIST_THRESHOLD {
                    log::warn!(
                        "JVM {} failed attach {count} windows in a row, denylisting it",
                        desc.pid
                    );
                    self.denylist.insert(key);
                    self.attach_failures.remove(&key);
                }
            } else {
                self.attach_failures.remove(&key);
            }
        }
    }
}

/// Attach-phase child failures are target-level, not driver-level: one
/// refusing JVM must not back off the whole driver.
fn classify_attach_error(pid: Pid, err: DriverError) -> DriverError {
    match err {
        DriverError::ChildFailed { stderr_tail, .. } => {
            if stderr_tail.contains("No such process") {
                DriverError::TargetGone(pid)
            } else {
                DriverError::AttachFailed { pid, reason: stderr_tail }
            }
        }
        DriverError::Timeout { tool, .. } => {
            DriverError::AttachFailed { pid, reason: format!("{tool} attach timed out") }
        }
        other => other,
    }
}
