//! Node driver: per-process `perf` sampling.
//!
//! V8 publishes JIT symbol maps (`--perf-basic-prof` /
//! `/tmp/perf-<pid>.map`), which `perf script` resolves on its own, so the
//! per-process native sampler already yields meaningful JavaScript frames
//! with no in-agent symbolication. User-space frames are re-tagged with
//! Node provenance (kernel frames keep theirs); the artifact emits both
//! bare.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::collapse;
use crate::domain::{
    DriverError, Frame, FrameKind, PartialProfile, ProcessDescriptor, Stack, StackCounts,
};

use super::command::{self, run_tool};
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NodeDriver {
    pub machine: StateMachine,
    tool: String,
    storage_dir: PathBuf,
}

impl NodeDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, storage_dir: PathBuf, enabled: bool) -> Self {
        NodeDriver { machine: StateMachine::new(enabled), tool: tool.into(), storage_dir }
    }

    pub(crate) async fn collect(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = Arc::new(command::resolve_tool(&self.tool)?);
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
                let data_file =
                    storage_dir.join(format!("perf-node.{}.{}.data", window.index, desc.pid));
                let record_args = vec![
                    "record".to_string(),
                    "-F".to_string(),
                    window.frequency.to_string(),
                    "-g".to_string(),
                    "-p".to_string(),
                    desc.pid.to_string(),
                    "-o".to_string(),
                    data_file.display().to_string(),
                    "--".to_string(),
                    "sleep".to_string(),
                    window.duration.as_secs().max(1).to_string(),
                ];
                if let Err(err) = run_tool(&tool_path, &record_args, timeout, &cancel).await {
                    // perf record -p fails outright when the pid is gone.
                    return Err(match err {
                        DriverError::ChildFailed { stderr_tail, .. } => {
                            DriverError::AttachFailed { pid: desc.pid, reason: stderr_tail }
                        }
                        other => other,
                    });
                }

                let script_args = vec![
                    "script".to_string(),
                    "-F".to_string(),
                    "+pid".to_string(),
                    "-i".to_string(),
                    data_file.display().to_string(),
                ];
                let script = run_tool(&tool_path, &script_args, SCRIPT_TIMEOUT, &cancel).await;
                let _ = std::fs::remove_file(&data_file);
                let script = script?;

                let (mut profile, stats) = collapse::parse_perf_script(&script.stdout);
                if stats.exceeds_threshold() {
                    return Err(DriverError::UnparseableOutput {
                        tool: "perf".to_string(),
                        malformed: stats.malformed,
                        total: stats.total,
                    });
                }

                let stacks = profile.remove(&desc.pid).unwrap_or_default();
                Ok(retag_node_frames(stacks))
            }
        };

        let (profile, _failures) = run_per_target(ctx, targets, MAX_PER_DRIVER, profile_one).await;
        Ok(profile)
    }
}

/// Mark user-space frames as Node provenance; kernel frames keep theirs.
fn retag_node_frames(stacks: StackCounts) -> StackCounts {
    stacks
        .into_iter()
        .map(|(stack, count)| {
            let frames = stack
                .0
                .into_iter()
                .map(|frame| match frame.kind {
                    FrameKind::Native => Frame { symbol: frame.symbol, kind: FrameKind::Node },
                    _ => frame,
                })
                .collect();
            (Stack::new(frames), count)
        })
        .collect()
}
