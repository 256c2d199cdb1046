//! Ruby driver: one `rbspy record` per target and window.
//!
//! rbspy emits interpreter-only stacks; the merger scales them against the
//! native sample counts for the process.

use std::path::PathBuf;
use std::sync::Arc;

use crate::collapse;
use crate::domain::{DriverError, FrameKind, PartialProfile, Pid, ProcessDescriptor};

use super::command::{self, run_tool};
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};

pub struct RubyDriver {
    pub machine: StateMachine,
    tool: String,
    storage_dir: PathBuf,
}

impl RubyDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, storage_dir: PathBuf, enabled: bool) -> Self {
        RubyDriver { machine: StateMachine::new(enabled), tool: tool.into(), storage_dir }
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
                let output_path =
                    storage_dir.join(format!("rbspy.{}.{}.col", window.index, desc.pid));
                let args = vec![
                    "record".to_string(),
                    "--silent".to_string(),
                    "-r".to_string(),
                    window.frequency.to_string(),
                    "-d".to_string(),
                    window.duration.as_secs().max(1).to_string(),
                    // don't pause the interpreter while collecting stacks
                    "--nonblocking".to_string(),
                    "--on-cpu".to_string(),
                    "--format=collapsed".to_string(),
                    "--file".to_string(),
                    output_path.display().to_string(),
                    // rbspy insists on writing a raw file; we never read it
                    "--raw-file".to_string(),
                    "/dev/null".to_string(),
                    "-p".to_string(),
                    desc.pid.to_string(),
                ];

                if let Err(err) = run_tool(&tool_path, &args, timeout, &cancel).await {
                    return Err(classify_rbspy_error(desc.pid, err));
                }

                let text = std::fs::read_to_string(&output_path)
                    .map_err(|_| DriverError::MissingOutput(output_path.clone()))?;
                let _ = std::fs::remove_file(&output_path);

                let (stacks, stats) = collapse::parse_collapsed(&text, FrameKind::Ruby);
                if stats.exceeds_threshold() {
                    return Err(DriverError::UnparseableOutput {
                        tool: "rbspy".to_string(),
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

fn classify_rbspy_error(pid: Pid, err: DriverError) -> DriverError {
    match err {
        DriverError::ChildFailed { stderr_tail, .. } => {
            if stderr_tail.contains("No such process") || stderr_tail.contains("exited") {
                DriverError::TargetGone(pid)
            } else {
                DriverError::AttachFailed { pid, reason: stderr_tail }
            }
        }
        other => other,
    }
}
