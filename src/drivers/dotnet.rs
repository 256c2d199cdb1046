//! .NET driver: `dotnet-trace` per target, speedscope output.
//!
//! dotnet-trace talks to the runtime's diagnostics IPC socket, which
//! addresses the process by its pid *inside* its pid namespace, so the
//! nspid is resolved before spawning. The speedscope JSON it produces is
//! converted to stack counts in [`super::speedscope`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{DriverError, PartialProfile, Pid, ProcessDescriptor};
use crate::procview;

use super::command::{self, run_tool};
use super::speedscope::speedscope_to_stacks;
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};

pub struct DotNetDriver {
    pub machine: StateMachine,
    tool: String,
    storage_dir: PathBuf,
}

/// dotnet-trace wants `H:MM:SS`.
fn format_duration_hms(duration: Duration) -> String {
    let total = duration.as_secs().max(1);
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

impl DotNetDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, storage_dir: PathBuf, enabled: bool) -> Self {
        DotNetDriver { machine: StateMachine::new(enabled), tool: tool.into(), storage_dir }
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
                let nspid =
                    procview::read_nspid(desc.pid).map_err(|_| DriverError::TargetGone(desc.pid))?;
                let output_path =
                    storage_dir.join(format!("dotnet.{}.{}.speedscope.json", window.index, desc.pid));
                let args = vec![
                    "collect".to_string(),
                    "--format".to_string(),
                    "speedscope".to_string(),
                    "--process-id".to_string(),
                    nspid.to_string(),
                    "--profile".to_string(),
                    "cpu-sampling".to_string(),
                    "--duration".to_string(),
                    format_duration_hms(window.duration),
                    "--output".to_string(),
                    output_path.display().to_string(),
                ];

                if let Err(err) = run_tool(&tool_path, &args, timeout, &cancel).await {
                    return Err(classify_dotnet_error(desc.pid, err));
                }

                let json = std::fs::read_to_string(&output_path)
                    .map_err(|_| DriverError::MissingOutput(output_path.clone()))?;
                let _ = std::fs::remove_file(&output_path);

                speedscope_to_stacks(&json, window.frequency)
            }
        };

        let (profile, _failures) = run_per_target(ctx, targets, MAX_PER_DRIVER, profile_one).await;
        Ok(profile)
    }
}

fn classify_dotnet_error(pid: Pid, err: DriverError) -> DriverError {
    match err {
        DriverError::ChildFailed { stderr_tail, .. } => {
            DriverError::AttachFailed { pid, reason: stderr_tail }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_hms() {
        assert_eq!(format_duration_hms(Duration::from_secs(60)), "0:01:00");
        assert_eq!(format_duration_hms(Duration::from_secs(3661)), "1:01:01");
        assert_eq!(format_duration_hms(Duration::from_secs(5)), "0:00:05");
        // zero clamps to one second; dotnet-trace rejects 0:00:00
        assert_eq!(format_duration_hms(Duration::ZERO), "0:00:01");
    }
}
