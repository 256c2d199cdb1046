//! System-wide native sampler, driving `perf`.
//!
//! One `perf record -a -g` per window, bounded by the window duration via
//! its `sleep` payload; the `perf script` post-processing pass is allowed
//! past the sampling deadline. Output parsing and the malformed-line
//! threshold live in [`crate::collapse`].

use std::path::PathBuf;
use std::time::Duration;

use crate::collapse;
use crate::domain::{DriverError, PartialProfile, ProcessDescriptor};

use super::command::{self, run_tool};
use super::{StateMachine, WindowContext};

/// Slack on top of the window duration for perf to start and flush.
const RECORD_EXTRA_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound for the post-processing `perf script` pass.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct PerfDriver {
    pub machine: StateMachine,
    tool: String,
    storage_dir: PathBuf,
}

impl PerfDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, storage_dir: PathBuf) -> Self {
        PerfDriver { machine: StateMachine::new(true), tool: tool.into(), storage_dir }
    }

    /// The system sampler covers the whole host; the target list is only
    /// relevant to runtime drivers.
    pub(crate) async fn collect(
        &mut self,
        ctx: &WindowContext,
        _targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = command::resolve_tool(&self.tool)?;
        let data_file = self.storage_dir.join(format!("perf.{}.data", ctx.window.index));
        let duration_secs = ctx.window.duration.as_secs().max(1);

        let record_args = vec![
            "record".to_string(),
            "-F".to_string(),
            ctx.window.frequency.to_string(),
            "-a".to_string(),
            "-g".to_string(),
            "-o".to_string(),
            data_file.display().to_string(),
            "--".to_string(),
            "sleep".to_string(),
            duration_secs.to_string(),
        ];
        let record_timeout = ctx.window.duration + RECORD_EXTRA_TIMEOUT;
        run_tool(&tool_path, &record_args, record_timeout, &ctx.cancel).await?;

        if !data_file.is_file() {
            return Err(DriverError::MissingOutput(data_file));
        }

        let script_args = vec![
            "script".to_string(),
            "-F".to_string(),
            "+pid".to_string(),
            "-i".to_string(),
            data_file.display().to_string(),
        ];
        let script = run_tool(&tool_path, &script_args, SCRIPT_TIMEOUT, &ctx.cancel).await;
        // The record file is large; remove it regardless of script success.
        let _ = std::fs::remove_file(&data_file);
        let script = script?;

        let (profile, stats) = collapse::parse_perf_script(&script.stdout);
        if stats.exceeds_threshold() {
            return Err(DriverError::UnparseableOutput {
                tool: self.tool.clone(),
                malformed: stats.malformed,
                total: stats.total,
            });
        }
        Ok(profile)
    }
}
