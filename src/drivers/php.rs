//! PHP driver: `phpspy` one-shot per target and window.
//!
//! phpspy prints numbered frame blocks rather than folded lines:
//!
//! ```text
//! 0 Memcached::get /app/cache.php:41
//! 1 Cache::fetch /app/cache.php:12
//! 2 <main> /app/index.php:3
//! # pid = 455
//! ```
//!
//! Frame 0 is the leaf. Blocks end at a metadata comment or at the next
//! index-0 line; a broken index sequence invalidates the current block
//! only.

use std::sync::Arc;

use crate::domain::{
    DriverError, Frame, FrameKind, PartialProfile, Pid, ProcessDescriptor, Stack, StackCounts,
};

use super::command::{self, run_tool};
use super::{run_per_target, StateMachine, WindowContext, MAX_PER_DRIVER};
use crate::collapse::ParseStats;

pub struct PhpDriver {
    pub machine: StateMachine,
    tool: String,
}

impl PhpDriver {
    #[must_use]
    pub fn new(tool: impl Into<String>, enabled: bool) -> Self {
        PhpDriver { machine: StateMachine::new(enabled), tool: tool.into() }
    }

    pub(crate) async fn collect(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        let tool_path = Arc::new(command::resolve_tool(&self.tool)?);
        let window = ctx.window.clone();
        let timeout = ctx.target_timeout();
        let cancel = ctx.cancel.clone();

        let profile_one = move |desc: ProcessDescriptor| {
            let tool_path = Arc::clone(&tool_path);
            let cancel = cancel.clone();
            let window = window.clone();
            async move {
                let args = vec![
                    "-p".to_string(),
                    desc.pid.to_string(),
                    "-H".to_string(),
                    window.frequency.to_string(),
                    "--time-limit-ms".to_string(),
                    window.duration.as_millis().to_string(),
                ];

                let output = run_tool(&tool_path, &args, timeout, &cancel)
                    .await
                    .map_err(|err| classify_phpspy_error(desc.pid, err))?;

                let (stacks, stats) = parse_phpspy_output(&output.stdout);
                if stats.exceeds_threshold() {
                    return Err(DriverError::UnparseableOutput {
                        tool: "phpspy".to_string(),
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

fn classify_phpspy_error(pid: Pid, err: DriverError) -> DriverError {
    match err {
        DriverError::ChildFailed { stderr_tail, .. } => {
            DriverError::AttachFailed { pid, reason: stderr_tail }
        }
        other => other,
    }
}

/// Parse phpspy's numbered-frame output into stack counts.
///
/// Lines are either `<index> <frame text>`, metadata comments (`# ...`), or
/// blank. A block whose indices do not count up contiguously from 0 is
/// discarded and counted malformed.
fn parse_phpspy_output(text: &str) -> (StackCounts, ParseStats) {
    let mut counts = StackCounts::new();
    let mut stats = ParseStats::default();
    let mut current: Vec<Frame> = Vec::new();
    let mut broken = false;

    let mut flush = |frames: &mut Vec<Frame>, broken: &mut bool, counts: &mut StackCounts| {
        if !frames.is_empty() && !*broken {
            counts.add(Stack::new(std::mem::take(frames)), 1);
        } else {
            frames.clear();
        }
        *broken = false;
    };

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            flush(&mut current, &mut broken, &mut counts);
            continue;
        }

        let parsed = line
            .split_once(' ')
            .and_then(|(idx, rest)| idx.parse::<usize>().ok().map(|idx| (idx, rest.trim())));
        let Some((index, frame_text)) = parsed else {
            stats.record_malformed();
            broken = true;
            continue;
        };

        if index == 0 {
            // New sample begins; the previous block (if any) is complete.
            flush(&mut current, &mut broken, &mut counts);
        } else if index != current.len() {
            stats.record_malformed();
            broken = true;
            continue;
        }

        stats.record_ok();
        if !broken {
            current.push(Frame::new(frame_text, FrameKind::Php));
        }
    }
    flush(&mut current, &mut broken, &mut counts);

    (counts, stats)
}
