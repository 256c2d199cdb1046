//! Fusing native and runtime partial profiles into the window result.
//!
//! The system sampler sees every process, but for managed runtimes it
//! records interpreter internals (`_PyEval_EvalFrameDefault`, JIT
//! trampolines) that mean nothing to a user. Runtime profilers see the real
//! application frames but sample on their own clock. The merge reconciles
//! the two per process:
//!
//! * no runtime partial: native stacks pass through unchanged;
//! * interpreter-only runtime partial (attach-based samplers): the runtime
//!   stacks **replace** the native ones, *scaled* so the process keeps the
//!   CPU share the system sampler observed — merged totals equal the native
//!   totals;
//! * full native+runtime partial (the eBPF python sampler): it replaces the
//!   native stacks outright, since merging would double-count.
//!
//! Scaling preserves totals exactly: counts are floored and the rounding
//! residue goes to the largest bucket. Every merged stack is finally
//! labeled at the root end with the process command, container identity and
//! (when present) the appid frame.

use std::collections::HashMap;

use crate::domain::{
    Frame, FrameKind, PartialProfile, Pid, ProcessDescriptor, RuntimeKind, Stack, StackCounts,
};

/// One runtime driver's contribution to a window.
#[derive(Debug)]
pub struct RuntimePartial {
    pub runtime: RuntimeKind,
    pub profile: PartialProfile,
    /// True when these stacks carry their own native frames and replace the
    /// system sampler's stacks for their pids.
    pub replaces_native: bool,
}

/// Merge all partials for one window.
///
/// Only pids present in `descriptors` survive; anything else raced the
/// snapshot and is dropped. Processes with zero samples everywhere are
/// omitted entirely.
#[must_use]
pub fn merge_window(
    descriptors: &HashMap<Pid, ProcessDescriptor>,
    native: PartialProfile,
    runtime_partials: Vec<RuntimePartial>,
) -> HashMap<Pid, StackCounts> {
    let mut merged: HashMap<Pid, StackCounts> = native
        .into_iter()
        .filter(|(pid, stacks)| descriptors.contains_key(pid) && !stacks.is_empty())
        .collect();

    // Runtime stacks scaled against native totals (interpreter-only
    // samplers), summed across partials per pid.
    let mut scaled: HashMap<Pid, StackCounts> = HashMap::new();
    // Full-stack partials that replace native outright.
    let mut replacements: HashMap<Pid, StackCounts> = HashMap::new();

    for partial in runtime_partials {
        for (pid, stacks) in partial.profile {
            if stacks.is_empty() || !descriptors.contains_key(&pid) {
                continue;
            }
            if partial.replaces_native {
                replacements.entry(pid).or_default().merge(stacks);
            } else {
                // Without native samples for this pid there is no CPU share
                // to scale to; the runtime stacks are dropped with it.
                let Some(native_total) = merged.get(&pid).map(StackCounts::total) else {
                    continue;
                };
                scaled.entry(pid).or_default().merge(scale_counts(stacks, native_total));
            }
        }
    }

    // Swap in the runtime view where one exists; replacement wins over
    // scaling for the same pid (a driver cannot produce both).
    for (pid, stacks) in scaled {
        if !stacks.is_empty() {
            merged.insert(pid, stacks);
        }
    }
    for (pid, stacks) in replacements {
        merged.insert(pid, stacks);
    }

    // Root-end labels, then final cleanup of empty entries.
    let mut labeled = HashMap::with_capacity(merged.len());
    for (pid, stacks) in merged {
        if stacks.is_empty() {
            continue;
        }
        let desc = &descriptors[&pid];
        labeled.insert(pid, label_stacks(stacks, desc));
    }
    labeled
}

/// Scale stack counts to `target_total`, flooring each bucket and handing
/// the rounding residue to the largest bucket so totals match exactly.
#[must_use]
pub fn scale_counts(stacks: StackCounts, target_total: u64) -> StackCounts {
    let source_total = stacks.total();
    if source_total == 0 || source_total == target_total {
        return stacks;
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = target_total as f64 / source_total as f64;

    let mut scaled: Vec<(Stack, u64)> = Vec::with_capacity(stacks.len());
    let mut assigned: u64 = 0;
    let mut largest_index = 0usize;
    let mut largest_count: u64 = 0;

    for (index, (stack, count)) in stacks.into_iter().enumerate() {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let floored = ((count as f64) * ratio).floor() as u64;
        assigned += floored;
        if count > largest_count {
            largest_count = count;
            largest_index = index;
        }
        scaled.push((stack, floored));
    }

    let residue = target_total.saturating_sub(assigned);
    if residue > 0 && !scaled.is_empty() {
        scaled[largest_index].1 += residue;
    }

    scaled.into_iter().filter(|(_, count)| *count > 0).collect()
}

/// Append the root-end label frames: appid (innermost, when present), then
/// command, then container identity (outermost). The container frame is
/// kept even when empty so the artifact columns stay aligned.
fn label_stacks(stacks: StackCounts, desc: &ProcessDescriptor) -> StackCounts {
    stacks
        .into_iter()
        .map(|(stack, count)| {
            let mut frames = stack.0;
            if !desc.appid.is_empty() {
                frames.push(Frame::new(format!("appid: {}", desc.appid), FrameKind::Label));
            }
            frames.push(Frame::new(desc.comm.clone(), FrameKind::Label));
            frames.push(Frame::new(desc.container_id.clone(), FrameKind::Label));
            (Stack::new(frames), count)
        })
        .collect()
}
