//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a raw thread id
//! where a process id is expected, and make function signatures expressive.
//! The stack/sample types define the currency every sub-profiler driver
//! trades in: counters of leaf-first frame sequences, keyed by process.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Process ID
///
/// Host-namespace process ID as seen under `/proc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Pid(pid)
    }
}

/// Opaque process start-time token from `/proc/<pid>/stat` (field 22,
/// clock ticks since boot).
///
/// Two observations of the same pid refer to the same process incarnation
/// only when their tokens are equal; late results carrying a stale token
/// belong to a reused pid and must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartTimeToken(pub u64);

/// Runtime classification of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuntimeKind {
    /// No managed runtime detected; profiled by the system sampler only.
    #[default]
    Native,
    Java,
    Python,
    Ruby,
    Php,
    Node,
    DotNet,
    /// Classification was attempted but the evidence is contradictory.
    Unknown,
}

impl RuntimeKind {
    /// Stable lowercase name, used in logs and per-runtime CLI flags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Native => "native",
            RuntimeKind::Java => "java",
            RuntimeKind::Python => "python",
            RuntimeKind::Ruby => "ruby",
            RuntimeKind::Php => "php",
            RuntimeKind::Node => "node",
            RuntimeKind::DotNet => "dotnet",
            RuntimeKind::Unknown => "unknown",
        }
    }

    /// Runtimes that have a dedicated driver (everything except
    /// Native/Unknown, which are covered by the system sampler alone).
    #[must_use]
    pub fn has_runtime_driver(self) -> bool {
        !matches!(self, RuntimeKind::Native | RuntimeKind::Unknown)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a single stack frame.
///
/// Assigned once by the driver that produced the frame and never changed
/// afterwards. Determines the suffix appended to the symbol on artifact
/// emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Native,
    Kernel,
    Java,
    Python,
    /// Native frames interleaved into a Python stack by the eBPF sampler.
    PythonNative,
    Ruby,
    Php,
    Node,
    DotNet,
    /// Synthetic label frames (comm, container, appid) added by the merger.
    Label,
}

impl FrameKind {
    /// Artifact suffix for this provenance.
    ///
    /// Native, Java and Node frames are emitted bare: native is the
    /// baseline, and the Java/Node samplers emit symbols that are already
    /// self-describing.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            FrameKind::Kernel => "_[k]",
            FrameKind::Python => "_[p]",
            FrameKind::PythonNative => "_[pn]",
            FrameKind::Ruby => "_[rb]",
            FrameKind::Php => "_[php]",
            FrameKind::DotNet => "_[net]",
            FrameKind::Native | FrameKind::Java | FrameKind::Node | FrameKind::Label => "",
        }
    }
}

/// One stack frame: symbol text plus provenance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub symbol: String,
    pub kind: FrameKind,
}

impl Frame {
    pub fn new(symbol: impl Into<String>, kind: FrameKind) -> Self {
        Frame { symbol: symbol.into(), kind }
    }
}

/// An ordered sequence of frames, leaf (callee) first.
///
/// The artifact renders stacks root-first; the reversal happens at emission
/// time only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Stack(pub Vec<Frame>);

impl Stack {
    #[must_use]
    pub fn new(frames: Vec<Frame>) -> Self {
        Stack(frames)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate frames leaf-first.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.0.iter()
    }
}

/// Multi-set of `(stack, count)` pairs for one process in one window.
///
/// Insertion order is irrelevant; equal stacks accumulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackCounts {
    counts: HashMap<Stack, u64>,
}

impl StackCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stack: Stack, count: u64) {
        if count == 0 {
            return;
        }
        *self.counts.entry(stack).or_insert(0) += count;
    }

    /// Sum samples across every recorded stack into this one.
    pub fn merge(&mut self, other: StackCounts) {
        for (stack, count) in other.counts {
            self.add(stack, count);
        }
    }

    /// Total sample count across all stacks.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stack, u64)> {
        self.counts.iter().map(|(s, c)| (s, *c))
    }

    #[must_use]
    pub fn get(&self, stack: &Stack) -> Option<u64> {
        self.counts.get(stack).copied()
    }
}

impl IntoIterator for StackCounts {
    type Item = (Stack, u64);
    type IntoIter = std::collections::hash_map::IntoIter<Stack, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.counts.into_iter()
    }
}

impl FromIterator<(Stack, u64)> for StackCounts {
    fn from_iter<T: IntoIterator<Item = (Stack, u64)>>(iter: T) -> Self {
        let mut counts = StackCounts::new();
        for (stack, count) in iter {
            counts.add(stack, count);
        }
        counts
    }
}

/// Result of one sub-profiler run for one window, keyed by process id.
pub type PartialProfile = HashMap<Pid, StackCounts>;

/// Snapshot record for one live process.
///
/// Created at window-snapshot time and discarded at window end; there is no
/// long-term process identity in the agent.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub pid: Pid,
    pub ppid: Pid,
    pub start_time: StartTimeToken,
    /// Command name from `/proc/<pid>/stat` (comm field).
    pub comm: String,
    /// Full command line, NUL-split.
    pub cmdline: Vec<String>,
    pub exe_path: PathBuf,
    /// Basenames of mapped shared objects, for runtime detection.
    pub module_sonames: Vec<String>,
    /// Container identity; empty when not containerized.
    pub container_id: String,
    pub pid_ns: Option<u64>,
    pub mnt_ns: Option<u64>,
    pub runtime: RuntimeKind,
    pub runtime_version: Option<String>,
    /// Human-readable application identity; empty when no rule matched.
    pub appid: String,
}

impl ProcessDescriptor {
    /// Executable basename, empty when the path has none.
    #[must_use]
    pub fn exe_basename(&self) -> &str {
        self.exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }
}

/// Parameters of one sampling window, shared by every driver.
#[derive(Debug, Clone)]
pub struct Window {
    /// Monotonic index, starting at 0 for the first window of a run.
    pub index: u64,
    /// Wall-clock start for the artifact preamble.
    pub start_time: DateTime<Utc>,
    /// Monotonic start for deadline arithmetic.
    pub started_at: Instant,
    pub duration: Duration,
    /// Sampling frequency in Hz.
    pub frequency: u32,
}

impl Window {
    /// The instant past which sampling must have stopped.
    /// Post-processing may run beyond it.
    #[must_use]
    pub fn sampling_deadline(&self) -> Instant {
        self.started_at + self.duration
    }
}

/// Operating mode of a runtime driver, settable per runtime from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverMode {
    #[default]
    Auto,
    Ebpf,
    Attach,
    Disabled,
}

impl FromStr for DriverMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DriverMode::Auto),
            "ebpf" => Ok(DriverMode::Ebpf),
            "attach" => Ok(DriverMode::Attach),
            "disabled" => Ok(DriverMode::Disabled),
            other => Err(format!("unknown driver mode {other:?} (expected auto/ebpf/attach/disabled)")),
        }
    }
}

impl fmt::Display for DriverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverMode::Auto => "auto",
            DriverMode::Ebpf => "ebpf",
            DriverMode::Attach => "attach",
            DriverMode::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sym: &str) -> Frame {
        Frame::new(sym, FrameKind::Native)
    }

    #[test]
    fn test_stack_counts_accumulate() {
        let mut counts = StackCounts::new();
        let stack = Stack::new(vec![frame("a"), frame("b")]);
        counts.add(stack.clone(), 3);
        counts.add(stack.clone(), 4);
        assert_eq!(counts.get(&stack), Some(7));
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_stack_counts_zero_ignored() {
        let mut counts = StackCounts::new();
        counts.add(Stack::new(vec![frame("a")]), 0);
        assert!(counts.is_empty());
    }

    #[test]
    fn test_stack_counts_merge_sums() {
        let stack_a = Stack::new(vec![frame("a")]);
        let stack_b = Stack::new(vec![frame("b")]);

        let mut left = StackCounts::new();
        left.add(stack_a.clone(), 2);
        let mut right = StackCounts::new();
        right.add(stack_a.clone(), 5);
        right.add(stack_b.clone(), 1);

        left.merge(right);
        assert_eq!(left.get(&stack_a), Some(7));
        assert_eq!(left.get(&stack_b), Some(1));
        assert_eq!(left.total(), 8);
    }

    #[test]
    fn test_frame_suffixes() {
        assert_eq!(FrameKind::Kernel.suffix(), "_[k]");
        assert_eq!(FrameKind::Python.suffix(), "_[p]");
        assert_eq!(FrameKind::PythonNative.suffix(), "_[pn]");
        assert_eq!(FrameKind::Ruby.suffix(), "_[rb]");
        assert_eq!(FrameKind::Php.suffix(), "_[php]");
        assert_eq!(FrameKind::DotNet.suffix(), "_[net]");
        assert_eq!(FrameKind::Native.suffix(), "");
        assert_eq!(FrameKind::Node.suffix(), "");
        assert_eq!(FrameKind::Label.suffix(), "");
    }

    #[test]
    fn test_driver_mode_parse() {
        assert_eq!("auto".parse::<DriverMode>().unwrap(), DriverMode::Auto);
        assert_eq!("EBPF".parse::<DriverMode>().unwrap(), DriverMode::Ebpf);
        assert_eq!("Attach".parse::<DriverMode>().unwrap(), DriverMode::Attach);
        assert_eq!("disabled".parse::<DriverMode>().unwrap(), DriverMode::Disabled);
        assert!("on".parse::<DriverMode>().is_err());
    }

    #[test]
    fn test_runtime_kind_driver_eligibility() {
        assert!(RuntimeKind::Java.has_runtime_driver());
        assert!(RuntimeKind::Python.has_runtime_driver());
        assert!(!RuntimeKind::Native.has_runtime_driver());
        assert!(!RuntimeKind::Unknown.has_runtime_driver());
    }
}
