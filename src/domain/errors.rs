//! Structured error types for the agent
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Driver errors carry a severity classification: the supervisor turns them
//! into driver state transitions, never into window failures.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::types::Pid;

/// Severity of a driver failure, deciding the state transition it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing kernel feature, missing executable, permission denied.
    /// Surfaced once; the driver goes to Disabled or PermanentlyFailed.
    Environmental,
    /// One target was lost (died, attach race); excluded from this window
    /// only, the driver itself stays healthy.
    TargetTransient,
    /// The whole driver window failed (timeout, unparseable aggregate
    /// output); triggers Backoff and marks the window degraded.
    WindowTransient,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("profiler executable {tool:?} not found")]
    MissingExecutable { tool: String },

    #[error("{tool}: unsupported architecture {arch}")]
    UnsupportedArchitecture { tool: String, arch: String },

    #[error("{tool}: readiness probe failed: {reason}")]
    ProbeFailed { tool: String, reason: String },

    #[error("target process {0} exited before profiling started")]
    TargetGone(Pid),

    #[error("failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: Pid, reason: String },

    #[error("{tool} exited with {status}: {stderr_tail}")]
    ChildFailed { tool: String, status: i32, stderr_tail: String },

    #[error("{tool} did not finish within {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool}: {malformed} of {total} output lines malformed")]
    UnparseableOutput { tool: String, malformed: usize, total: usize },

    #[error("output file {0} was not produced")]
    MissingOutput(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Map this error onto the failure taxonomy.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DriverError::MissingExecutable { .. }
            | DriverError::UnsupportedArchitecture { .. }
            | DriverError::ProbeFailed { .. } => FailureKind::Environmental,
            DriverError::TargetGone(_) | DriverError::AttachFailed { .. } => {
                FailureKind::TargetTransient
            }
            DriverError::ChildFailed { .. }
            | DriverError::Timeout { .. }
            | DriverError::UnparseableOutput { .. }
            | DriverError::MissingOutput(_)
            | DriverError::Cancelled
            | DriverError::Io(_) => FailureKind::WindowTransient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::MissingExecutable { tool: "perf".to_string() };
        assert_eq!(err.to_string(), "profiler executable \"perf\" not found");
    }

    #[test]
    fn test_failure_kind_mapping() {
        let env = DriverError::ProbeFailed { tool: "pyperf".into(), reason: "EPERM".into() };
        assert_eq!(env.failure_kind(), FailureKind::Environmental);

        let target = DriverError::TargetGone(Pid(42));
        assert_eq!(target.failure_kind(), FailureKind::TargetTransient);

        let window =
            DriverError::Timeout { tool: "perf".into(), timeout: Duration::from_secs(60) };
        assert_eq!(window.failure_kind(), FailureKind::WindowTransient);
    }

    #[test]
    fn test_unparseable_output_display() {
        let err = DriverError::UnparseableOutput { tool: "phpspy".into(), malformed: 7, total: 100 };
        assert!(err.to_string().contains("7 of 100"));
    }
}
