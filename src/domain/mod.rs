//! Core domain types and errors shared across the agent.

pub mod errors;
pub mod types;

pub use errors::{DriverError, FailureKind};
pub use types::{
    DriverMode, Frame, FrameKind, PartialProfile, Pid, ProcessDescriptor, RuntimeKind, Stack,
    StackCounts, StartTimeToken, Window,
};
