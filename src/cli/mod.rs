//! CLI argument parsing and validation.

pub mod args;

pub use args::{Args, RuntimeModes};
