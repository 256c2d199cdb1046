//! # hostscope — continuous whole-host sampling profiler
//!
//! hostscope merges CPU stack traces collected by several independent
//! sub-profilers into a single unified view per sampling window, and writes
//! that view locally and/or ships it to a submission sink.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Session Scheduler                          │
//! │            window N starts at t0 + N * interval                 │
//! └───────────────┬─────────────────────────────────────────────────┘
//!                 │ tick
//!                 ▼
//! ┌──────────────────────┐     ┌──────────────────────────────┐
//! │   Process Registry   │────▶│ Classifier + App Identifier  │
//! │   (/proc snapshot)   │     │ (runtime kind, appid labels) │
//! └──────────────────────┘     └──────────────┬───────────────┘
//!                                             │ descriptors
//!                                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Supervisor                              │
//! │   parallel fan-out, shared deadline, failure isolation          │
//! │                                                                 │
//! │   ┌──────┐ ┌──────┐ ┌────────┐ ┌──────┐ ┌─────┐ ┌──────┐      │
//! │   │ perf │ │ java │ │ python │ │ ruby │ │ php │ │ .NET │ ...  │
//! │   └──┬───┘ └──┬───┘ └───┬────┘ └──┬───┘ └──┬──┘ └──┬───┘      │
//! └──────┼────────┼─────────┼─────────┼────────┼───────┼───────────┘
//!        │        └────── partial profiles ────┴───────┘
//!        ▼                 ▼
//! ┌──────────────────────────────┐     ┌──────────────────────────┐
//! │           Merger             │────▶│     Artifact Emitter     │
//! │  scale / replace / label     │     │  folded file + sink(s)   │
//! └──────────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`registry`]: per-window `/proc` snapshot with container identity
//! - [`classify`]: per-process runtime classification (ordered rules)
//! - [`appid`]: human-readable application identity extraction
//! - [`drivers`]: one driver per sampler behind a uniform contract, with
//!   the Disabled/Ready/Running/Backoff/PermanentlyFailed state machine
//! - [`supervisor`]: per-window parallel fan-out with a shared deadline
//! - [`collapse`]: sampler output parsing into canonical partial profiles
//! - [`merge`]: native/runtime stack fusion (scaling, replacement, labels)
//! - [`session`]: the periodic window loop and shutdown sequencing
//! - [`artifact`]: folded-stacks artifact rendering, atomic local output
//! - [`sink`]: submission abstraction with bounded retry
//! - [`procview`], [`hostmeta`], [`domain`], [`cli`]: supporting cast
//!
//! The profilers themselves are external executables; hostscope
//! orchestrates them, it never samples or symbolizes on its own.

pub mod appid;
pub mod artifact;
pub mod classify;
pub mod cli;
pub mod collapse;
pub mod domain;
pub mod drivers;
pub mod hostmeta;
pub mod merge;
pub mod procview;
pub mod registry;
pub mod session;
pub mod sink;
pub mod supervisor;
