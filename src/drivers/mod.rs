//! Sub-profiler drivers.
//!
//! Each driver wraps one external sampler behind a uniform contract: it
//! receives the window parameters and its target processes, and returns a
//! partial profile keyed by pid. Failures never escape as errors — they are
//! folded into the [`DriverOutcome`] and drive the per-driver state machine:
//!
//! ```text
//! Disabled --enable--> Ready
//! Ready --start--> Running
//! Running --success--> Ready
//! Running --transient failure--> Backoff --elapsed--> Ready
//! Running --permanent failure--> PermanentlyFailed
//! Backoff --Nth consecutive failure--> PermanentlyFailed
//! ```
//!
//! Dispatch is a tagged variant per runtime rather than trait objects; the
//! supervisor moves drivers into per-window tasks and gets them back with
//! their outcome.

pub mod command;
pub mod dotnet;
pub mod java;
pub mod node;
pub mod perf;
pub mod php;
pub mod python;
pub mod ruby;
pub mod speedscope;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    DriverError, FailureKind, PartialProfile, ProcessDescriptor, RuntimeKind, StackCounts, Window,
};

/// Consecutive window failures before a driver is permanently demoted.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Exponential backoff bounds between failed windows.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Per-target concurrency bound within one runtime driver.
pub const MAX_PER_DRIVER: usize = 4;

/// Extra seconds granted to a per-target tool beyond the window duration,
/// covering its own startup and teardown.
pub const TARGET_EXTRA_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-window context shared by all drivers.
#[derive(Clone)]
pub struct WindowContext {
    pub window: Window,
    pub cancel: CancellationToken,
    /// Host-wide cap on concurrently running sampler children.
    pub spawn_slots: Arc<Semaphore>,
}

impl WindowContext {
    /// Deadline for a one-shot per-target sampler run.
    #[must_use]
    pub fn target_timeout(&self) -> Duration {
        self.window.duration + TARGET_EXTRA_TIMEOUT
    }
}

// ── state machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disabled,
    Ready,
    Running,
    Backoff,
    PermanentlyFailed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverState::Disabled => "disabled",
            DriverState::Ready => "ready",
            DriverState::Running => "running",
            DriverState::Backoff => "backoff",
            DriverState::PermanentlyFailed => "permanently-failed",
        };
        f.write_str(s)
    }
}

/// Driver-owned state machine. The supervisor only ever reads the state.
#[derive(Debug)]
pub struct StateMachine {
    state: DriverState,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    next_backoff: Duration,
}

impl StateMachine {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        StateMachine {
            state: if enabled { DriverState::Ready } else { DriverState::Disabled },
            consecutive_failures: 0,
            backoff_until: None,
            next_backoff: BACKOFF_INITIAL,
        }
    }

    /// Current state, resolving an elapsed backoff back to Ready.
    pub fn poll(&mut self) -> DriverState {
        if self.state == DriverState::Backoff {
            if let Some(until) = self.backoff_until {
                if Instant::now() >= until {
                    self.state = DriverState::Ready;
                    self.backoff_until = None;
                }
            }
        }
        self.state
    }

    /// Enter Running if Ready; otherwise report the blocking state.
    pub fn try_begin(&mut self) -> Result<(), DriverState> {
        match self.poll() {
            DriverState::Ready => {
                self.state = DriverState::Running;
                Ok(())
            }
            other => Err(other),
        }
    }

    pub fn complete(&mut self) {
        self.state = DriverState::Ready;
        self.consecutive_failures = 0;
        self.next_backoff = BACKOFF_INITIAL;
    }

    pub fn fail_transient(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DEFAULT_RETRY_CEILING {
            self.state = DriverState::PermanentlyFailed;
        } else {
            self.state = DriverState::Backoff;
            self.backoff_until = Some(Instant::now() + self.next_backoff);
            self.next_backoff = (self.next_backoff * 2).min(BACKOFF_CAP);
        }
    }

    pub fn fail_permanent(&mut self) {
        self.state = DriverState::PermanentlyFailed;
    }

    #[cfg(test)]
    fn expire_backoff(&mut self) {
        self.backoff_until = Some(Instant::now() - Duration::from_secs(1));
    }
}

// ── outcome ──────────────────────────────────────────────────────────────

/// What one driver produced for one window.
#[derive(Debug)]
pub struct DriverOutcome {
    pub driver: &'static str,
    pub profile: PartialProfile,
    /// True when the driver failed or missed the deadline; the window
    /// artifact is then flagged degraded.
    pub degraded: bool,
    /// True when this partial replaces native stacks for its pids instead
    /// of being merged (the eBPF sampler emits full native+runtime stacks).
    pub replaces_native: bool,
    pub error: Option<String>,
    pub state_after: DriverState,
}

impl DriverOutcome {
    fn skipped(driver: &'static str, state: DriverState) -> Self {
        DriverOutcome {
            driver,
            profile: PartialProfile::new(),
            degraded: false,
            replaces_native: false,
            error: None,
            state_after: state,
        }
    }
}

// ── uniform driver dispatch ──────────────────────────────────────────────

/// All sub-profiler variants behind one dispatch surface.
pub enum Driver {
    System(perf::PerfDriver),
    Java(java::JavaDriver),
    Python(python::PythonDriver),
    Ruby(ruby::RubyDriver),
    Php(php::PhpDriver),
    Node(node::NodeDriver),
    DotNet(dotnet::DotNetDriver),
}

impl Driver {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Driver::System(_) => "perf",
            Driver::Java(_) => "java",
            Driver::Python(_) => "python",
            Driver::Ruby(_) => "ruby",
            Driver::Php(_) => "php",
            Driver::Node(_) => "node",
            Driver::DotNet(_) => "dotnet",
        }
    }

    /// Runtime this driver serves; None for the system-wide sampler.
    #[must_use]
    pub fn runtime(&self) -> Option<RuntimeKind> {
        match self {
            Driver::System(_) => None,
            Driver::Java(_) => Some(RuntimeKind::Java),
            Driver::Python(_) => Some(RuntimeKind::Python),
            Driver::Ruby(_) => Some(RuntimeKind::Ruby),
            Driver::Php(_) => Some(RuntimeKind::Php),
            Driver::Node(_) => Some(RuntimeKind::Node),
            Driver::DotNet(_) => Some(RuntimeKind::DotNet),
        }
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Driver::System(_))
    }

    /// Whether this driver's partial replaces native stacks for its pids
    /// instead of being merged. Only true for the eBPF-backed Python
    /// sampler, which emits full native+runtime stacks itself.
    #[must_use]
    pub fn replaces_native(&self) -> bool {
        match self {
            Driver::Python(python) => python.emits_native_frames(),
            _ => false,
        }
    }

    pub fn state(&mut self) -> DriverState {
        self.machine_mut().poll()
    }

    fn machine_mut(&mut self) -> &mut StateMachine {
        match self {
            Driver::System(d) => &mut d.machine,
            Driver::Java(d) => &mut d.machine,
            Driver::Python(d) => &mut d.machine,
            Driver::Ruby(d) => &mut d.machine,
            Driver::Php(d) => &mut d.machine,
            Driver::Node(d) => &mut d.machine,
            Driver::DotNet(d) => &mut d.machine,
        }
    }

    async fn collect(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> Result<PartialProfile, DriverError> {
        match self {
            Driver::System(d) => d.collect(ctx, targets).await,
            Driver::Java(d) => d.collect(ctx, targets).await,
            Driver::Python(d) => d.collect(ctx, targets).await,
            Driver::Ruby(d) => d.collect(ctx, targets).await,
            Driver::Php(d) => d.collect(ctx, targets).await,
            Driver::Node(d) => d.collect(ctx, targets).await,
            Driver::DotNet(d) => d.collect(ctx, targets).await,
        }
    }

    /// Run one window: drive the state machine, collect, classify failures.
    ///
    /// Never returns an error; failures surface as `degraded` plus the
    /// resulting state transition.
    pub async fn run_window(
        &mut self,
        ctx: &WindowContext,
        targets: Vec<ProcessDescriptor>,
    ) -> DriverOutcome {
        let name = self.name();

        if let Err(state) = self.machine_mut().try_begin() {
            if state != DriverState::Disabled {
                log::debug!("driver {name} not ready (state {state}), skipping window");
            }
            return DriverOutcome::skipped(name, state);
        }

        match self.collect(ctx, targets).await {
            Ok(profile) => {
                self.machine_mut().complete();
                // Queried after the collection: the python driver's Auto
                // probe may have settled on a backend during it.
                let replaces_native = self.replaces_native();
                DriverOutcome {
                    driver: name,
                    profile,
                    degraded: false,
                    replaces_native,
                    error: None,
                    state_after: DriverState::Ready,
                }
            }
            Err(err) => {
                match err.failure_kind() {
                    FailureKind::Environmental => {
                        log::error!("driver {name} disabled permanently: {err}");
                        self.machine_mut().fail_permanent();
                    }
                    FailureKind::TargetTransient | FailureKind::WindowTransient => {
                        log::warn!("driver {name} failed this window: {err}");
                        self.machine_mut().fail_transient();
                    }
                }
                let state_after = self.machine_mut().poll();
                DriverOutcome {
                    driver: name,
                    profile: PartialProfile::new(),
                    degraded: true,
                    replaces_native: false,
                    error: Some(err.to_string()),
                    state_after,
                }
            }
        }
    }

    /// Best-effort teardown of any long-lived sampler children.
    pub fn shutdown(&mut self) {
        if let Driver::Python(d) = self {
            d.shutdown();
        }
    }
}

// ── per-target fan-out ───────────────────────────────────────────────────

/// Run a per-target sampler over all targets with bounded concurrency.
///
/// Target-level failures are logged, excluded from the window, and reported
/// back for driver-specific bookkeeping (the Java denylist); they never
/// fail the driver. The tool's existence is verified up front by the
/// caller, so nothing environmental surfaces here. Results for pids whose
/// start-time token changed mid-window belong to a reused pid and are
/// dropped.
pub async fn run_per_target<F, Fut>(
    ctx: &WindowContext,
    targets: Vec<ProcessDescriptor>,
    max_concurrency: usize,
    profile_one: F,
) -> (PartialProfile, Vec<(crate::domain::Pid, DriverError)>)
where
    F: Fn(ProcessDescriptor) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<StackCounts, DriverError>> + Send + 'static,
{
    let local_slots = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for desc in targets {
        let local_slots = Arc::clone(&local_slots);
        let global_slots = Arc::clone(&ctx.spawn_slots);
        let cancel = ctx.cancel.clone();
        let profile_one = profile_one.clone();

        tasks.spawn(async move {
            let Ok(_local) = local_slots.acquire_owned().await else { return None };
            let Ok(_global) = global_slots.acquire_owned().await else { return None };
            if cancel.is_cancelled() {
                return None;
            }

            let pid = desc.pid;
            let token = desc.start_time;
            match profile_one(desc).await {
                Ok(stacks) => {
                    if stacks.is_empty() {
                        return None;
                    }
                    if let Ok(stat) = crate::procview::read_stat(pid) {
                        if stat.start_time != token {
                            log::debug!("pid {pid} was reused mid-window, dropping its samples");
                            return None;
                        }
                    }
                    Some((pid, Ok(stacks)))
                }
                Err(err) => Some((pid, Err(err))),
            }
        });
    }

    let mut profile = PartialProfile::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let Ok(Some((pid, result))) = joined else { continue };
        match result {
            Ok(stacks) => profile.entry(pid).or_default().merge(stacks),
            Err(err) => {
                match err.failure_kind() {
                    FailureKind::TargetTransient => {
                        log::debug!("target {pid} skipped this window: {err}");
                    }
                    _ => log::warn!("profiling target {pid} failed: {err}"),
                }
                failures.push((pid, err));
            }
        }
    }
    (profile, failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let mut machine = StateMachine::new(true);
        assert_eq!(machine.poll(), DriverState::Ready);
        machine.try_begin().unwrap();
        assert_eq!(machine.poll(), DriverState::Running);
        machine.complete();
        assert_eq!(machine.poll(), DriverState::Ready);
    }

    #[test]
    fn test_state_machine_disabled_never_starts() {
        let mut machine = StateMachine::new(false);
        assert_eq!(machine.try_begin(), Err(DriverState::Disabled));
        assert_eq!(machine.poll(), DriverState::Disabled);
    }

    #[test]
    fn test_transient_failure_backs_off_then_recovers() {
        let mut machine = StateMachine::new(true);
        machine.try_begin().unwrap();
        machine.fail_transient();
        assert_eq!(machine.poll(), DriverState::Backoff);
        assert_eq!(machine.try_begin(), Err(DriverState::Backoff));

        machine.expire_backoff();
        assert_eq!(machine.poll(), DriverState::Ready);

        // A success resets the consecutive-failure count.
        machine.try_begin().unwrap();
        machine.complete();
        assert_eq!(machine.consecutive_failures, 0);
    }

    #[test]
    fn test_retry_ceiling_demotes_permanently() {
        let mut machine = StateMachine::new(true);
        for _ in 0..DEFAULT_RETRY_CEILING {
            machine.expire_backoff();
            assert_eq!(machine.poll(), DriverState::Ready);
            machine.try_begin().unwrap();
            machine.fail_transient();
        }
        assert_eq!(machine.poll(), DriverState::PermanentlyFailed);
        assert_eq!(machine.try_begin(), Err(DriverState::PermanentlyFailed));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut machine = StateMachine::new(true);
        assert_eq!(machine.next_backoff, BACKOFF_INITIAL);
        machine.try_begin().unwrap();
        machine.fail_transient();
        assert_eq!(machine.next_backoff, BACKOFF_INITIAL * 2);

        machine.next_backoff = BACKOFF_CAP;
        machine.expire_backoff();
        machine.poll();
        machine.try_begin().unwrap();
        machine.fail_transient();
        // Second failure: still below the ceiling, and doubling is capped.
        assert_eq!(machine.poll(), DriverState::Backoff);
        assert_eq!(machine.next_backoff, BACKOFF_CAP);
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let mut machine = StateMachine::new(true);
        machine.try_begin().unwrap();
        machine.fail_permanent();
        assert_eq!(machine.poll(), DriverState::PermanentlyFailed);
    }
}
