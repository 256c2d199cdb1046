//! Per-window fan-out over all sub-profiler drivers.
//!
//! All drivers run concurrently under one shared deadline (window end plus
//! a post-processing grace). One driver's failure never blocks another's
//! result: each outcome is harvested independently, a missed deadline
//! yields an empty partial, and either case marks the window degraded.
//!
//! Drivers are moved into their window task and handed back with the
//! outcome, so no shared mutable state crosses the fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::{PartialProfile, Pid, ProcessDescriptor, Window};
use crate::drivers::{Driver, DriverOutcome, WindowContext};
use crate::merge::RuntimePartial;

/// Host-wide cap on concurrently running sampler children.
pub const MAX_CONCURRENT_CHILDREN: usize = 32;

/// How long past the sampling deadline drivers may keep post-processing.
pub const POST_PROCESSING_GRACE: Duration = Duration::from_secs(30);

/// Extra slack for drivers to observe the deadline cancellation (covers the
/// polite-to-forceful child termination escalation).
const HARVEST_SLACK: Duration = Duration::from_secs(15);

/// Everything the supervisor gathered for one window, ready for the merge.
#[derive(Debug, Default)]
pub struct WindowCollection {
    pub native: PartialProfile,
    pub runtime: Vec<RuntimePartial>,
    /// At least one driver failed, missed the deadline, or was cancelled.
    pub degraded: bool,
    /// Per-driver outcome summaries for the window log line.
    pub summaries: Vec<String>,
}

pub struct Supervisor {
    drivers: Vec<Driver>,
    spawn_slots: Arc<Semaphore>,
}

impl Supervisor {
    #[must_use]
    pub fn new(drivers: Vec<Driver>) -> Self {
        Supervisor { drivers, spawn_slots: Arc::new(Semaphore::new(MAX_CONCURRENT_CHILDREN)) }
    }

    /// Best-effort teardown of long-lived sampler children at shutdown.
    pub fn shutdown_drivers(&mut self) {
        for driver in &mut self.drivers {
            driver.shutdown();
        }
    }

    /// Run every eligible driver for one window and collect the partials.
    pub async fn run(
        &mut self,
        window: &Window,
        snapshot: &[ProcessDescriptor],
        shutdown: &CancellationToken,
    ) -> WindowCollection {
        let deadline = window.sampling_deadline() + POST_PROCESSING_GRACE;
        let cancel = shutdown.child_token();
        let ctx = WindowContext {
            window: window.clone(),
            cancel: cancel.clone(),
            spawn_slots: Arc::clone(&self.spawn_slots),
        };

        // Deadline watchdog: past it, in-flight drivers are cancelled and
        // their partials count as empty.
        let watchdog = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                cancel.cancel();
            })
        };

        let mut tasks = JoinSet::new();
        for driver in self.drivers.drain(..) {
            let ctx = ctx.clone();
            let targets = select_targets(&driver, snapshot);
            tasks.spawn(async move {
                let mut driver = driver;
                let outcome = driver.run_window(&ctx, targets).await;
                (driver, outcome)
            });
        }

        let mut collection = WindowCollection::default();
        let harvest_deadline = deadline + HARVEST_SLACK;
        loop {
            let joined = tokio::time::timeout_at(
                tokio::time::Instant::from_std(harvest_deadline),
                tasks.join_next(),
            )
            .await;
            match joined {
                Ok(None) => break,
                Ok(Some(Ok((driver, outcome)))) => {
                    Self::absorb(&mut collection, &driver, outcome, snapshot);
                    self.drivers.push(driver);
                }
                Ok(Some(Err(join_error))) => {
                    log::error!("driver task panicked: {join_error}");
                    collection.degraded = true;
                }
                Err(_) => {
                    // A driver ignored cancellation well past the deadline.
                    // Abort what's left; those drivers are lost for the
                    // rest of the run.
                    log::error!("driver tasks stuck past the harvest deadline, aborting them");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    collection.degraded = true;
                    break;
                }
            }
        }
        watchdog.abort();

        collection
    }

    fn absorb(
        collection: &mut WindowCollection,
        driver: &Driver,
        mut outcome: DriverOutcome,
        snapshot: &[ProcessDescriptor],
    ) {
        collection.degraded |= outcome.degraded;

        // Driver contract: stacks for pids the driver was not asked about
        // are dropped here, not merged.
        let allowed = allowed_pids(driver.runtime(), snapshot);
        outcome.profile.retain(|pid, _| allowed.contains(pid));

        let samples: u64 = outcome.profile.values().map(crate::domain::StackCounts::total).sum();
        collection.summaries.push(format!(
            "driver={} state={} pids={} samples={}{}",
            outcome.driver,
            outcome.state_after,
            outcome.profile.len(),
            samples,
            outcome.error.as_deref().map(|e| format!(" error={e:?}")).unwrap_or_default(),
        ));

        match driver.runtime() {
            None => collection.native = outcome.profile,
            Some(runtime) => collection.runtime.push(RuntimePartial {
                runtime,
                profile: outcome.profile,
                replaces_native: outcome.replaces_native,
            }),
        }
    }
}

/// Pids a driver is allowed to report: the whole snapshot for the system
/// sampler, its own runtime's processes otherwise.
fn allowed_pids(
    runtime: Option<crate::domain::RuntimeKind>,
    snapshot: &[ProcessDescriptor],
) -> std::collections::HashSet<Pid> {
    snapshot
        .iter()
        .filter(|desc| runtime.is_none() || Some(desc.runtime) == runtime)
        .map(|desc| desc.pid)
        .collect()
}

/// Selection rule: the system sampler receives the full snapshot, a
/// runtime driver the processes classified to its runtime. Stacks a driver
/// returns for pids it was not asked about are dropped afterwards.
fn select_targets(driver: &Driver, snapshot: &[ProcessDescriptor]) -> Vec<ProcessDescriptor> {
    match driver.runtime() {
        None => snapshot.to_vec(),
        Some(runtime) => snapshot.iter().filter(|d| d.runtime == runtime).cloned().collect(),
    }
}
