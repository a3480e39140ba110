//! Periodic background jobs of the healing orchestrator.
//!
//! Every job follows the same shape: wait for the next tick, check the
//! scheduler is still running, do one unit of work. The
//! [`ReactiveSubscription`] trait captures that, and [`spawn_subscriptions`]
//! runs each implementor in its own task until the shared
//! [`CancellationToken`] fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::fingerprint::FingerprintEngine;
use super::orchestrator::HealingOrchestrator;

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Runtime state for the background jobs, shared across tasks.
#[derive(Default)]
pub struct SchedulerState {
    running: AtomicBool,
    sweeps: AtomicU64,
    proactive_attempts: AtomicU64,
    cleanups: AtomicU64,
    fingerprints_removed: AtomicU64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flip to running. Returns `false` if it already was.
    pub fn mark_running(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }

    pub fn mark_stopped(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    pub fn record_sweep(&self, attempts_started: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.proactive_attempts
            .fetch_add(attempts_started as u64, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self, removed: usize) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        self.fingerprints_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            proactive_attempts: self.proactive_attempts.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            fingerprints_removed: self.fingerprints_removed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub running: bool,
    pub sweeps: u64,
    pub proactive_attempts: u64,
    pub cleanups: u64,
    pub fingerprints_removed: u64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A periodic job driven by [`run_single`].
#[async_trait::async_trait]
pub trait ReactiveSubscription: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Optional delay before the first tick.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One unit of work. Errors are logged internally; the loop continues.
    async fn tick(&self);
}

// ---------------------------------------------------------------------------
// Concrete subscriptions
// ---------------------------------------------------------------------------

/// Proactive sweep: start healing for fingerprints that qualify without a
/// fresh trigger event.
pub struct ProactiveSweepSubscription {
    pub orchestrator: Arc<HealingOrchestrator>,
    pub scheduler: Arc<SchedulerState>,
    pub interval: Duration,
}

/// Retention sweep: drop resolved fingerprints past the retention window.
pub struct CleanupSubscription {
    pub engine: Arc<FingerprintEngine>,
    pub scheduler: Arc<SchedulerState>,
    pub interval: Duration,
    pub retention_days: u32,
}

#[async_trait::async_trait]
impl ReactiveSubscription for ProactiveSweepSubscription {
    fn name(&self) -> &'static str {
        "proactive_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) {
        let started = self.orchestrator.sweep();
        self.scheduler.record_sweep(started.len());
        if !started.is_empty() {
            tracing::info!(attempts = started.len(), "Proactive sweep started healing");
        }
    }
}

#[async_trait::async_trait]
impl ReactiveSubscription for CleanupSubscription {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) {
        let removed = self.engine.cleanup(self.retention_days);
        self.scheduler.record_cleanup(removed);
        if removed > 0 {
            tracing::info!(removed, retention_days = self.retention_days, "Cleaned up resolved fingerprints");
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Run one subscription until cancelled or the scheduler stops running.
async fn run_single(
    sub: Box<dyn ReactiveSubscription>,
    scheduler: Arc<SchedulerState>,
    cancel: CancellationToken,
) {
    let name = sub.name();
    let delay = sub.initial_delay();
    if !delay.is_zero() {
        tracing::debug!(subscription = name, delay_secs = delay.as_secs(), "Delaying initial tick");
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(subscription = name, "Subscription cancelled before first tick");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut interval = tokio::time::interval(sub.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !scheduler.is_running() {
            break;
        }
        sub.tick().await;
    }
    tracing::info!(subscription = name, "Subscription loop exited");
}

/// Spawn every subscription as its own task.
pub fn spawn_subscriptions(
    subscriptions: Vec<Box<dyn ReactiveSubscription>>,
    scheduler: Arc<SchedulerState>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    subscriptions
        .into_iter()
        .map(|sub| tokio::spawn(run_single(sub, scheduler.clone(), cancel.clone())))
        .collect()
}
