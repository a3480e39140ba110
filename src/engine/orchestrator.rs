//! Healing orchestrator: reacts to trigger and update events, keeps at most
//! one reserved attempt per fingerprint, and walks the strategy chain.
//!
//! ## Reservations
//!
//! The trigger and sweep paths insert `fingerprint_id -> attempt_id` into the
//! reservation map *before* spawning the attempt task, so a second trigger for
//! the same fingerprint is rejected even if it arrives before the first attempt
//! has been polled. On completion an attempt removes the entry only if it still
//! holds its own attempt id.
//!
//! The escalation path (an update that crossed into critical) does not check
//! the reservation unless `escalation_respects_reservation` is set. It still
//! takes the slot when the slot is free.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::HealingConfig;
use crate::error::AppError;

use super::bus::{BusEvent, EventBus, EventHandler, EventPayload, EventType};
use super::fingerprint::FingerprintEngine;
use super::healing::{
    select_strategies, ContextEnrichment, ContextProvider, HealingContext, HealingStrategy,
    RecentLogsProvider, ServiceRestartStrategy, TimeoutConfigStrategy,
};
use super::provider::{CompletionClient, GenerativeStrategy};
use super::subscription::{
    spawn_subscriptions, CleanupSubscription, ProactiveSweepSubscription, ReactiveSubscription,
    SchedulerState, SchedulerStats,
};
use super::types::{
    Fingerprint, FingerprintStatus, HealingResult, HealingStats, RemediationAction, Severity,
    SeverityBreakdown, CRITICAL_FREQUENCY, HIGH_FREQUENCY,
};

// =============================================================================
// Attempt types
// =============================================================================

/// What started an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOrigin {
    Trigger,
    Escalation,
    Sweep,
}

impl AttemptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOrigin::Trigger => "trigger",
            AttemptOrigin::Escalation => "escalation",
            AttemptOrigin::Sweep => "sweep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trigger" => Some(AttemptOrigin::Trigger),
            "escalation" => Some(AttemptOrigin::Escalation),
            "sweep" => Some(AttemptOrigin::Sweep),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Resolved {
        strategy: String,
        result: HealingResult,
    },
    Failed {
        strategies_attempted: usize,
        reason: String,
    },
}

impl AttemptOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AttemptOutcome::Resolved { .. })
    }
}

/// Row written to the healing store after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub fingerprint_id: String,
    pub origin: AttemptOrigin,
    pub strategy: Option<String>,
    pub success: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub actions: Vec<RemediationAction>,
    pub strategies_attempted: usize,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Durable log of attempt outcomes. Failures are logged, never propagated.
pub trait HealingStore: Send + Sync {
    fn record_attempt(&self, record: &AttemptRecord) -> Result<(), AppError>;
}

/// Result of walking the strategy chain, before any state is finalized.
struct ChainOutcome {
    accepted: Option<(String, HealingResult)>,
    attempted: usize,
    last_failure: Option<String>,
}

// =============================================================================
// Policy
// =============================================================================

/// Proactive sweep policy for a fingerprint nobody is healing yet.
///
/// Critical always qualifies, high once frequency exceeds the high threshold,
/// medium once it has been around longer than `medium_dwell`.
pub fn should_proactively_heal(
    fp: &Fingerprint,
    now: DateTime<Utc>,
    medium_dwell: chrono::Duration,
) -> bool {
    if fp.status != FingerprintStatus::New {
        return false;
    }
    match fp.severity {
        Severity::Critical => true,
        Severity::High => fp.frequency > HIGH_FREQUENCY,
        Severity::Medium => now - fp.first_seen > medium_dwell,
        Severity::Low => false,
    }
}

/// True for the single update that carried a fingerprint into critical.
pub fn is_escalation_crossing(fp: &Fingerprint) -> bool {
    fp.severity == Severity::Critical && fp.frequency == CRITICAL_FREQUENCY
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<unknown panic payload>".to_string()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct HealingOrchestrator {
    engine: Arc<FingerprintEngine>,
    bus: Arc<EventBus>,
    config: HealingConfig,
    strategies: RwLock<BTreeMap<String, Arc<dyn HealingStrategy>>>,
    reservations: Mutex<HashMap<String, String>>,
    last_results: Mutex<HashMap<String, HealingResult>>,
    context_provider: Arc<dyn ContextProvider>,
    store: Option<Arc<dyn HealingStore>>,
    scheduler: Arc<SchedulerState>,
    cancel: Mutex<Option<CancellationToken>>,
    attempts: TaskTracker,
}

impl HealingOrchestrator {
    pub fn new(engine: Arc<FingerprintEngine>, bus: Arc<EventBus>, config: HealingConfig) -> Self {
        let context_provider = Arc::new(RecentLogsProvider::new(engine.clone()));
        Self {
            engine,
            bus,
            config,
            strategies: RwLock::new(BTreeMap::new()),
            reservations: Mutex::new(HashMap::new()),
            last_results: Mutex::new(HashMap::new()),
            context_provider,
            store: None,
            scheduler: Arc::new(SchedulerState::new()),
            cancel: Mutex::new(None),
            attempts: TaskTracker::new(),
        }
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_provider = provider;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn HealingStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn reservations(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.reservations.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Strategy registry
    // -------------------------------------------------------------------------

    /// Register a strategy. A strategy with the same name is replaced.
    pub fn register_strategy(&self, strategy: Arc<dyn HealingStrategy>) {
        let name = strategy.name().to_string();
        let priority = strategy.priority();
        let replaced = self
            .strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), strategy)
            .is_some();
        tracing::debug!(strategy = %name, priority, replaced, "Healing strategy registered");
    }

    /// Restart, timeout-config and the generative fallback.
    pub fn register_default_strategies(&self, client: Arc<dyn CompletionClient>) {
        self.register_strategy(Arc::new(ServiceRestartStrategy::new()));
        self.register_strategy(Arc::new(TimeoutConfigStrategy::new()));
        self.register_strategy(Arc::new(GenerativeStrategy::new(client)));
    }

    /// Registered strategy names, sorted.
    pub fn strategies(&self) -> Vec<String> {
        self.strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn registered(&self) -> Vec<Arc<dyn HealingStrategy>> {
        self.strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe the trigger and escalation handlers on the bus.
    pub fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.subscribe(
            EventType::HealingTriggered,
            Arc::new(TriggerHandler {
                orchestrator: weak.clone(),
            }),
        );
        self.bus.subscribe(
            EventType::FingerprintUpdated,
            Arc::new(UpdateHandler { orchestrator: weak }),
        );
    }

    /// Start the proactive sweep and the retention cleanup.
    pub fn start(self: &Arc<Self>) {
        if !self.scheduler.mark_running() {
            tracing::warn!("Healing orchestrator already started");
            return;
        }
        let cancel = CancellationToken::new();
        let subscriptions: Vec<Box<dyn ReactiveSubscription>> = vec![
            Box::new(ProactiveSweepSubscription {
                orchestrator: self.clone(),
                scheduler: self.scheduler.clone(),
                interval: self.config.sweep_interval(),
            }),
            Box::new(CleanupSubscription {
                engine: self.engine.clone(),
                scheduler: self.scheduler.clone(),
                interval: self.config.cleanup_interval(),
                retention_days: self.config.retention_days,
            }),
        ];
        spawn_subscriptions(subscriptions, self.scheduler.clone(), cancel.clone());
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel);
        tracing::info!(
            sweep_secs = self.config.sweep_interval_secs,
            cleanup_secs = self.config.cleanup_interval_secs,
            "Healing orchestrator started",
        );
    }

    /// Stop the scheduled jobs. In-flight attempts keep running; use
    /// [`shutdown`](Self::shutdown) to wait for them.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
        if self.scheduler.mark_stopped() {
            tracing::info!("Healing orchestrator stopped");
        }
    }

    /// Stop the scheduled jobs and wait for in-flight attempts, bounded by
    /// the strategy timeout. Returns `false` if attempts were still running.
    pub async fn shutdown(&self) -> bool {
        self.stop();
        self.attempts.close();
        let pending = self.attempts.len();
        if pending == 0 {
            return true;
        }
        tracing::info!(pending, "Waiting for in-flight healing attempts");
        match tokio::time::timeout(self.config.strategy_timeout(), self.attempts.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    pending = self.attempts.len(),
                    "Healing attempts still running at shutdown",
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Number of attempt tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Handle a trigger. Returns `None` when an attempt is already reserved.
    pub fn handle_trigger(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        attempt_id: String,
    ) -> Option<JoinHandle<AttemptOutcome>> {
        if !self.try_reserve(&fingerprint.id, &attempt_id) {
            tracing::info!(
                fingerprint_id = %fingerprint.id,
                attempt_id = %attempt_id,
                "Healing already in progress, ignoring duplicate trigger",
            );
            return None;
        }
        Some(self.spawn_attempt(fingerprint, attempt_id, AttemptOrigin::Trigger))
    }

    /// Handle a fingerprint update. Starts an escalated attempt on the update
    /// that crossed into critical.
    pub fn handle_update(self: &Arc<Self>, fingerprint: Fingerprint) -> Option<JoinHandle<AttemptOutcome>> {
        if !is_escalation_crossing(&fingerprint) {
            return None;
        }
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let reserved = self.try_reserve(&fingerprint.id, &attempt_id);
        if !reserved && self.config.escalation_respects_reservation {
            tracing::info!(
                fingerprint_id = %fingerprint.id,
                "Escalation suppressed, healing already in progress",
            );
            return None;
        }
        tracing::warn!(
            fingerprint_id = %fingerprint.id,
            attempt_id = %attempt_id,
            frequency = fingerprint.frequency,
            concurrent = !reserved,
            "Fingerprint reached critical, starting escalated healing",
        );
        Some(self.spawn_attempt(fingerprint, attempt_id, AttemptOrigin::Escalation))
    }

    /// Start attempts for every fingerprint the proactive policy selects.
    pub fn sweep(self: &Arc<Self>) -> Vec<JoinHandle<AttemptOutcome>> {
        let now = Utc::now();
        let dwell = self.config.medium_dwell();
        self.engine
            .by_status(FingerprintStatus::New)
            .into_iter()
            .filter(|fp| should_proactively_heal(fp, now, dwell))
            .filter_map(|fp| {
                let attempt_id = uuid::Uuid::new_v4().to_string();
                if !self.try_reserve(&fp.id, &attempt_id) {
                    return None;
                }
                tracing::info!(
                    fingerprint_id = %fp.id,
                    severity = %fp.severity,
                    frequency = fp.frequency,
                    "Proactive healing",
                );
                Some(self.spawn_attempt(fp, attempt_id, AttemptOrigin::Sweep))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    fn try_reserve(&self, fingerprint_id: &str, attempt_id: &str) -> bool {
        let mut reservations = self.reservations();
        if reservations.contains_key(fingerprint_id) {
            return false;
        }
        reservations.insert(fingerprint_id.to_string(), attempt_id.to_string());
        true
    }

    fn release(&self, fingerprint_id: &str, attempt_id: &str) {
        let mut reservations = self.reservations();
        if reservations.get(fingerprint_id).map(String::as_str) == Some(attempt_id) {
            reservations.remove(fingerprint_id);
        }
    }

    pub fn is_healing(&self, fingerprint_id: &str) -> bool {
        self.reservations().contains_key(fingerprint_id)
    }

    // -------------------------------------------------------------------------
    // Attempt
    // -------------------------------------------------------------------------

    fn spawn_attempt(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        attempt_id: String,
        origin: AttemptOrigin,
    ) -> JoinHandle<AttemptOutcome> {
        let this = Arc::clone(self);
        self.attempts.spawn(async move {
            let started = Instant::now();
            let chain = AssertUnwindSafe(this.run_chain(&fingerprint, &attempt_id, origin))
                .catch_unwind()
                .await;
            let chain = match chain {
                Ok(chain) => chain,
                Err(payload) => {
                    let reason = format!("attempt panicked: {}", panic_message(payload.as_ref()));
                    tracing::error!(
                        fingerprint_id = %fingerprint.id,
                        attempt_id = %attempt_id,
                        "Healing attempt aborted: {}", reason
                    );
                    ChainOutcome {
                        accepted: None,
                        attempted: 0,
                        last_failure: Some(reason),
                    }
                }
            };
            this.finish(fingerprint, &attempt_id, origin, chain, started).await
        })
    }

    /// Steps 1-6: mark healing, build context, select, execute sequentially.
    async fn run_chain(&self, fingerprint: &Fingerprint, attempt_id: &str, origin: AttemptOrigin) -> ChainOutcome {
        self.engine
            .update_fingerprint_status(&fingerprint.id, FingerprintStatus::Healing);

        let escalated = origin == AttemptOrigin::Escalation;
        let ctx = HealingContext::new(attempt_id, fingerprint.clone(), escalated)
            .enrich(self.enrichment(fingerprint).await);

        let chain = select_strategies(&self.registered(), fingerprint.category, escalated);
        tracing::info!(
            fingerprint_id = %fingerprint.id,
            attempt_id = %attempt_id,
            origin = %origin,
            category = %fingerprint.category,
            strategies = chain.len(),
            "Healing attempt started",
        );

        let threshold = self.config.confidence_threshold;
        let timeout = self.config.strategy_timeout();
        let mut attempted = 0;
        let mut last_failure = None;

        for strategy in chain {
            attempted += 1;
            let name = strategy.name().to_string();
            let execution = AssertUnwindSafe(strategy.execute(&ctx)).catch_unwind();

            let failure = match tokio::time::timeout(timeout, execution).await {
                Ok(Ok(Ok(result))) if result.is_accepted(threshold) => {
                    tracing::info!(
                        fingerprint_id = %fingerprint.id,
                        strategy = %name,
                        confidence = result.confidence,
                        "Strategy accepted",
                    );
                    return ChainOutcome {
                        accepted: Some((name, result)),
                        attempted,
                        last_failure,
                    };
                }
                Ok(Ok(Ok(result))) => format!(
                    "{} declined (success={}, confidence={:.2})",
                    name, result.success, result.confidence
                ),
                Ok(Ok(Err(e))) => format!("{} failed: {}", name, e),
                Ok(Err(payload)) => format!("{} panicked: {}", name, panic_message(payload.as_ref())),
                Err(_) => format!("{} timed out after {}s", name, timeout.as_secs()),
            };
            tracing::warn!(fingerprint_id = %fingerprint.id, strategy = %name, "{}", failure);
            last_failure = Some(failure);
        }

        ChainOutcome {
            accepted: None,
            attempted,
            last_failure,
        }
    }

    async fn enrichment(&self, fingerprint: &Fingerprint) -> ContextEnrichment {
        match tokio::time::timeout(self.config.strategy_timeout(), self.context_provider.enrich(fingerprint)).await {
            Ok(Ok(enrichment)) => enrichment,
            Ok(Err(e)) => {
                tracing::debug!(fingerprint_id = %fingerprint.id, "Context enrichment failed: {}", e);
                ContextEnrichment::default()
            }
            Err(_) => {
                tracing::debug!(fingerprint_id = %fingerprint.id, "Context enrichment timed out");
                ContextEnrichment::default()
            }
        }
    }

    /// Steps 7-8. The reservation is released before the status goes back to
    /// `new`, so a trigger fired by the very next entry is never rejected.
    async fn finish(
        &self,
        fingerprint: Fingerprint,
        attempt_id: &str,
        origin: AttemptOrigin,
        chain: ChainOutcome,
        started: Instant,
    ) -> AttemptOutcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let id = fingerprint.id.clone();
        self.release(&id, attempt_id);

        match chain.accepted {
            Some((strategy, result)) => {
                self.engine
                    .update_fingerprint_status(&id, FingerprintStatus::Resolved);
                self.last_results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone(), result.clone());
                self.record(AttemptRecord {
                    attempt_id: attempt_id.to_string(),
                    fingerprint_id: id.clone(),
                    origin,
                    strategy: Some(strategy.clone()),
                    success: true,
                    confidence: result.confidence,
                    reasoning: result.reasoning.clone(),
                    actions: result.actions.clone(),
                    strategies_attempted: chain.attempted,
                    elapsed_ms,
                    created_at: Utc::now(),
                });
                tracing::info!(
                    fingerprint_id = %id,
                    attempt_id = %attempt_id,
                    strategy = %strategy,
                    elapsed_ms,
                    "Healing completed",
                );
                let latest = self.engine.get(&id).unwrap_or(fingerprint);
                let event = BusEvent::new(
                    &id,
                    EventPayload::HealingCompleted {
                        fingerprint: latest,
                        result: result.clone(),
                        elapsed_ms,
                    },
                )
                .with_metadata("attemptId", attempt_id)
                .with_metadata("strategy", strategy.as_str())
                .with_metadata("origin", origin.as_str());
                self.bus.publish(event).await;
                AttemptOutcome::Resolved { strategy, result }
            }
            None => {
                let reason = match (chain.attempted, chain.last_failure) {
                    (_, Some(failure)) => failure,
                    (0, None) => "no applicable strategies".to_string(),
                    (n, None) => format!("none of {} strategies succeeded", n),
                };
                self.engine.update_fingerprint_status(&id, FingerprintStatus::New);
                self.record(AttemptRecord {
                    attempt_id: attempt_id.to_string(),
                    fingerprint_id: id.clone(),
                    origin,
                    strategy: None,
                    success: false,
                    confidence: 0.0,
                    reasoning: reason.clone(),
                    actions: Vec::new(),
                    strategies_attempted: chain.attempted,
                    elapsed_ms,
                    created_at: Utc::now(),
                });
                tracing::warn!(
                    fingerprint_id = %id,
                    attempt_id = %attempt_id,
                    strategies_attempted = chain.attempted,
                    elapsed_ms,
                    "Healing failed: {}", reason
                );
                let latest = self.engine.get(&id).unwrap_or(fingerprint);
                let event = BusEvent::new(
                    &id,
                    EventPayload::HealingFailed {
                        fingerprint: latest,
                        reason: reason.clone(),
                        strategies_attempted: chain.attempted,
                        elapsed_ms,
                    },
                )
                .with_metadata("attemptId", attempt_id)
                .with_metadata("origin", origin.as_str());
                self.bus.publish(event).await;
                AttemptOutcome::Failed {
                    strategies_attempted: chain.attempted,
                    reason,
                }
            }
        }
    }

    fn record(&self, record: AttemptRecord) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.record_attempt(&record) {
                tracing::warn!(
                    fingerprint_id = %record.fingerprint_id,
                    attempt_id = %record.attempt_id,
                    "Failed to persist healing attempt: {}", e
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    pub fn healing_stats(&self) -> HealingStats {
        let fingerprints = self.engine.all();
        let mut by_severity = SeverityBreakdown::default();
        let mut resolved = 0;
        for fp in &fingerprints {
            by_severity.record(fp.severity);
            if fp.status == FingerprintStatus::Resolved {
                resolved += 1;
            }
        }
        HealingStats {
            total_fingerprints: fingerprints.len(),
            resolved,
            active_healings: self.reservations().len(),
            by_severity,
        }
    }

    /// Most recent accepted result for a fingerprint.
    pub fn last_result(&self, fingerprint_id: &str) -> Option<HealingResult> {
        self.last_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint_id)
            .cloned()
    }
}

// =============================================================================
// Bus handlers
// =============================================================================

struct TriggerHandler {
    orchestrator: Weak<HealingOrchestrator>,
}

#[async_trait]
impl EventHandler for TriggerHandler {
    fn name(&self) -> &'static str {
        "healing_trigger"
    }

    async fn handle(&self, event: BusEvent) -> Result<(), AppError> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        if let EventPayload::HealingTriggered {
            attempt_id,
            fingerprint,
        } = event.payload
        {
            orchestrator.handle_trigger(fingerprint, attempt_id);
        }
        Ok(())
    }
}

struct UpdateHandler {
    orchestrator: Weak<HealingOrchestrator>,
}

#[async_trait]
impl EventHandler for UpdateHandler {
    fn name(&self) -> &'static str {
        "healing_escalation"
    }

    async fn handle(&self, event: BusEvent) -> Result<(), AppError> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        if let EventPayload::FingerprintUpdated { fingerprint, .. } = event.payload {
            orchestrator.handle_update(fingerprint);
        }
        Ok(())
    }
}
