//! Healing strategies: the registrable remediation interface, the context a
//! strategy receives, strategy selection, and the deterministic built-ins.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;

use super::fingerprint::FingerprintEngine;
use super::types::{
    ActionKind, EnvironmentHints, ErrorCategory, Fingerprint, HealingResult, LogEntry,
    RemediationAction,
};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a strategy sees during one healing attempt.
#[derive(Debug, Clone)]
pub struct HealingContext {
    pub attempt_id: String,
    pub fingerprint: Fingerprint,
    pub escalated: bool,
    pub recent_logs: Vec<LogEntry>,
    pub code_hints: Vec<String>,
    pub environment: EnvironmentHints,
}

impl HealingContext {
    pub fn new(attempt_id: impl Into<String>, fingerprint: Fingerprint, escalated: bool) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            fingerprint,
            escalated,
            recent_logs: Vec::new(),
            code_hints: Vec::new(),
            environment: EnvironmentHints::new(),
        }
    }

    pub fn enrich(mut self, enrichment: ContextEnrichment) -> Self {
        self.recent_logs = enrichment.recent_logs;
        self.code_hints = enrichment.code_hints;
        self.environment = enrichment.environment;
        self
    }
}

/// Auxiliary signals gathered for a context. Every field may be empty.
#[derive(Debug, Clone, Default)]
pub struct ContextEnrichment {
    pub recent_logs: Vec<LogEntry>,
    pub code_hints: Vec<String>,
    pub environment: EnvironmentHints,
}

/// Best-effort source of recent logs and code/environment hints.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn enrich(&self, fingerprint: &Fingerprint) -> Result<ContextEnrichment, AppError>;
}

/// Provider that contributes nothing.
pub struct NoEnrichment;

#[async_trait]
impl ContextProvider for NoEnrichment {
    async fn enrich(&self, _fingerprint: &Fingerprint) -> Result<ContextEnrichment, AppError> {
        Ok(ContextEnrichment::default())
    }
}

/// Serves the raw entries the fingerprint engine kept for a fingerprint.
pub struct RecentLogsProvider {
    engine: Arc<FingerprintEngine>,
}

impl RecentLogsProvider {
    pub fn new(engine: Arc<FingerprintEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ContextProvider for RecentLogsProvider {
    async fn enrich(&self, fingerprint: &Fingerprint) -> Result<ContextEnrichment, AppError> {
        let recent_logs = self.engine.recent_logs(&fingerprint.id);
        let mut environment = EnvironmentHints::new();
        environment.insert("service".into(), fingerprint.service.clone());
        let code_hints = recent_logs
            .iter()
            .rev()
            .find_map(|e| e.stack_trace.clone())
            .into_iter()
            .collect();
        Ok(ContextEnrichment {
            recent_logs,
            code_hints,
            environment,
        })
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// Which error categories a strategy handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applicability {
    /// Wildcard: every category.
    Any,
    Categories(Vec<ErrorCategory>),
}

impl Applicability {
    pub fn matches(&self, category: ErrorCategory) -> bool {
        match self {
            Applicability::Any => true,
            Applicability::Categories(categories) => categories.contains(&category),
        }
    }
}

/// A named, priority-ranked, category-scoped remediation policy.
///
/// Strategies are stateless; `execute` maps a context to a result and may be
/// called concurrently for different fingerprints. Higher `priority` means
/// more aggressive: normal attempts run ascending, escalations descending.
#[async_trait]
pub trait HealingStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn applicability(&self) -> &Applicability;

    fn priority(&self) -> i32;

    async fn execute(&self, ctx: &HealingContext) -> Result<HealingResult, AppError>;
}

/// Pick the strategies that apply to `category` and order them for execution.
///
/// `strategies` is expected in a stable order (the registry keeps them sorted
/// by name) so equal priorities resolve deterministically.
pub fn select_strategies(
    strategies: &[Arc<dyn HealingStrategy>],
    category: ErrorCategory,
    escalated: bool,
) -> Vec<Arc<dyn HealingStrategy>> {
    let mut chain: Vec<Arc<dyn HealingStrategy>> = strategies
        .iter()
        .filter(|s| s.applicability().matches(category))
        .cloned()
        .collect();
    if escalated {
        chain.sort_by(|a, b| b.priority().cmp(&a.priority()));
    } else {
        chain.sort_by_key(|s| s.priority());
    }
    chain
}

// ---------------------------------------------------------------------------
// Built-in deterministic strategies
// ---------------------------------------------------------------------------

pub const RESTART_CONFIDENCE: f64 = 0.85;
pub const TIMEOUT_CONFIG_CONFIDENCE: f64 = 0.8;

/// Proposes restarting the owning service for connection-style failures.
pub struct ServiceRestartStrategy {
    applicability: Applicability,
}

impl ServiceRestartStrategy {
    pub const NAME: &'static str = "service_restart";
    pub const PRIORITY: i32 = 20;

    pub fn new() -> Self {
        Self {
            applicability: Applicability::Categories(vec![
                ErrorCategory::Database,
                ErrorCategory::Network,
                ErrorCategory::Timeout,
            ]),
        }
    }
}

impl Default for ServiceRestartStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealingStrategy for ServiceRestartStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn applicability(&self) -> &Applicability {
        &self.applicability
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn execute(&self, ctx: &HealingContext) -> Result<HealingResult, AppError> {
        let fp = &ctx.fingerprint;
        Ok(HealingResult::new(
            true,
            RESTART_CONFIDENCE,
            format!(
                "{} {} errors in {} ({} occurrences). Restarting resets pooled connections and stuck handles.",
                fp.severity, fp.category, fp.service, fp.frequency,
            ),
            vec![RemediationAction::proposed(
                ActionKind::Restart,
                fp.service.clone(),
                format!("Rolling restart of {}", fp.service),
            )],
            120,
        ))
    }
}

/// Proposes raising timeouts and enabling retries for slow dependencies.
pub struct TimeoutConfigStrategy {
    applicability: Applicability,
}

impl TimeoutConfigStrategy {
    pub const NAME: &'static str = "timeout_config";
    pub const PRIORITY: i32 = 10;

    pub fn new() -> Self {
        Self {
            applicability: Applicability::Categories(vec![
                ErrorCategory::Network,
                ErrorCategory::Timeout,
            ]),
        }
    }
}

impl Default for TimeoutConfigStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealingStrategy for TimeoutConfigStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn applicability(&self) -> &Applicability {
        &self.applicability
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn execute(&self, ctx: &HealingContext) -> Result<HealingResult, AppError> {
        let fp = &ctx.fingerprint;
        Ok(HealingResult::new(
            true,
            TIMEOUT_CONFIG_CONFIDENCE,
            format!(
                "Pattern '{}' points at a slow or flaky dependency of {}.",
                fp.pattern, fp.service,
            ),
            vec![RemediationAction::proposed(
                ActionKind::ConfigChange,
                format!("{}.timeout", fp.service),
                "Double the request timeout and enable retry with exponential backoff",
            )],
            300,
        ))
    }
}
