use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Log entries
// =============================================================================

/// Severity level carried by an incoming log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Lenient parse used by the log adapters. Unknown levels return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "err" | "fatal" | "critical" | "crit" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" | "notice" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Only errors and warnings are fingerprinted.
    pub fn is_actionable(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Warn)
    }
}

/// A single observed log occurrence. Consumed by the fingerprint engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            service: service.into(),
            request_id: None,
            user_id: None,
            stack_trace: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack_trace = Some(stack.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

/// Frequency threshold at which a fingerprint becomes `Medium`.
pub const MEDIUM_FREQUENCY: u64 = 10;
/// Frequency threshold at which a fingerprint becomes `High`.
pub const HIGH_FREQUENCY: u64 = 20;
/// Frequency threshold at which a fingerprint becomes `Critical`.
pub const CRITICAL_FREQUENCY: u64 = 50;

/// Severity tier, derived purely from occurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_frequency(frequency: u64) -> Self {
        match frequency {
            f if f >= CRITICAL_FREQUENCY => Severity::Critical,
            f if f >= HIGH_FREQUENCY => Severity::High,
            f if f >= MEDIUM_FREQUENCY => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintStatus {
    New,
    Investigating,
    Healing,
    Resolved,
}

impl FingerprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintStatus::New => "new",
            FingerprintStatus::Investigating => "investigating",
            FingerprintStatus::Healing => "healing",
            FingerprintStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(FingerprintStatus::New),
            "investigating" => Some(FingerprintStatus::Investigating),
            "healing" => Some(FingerprintStatus::Healing),
            "resolved" => Some(FingerprintStatus::Resolved),
            _ => None,
        }
    }
}

impl fmt::Display for FingerprintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad error category assigned by keyword classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Network,
    Authentication,
    Validation,
    Database,
    TypeError,
    ReferenceError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Database => "database",
            ErrorCategory::TypeError => "type_error",
            ErrorCategory::ReferenceError => "reference_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => ErrorCategory::Timeout,
            "network" => ErrorCategory::Network,
            "authentication" => ErrorCategory::Authentication,
            "validation" => ErrorCategory::Validation,
            "database" => ErrorCategory::Database,
            "type_error" => ErrorCategory::TypeError,
            "reference_error" => ErrorCategory::ReferenceError,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated error class.
///
/// `id` is a pure function of `(service, pattern, stack_signature)`, so the same
/// inputs collide to the same record across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub id: String,
    pub pattern: String,
    pub stack_signature: String,
    pub service: String,
    pub category: ErrorCategory,
    pub frequency: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub severity: Severity,
    pub status: FingerprintStatus,
}

// =============================================================================
// Healing results
// =============================================================================

/// Kind of remediation a strategy proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CodeFix,
    ConfigChange,
    Restart,
    Scale,
    DependencyUpdate,
}

impl ActionKind {
    /// Accepts the spellings a generative model tends to produce.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "code_fix" | "codefix" | "code" | "patch" => Some(ActionKind::CodeFix),
            "config_change" | "configchange" | "config" | "configuration" => {
                Some(ActionKind::ConfigChange)
            }
            "restart" | "service_restart" => Some(ActionKind::Restart),
            "scale" | "scale_up" => Some(ActionKind::Scale),
            "dependency_update" | "dependencyupdate" | "dependency" | "upgrade" => {
                Some(ActionKind::DependencyUpdate)
            }
            _ => None,
        }
    }
}

/// One proposed remediation step. Nothing in this crate applies actions, so
/// `executed` stays `false` for every action a built-in strategy produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationAction {
    pub kind: ActionKind,
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub executed: bool,
}

impl RemediationAction {
    pub fn proposed(kind: ActionKind, target: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            description: description.into(),
            executed: false,
        }
    }
}

/// Outcome of one strategy execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingResult {
    pub success: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub actions: Vec<RemediationAction>,
    pub estimated_resolution_secs: u64,
}

impl HealingResult {
    pub fn new(
        success: bool,
        confidence: f64,
        reasoning: impl Into<String>,
        actions: Vec<RemediationAction>,
        estimated_resolution_secs: u64,
    ) -> Self {
        Self {
            success,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            actions,
            estimated_resolution_secs,
        }
    }

    /// A non-success result with zero confidence.
    pub fn declined(reasoning: impl Into<String>) -> Self {
        Self::new(false, 0.0, reasoning, Vec::new(), 0)
    }

    /// Whether this result ends the strategy chain.
    pub fn is_accepted(&self, confidence_threshold: f64) -> bool {
        self.success && self.confidence > confidence_threshold
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Per-severity fingerprint counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityBreakdown {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl SeverityBreakdown {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }
}

/// Read-only aggregate returned by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingStats {
    pub total_fingerprints: usize,
    pub resolved: usize,
    pub active_healings: usize,
    pub by_severity: SeverityBreakdown,
}

/// Free-form environment hints attached to a healing context.
pub type EnvironmentHints = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_staircase() {
        assert_eq!(Severity::from_frequency(0), Severity::Low);
        assert_eq!(Severity::from_frequency(9), Severity::Low);
        assert_eq!(Severity::from_frequency(10), Severity::Medium);
        assert_eq!(Severity::from_frequency(19), Severity::Medium);
        assert_eq!(Severity::from_frequency(20), Severity::High);
        assert_eq!(Severity::from_frequency(49), Severity::High);
        assert_eq!(Severity::from_frequency(50), Severity::Critical);
        assert_eq!(Severity::from_frequency(10_000), Severity::Critical);
    }

    #[test]
    fn test_severity_monotonic() {
        let mut prev = Severity::Low;
        for f in 0..200 {
            let s = Severity::from_frequency(f);
            assert!(s >= prev, "severity dropped at frequency {}", f);
            prev = s;
        }
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("Info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert!(LogLevel::Warn.is_actionable());
        assert!(!LogLevel::Debug.is_actionable());
    }

    #[test]
    fn test_action_kind_parse_variants() {
        assert_eq!(ActionKind::parse("code-fix"), Some(ActionKind::CodeFix));
        assert_eq!(ActionKind::parse("Config Change"), Some(ActionKind::ConfigChange));
        assert_eq!(ActionKind::parse("restart"), Some(ActionKind::Restart));
        assert_eq!(ActionKind::parse("dependency_update"), Some(ActionKind::DependencyUpdate));
        assert_eq!(ActionKind::parse("pray"), None);
    }

    #[test]
    fn test_result_confidence_clamped_and_threshold_strict() {
        let r = HealingResult::new(true, 1.7, "ok", vec![], 0);
        assert_eq!(r.confidence, 1.0);
        let edge = HealingResult::new(true, 0.7, "edge", vec![], 0);
        assert!(!edge.is_accepted(0.7));
        let fail = HealingResult::new(false, 0.99, "no", vec![], 0);
        assert!(!fail.is_accepted(0.7));
    }

    #[test]
    fn test_category_roundtrip_strings() {
        for c in [
            ErrorCategory::Timeout,
            ErrorCategory::Network,
            ErrorCategory::Authentication,
            ErrorCategory::Validation,
            ErrorCategory::Database,
            ErrorCategory::TypeError,
            ErrorCategory::ReferenceError,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(c.as_str()), c);
        }
    }
}
