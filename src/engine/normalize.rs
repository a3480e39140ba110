//! Message normalization, stack signatures, fingerprint ids and error
//! classification.
//!
//! Pure functions with no state, so the fingerprint id of a given
//! `(service, message, stack)` is identical across calls and process restarts.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::types::ErrorCategory;

/// Length of the hex fingerprint id and stack signature.
pub const SHORT_HASH_LEN: usize = 16;
/// Signature used when an entry carries no usable stack trace.
pub const NO_STACK_SIGNATURE: &str = "no-stack";
/// How many call-site frames contribute to the stack signature.
pub const MAX_STACK_FRAMES: usize = 5;

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[allow(clippy::expect_used)]
static RE_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2})?(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:https?|wss?|ftp)://[^\s"'<>]+"#).expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s(\["'=])/[\w.~-]+(?:/[\w.~-]*)*"#).expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_HEX_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-fA-F][0-9a-fA-F-]{31,}").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// `at fn (file:line:col)` style frames.
#[allow(clippy::expect_used)]
static RE_FRAME_NAMED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat\s+(?:async\s+)?([^\s(]+)\s+\(([^)]*)\)").expect("valid regex")
});
/// `at file:line:col` frames with no function name.
#[allow(clippy::expect_used)]
static RE_FRAME_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bat\s+(?:async\s+)?(\S+)").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_LINE_COL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?::\d+)+$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a raw log message into its grouping pattern.
///
/// Dynamic tokens are replaced in a fixed order (timestamps, URLs, paths,
/// long hex ids, integers) so that a later rule never sees the digits of an
/// earlier match. The result is lower-cased and trimmed; every placeholder is
/// lower-case already, which keeps the function idempotent.
pub fn normalize_message(message: &str) -> String {
    let normalized = RE_TIMESTAMP.replace_all(message, "<timestamp>");
    let normalized = RE_URL.replace_all(&normalized, "<url>");
    let normalized = RE_PATH.replace_all(&normalized, "${1}<path>");
    let normalized = RE_HEX_ID.replace_all(&normalized, "<id>");
    let normalized = RE_NUMBER.replace_all(&normalized, "<number>");
    normalized.to_lowercase().trim().to_string()
}

/// Extract up to [`MAX_STACK_FRAMES`] `(function, location)` pairs from a stack
/// trace, ignoring line and column numbers.
pub fn extract_frames(stack: &str) -> Vec<(String, String)> {
    stack
        .lines()
        .filter(|line| line.contains("at "))
        .filter_map(parse_frame)
        .take(MAX_STACK_FRAMES)
        .collect()
}

fn parse_frame(line: &str) -> Option<(String, String)> {
    if let Some(caps) = RE_FRAME_NAMED.captures(line) {
        let function = caps.get(1)?.as_str().to_string();
        let location = strip_line_numbers(caps.get(2)?.as_str());
        return Some((function, location));
    }
    let caps = RE_FRAME_BARE.captures(line)?;
    let location = strip_line_numbers(caps.get(1)?.as_str());
    Some(("<anonymous>".to_string(), location))
}

fn strip_line_numbers(location: &str) -> String {
    RE_LINE_COL.replace(location.trim(), "").into_owned()
}

/// Short signature of the top call sites, or [`NO_STACK_SIGNATURE`].
pub fn stack_signature(stack: Option<&str>) -> String {
    let frames = match stack {
        Some(s) if !s.trim().is_empty() => extract_frames(s),
        _ => return NO_STACK_SIGNATURE.to_string(),
    };
    if frames.is_empty() {
        return NO_STACK_SIGNATURE.to_string();
    }
    let joined = frames
        .iter()
        .map(|(function, location)| format!("{}@{}", function, location))
        .collect::<Vec<_>>()
        .join("|");
    short_hash(&joined)
}

/// Fingerprint id: hash of `service:pattern:stack_signature`.
pub fn fingerprint_id(service: &str, pattern: &str, stack_signature: &str) -> String {
    short_hash(&format!("{}:{}:{}", service, pattern, stack_signature))
}

/// SHA-256 of `content`, hex-encoded and truncated to [`SHORT_HASH_LEN`].
pub fn short_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(SHORT_HASH_LEN);
    hex
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Keyword families in priority order. The first family with a hit wins, so
/// reordering this table changes which category existing fingerprints get.
const KEYWORD_FAMILIES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "etimedout", "deadline exceeded"],
    ),
    (
        ErrorCategory::Network,
        &[
            "network",
            "econnrefused",
            "econnreset",
            "enotfound",
            "connection refused",
            "connection reset",
            "socket hang up",
            "unreachable",
            "dns",
        ],
    ),
    (
        ErrorCategory::Authentication,
        &[
            "unauthorized",
            "authentication",
            "unauthenticated",
            "forbidden",
            "invalid token",
            "token expired",
            "jwt",
            "401",
            "403",
        ],
    ),
    (
        ErrorCategory::Validation,
        &["validation", "invalid", "required field", "is required", "must be", "bad request"],
    ),
    (
        ErrorCategory::Database,
        &[
            "database",
            "sql",
            "query",
            "deadlock",
            "constraint",
            "postgres",
            "mysql",
            "sqlite",
            "mongo",
            "redis",
        ],
    ),
    (
        ErrorCategory::TypeError,
        &["typeerror", "type error", "is not a function", "cannot read propert", "undefined is not"],
    ),
    (
        ErrorCategory::ReferenceError,
        &["referenceerror", "reference error", "is not defined"],
    ),
];

/// Classify a message (and optional stack) into an [`ErrorCategory`].
///
/// Never fails: anything without a keyword hit is `Unknown`.
pub fn classify(message: &str, stack: Option<&str>) -> ErrorCategory {
    let mut haystack = message.to_lowercase();
    if let Some(stack) = stack {
        haystack.push('\n');
        haystack.push_str(&stack.to_lowercase());
    }

    KEYWORD_FAMILIES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}
