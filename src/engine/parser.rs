//! Log line adapters: structured JSON, the `<ts> [LEVEL] service: message`
//! text layout, and a catch-all for raw container output.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use super::types::{LogEntry, LogLevel};

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "time", "@timestamp", "ts"];
const LEVEL_KEYS: &[&str] = &["level", "severity", "lvl"];
const MESSAGE_KEYS: &[&str] = &["message", "msg"];
const SERVICE_KEYS: &[&str] = &["service", "service_name", "app"];
const REQUEST_ID_KEYS: &[&str] = &["requestId", "request_id"];
const USER_ID_KEYS: &[&str] = &["userId", "user_id"];
const STACK_KEYS: &[&str] = &["stack", "stack_trace", "stackTrace"];

/// `2024-01-15T10:30:00Z [ERROR] user-service: Connection refused`
#[allow(clippy::expect_used)]
static RE_TEXT_LAYOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+\[([A-Za-z]+)\]\s+([^\s:]+):\s?(.*)$",
    )
    .expect("valid regex")
});

/// CRI runtime prefix: `<rfc3339> stdout|stderr F|P <payload>`.
#[allow(clippy::expect_used)]
static RE_CRI_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\S+)\s+(?:stdout|stderr)\s+[FP]\s(.*)$").expect("valid regex")
});

/// Parse one line. Tries JSON, then the text layout, then the container
/// fallback. Only blank lines yield `None`.
pub fn parse_line(line: &str, default_service: &str) -> Option<LogEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Some(entry) = parse_structured(line, default_service) {
        return Some(entry);
    }
    if let Some(entry) = parse_text(line) {
        return Some(entry);
    }
    parse_container(line, default_service)
}

// ============================================================================
// JSON
// ============================================================================

pub fn parse_structured(line: &str, default_service: &str) -> Option<LogEntry> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(trimmed) else {
        return None;
    };

    let message = take_string(&mut obj, MESSAGE_KEYS)?;
    let level = match take_string(&mut obj, LEVEL_KEYS) {
        Some(raw) => LogLevel::parse(&raw)?,
        None => infer_level(&message),
    };
    let timestamp = take_first(&mut obj, TIMESTAMP_KEYS)
        .and_then(|v| timestamp_from_json(&v))
        .unwrap_or_else(Utc::now);
    let service = take_string(&mut obj, SERVICE_KEYS).unwrap_or_else(|| default_service.to_string());

    let mut entry = LogEntry::new(level, service, message).at(timestamp);
    entry.request_id = take_string(&mut obj, REQUEST_ID_KEYS);
    entry.user_id = take_string(&mut obj, USER_ID_KEYS);
    entry.stack_trace = take_string(&mut obj, STACK_KEYS);
    entry.metadata = obj;
    Some(entry)
}

fn take_first(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(value) = obj.remove(*key) {
            if found.is_none() && !value.is_null() {
                found = Some(value);
            }
        }
    }
    found
}

fn take_string(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    match take_first(obj, keys)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        // Epoch seconds or milliseconds.
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

// ============================================================================
// Text layout
// ============================================================================

pub fn parse_text(line: &str) -> Option<LogEntry> {
    let caps = RE_TEXT_LAYOUT.captures(line.trim())?;
    let timestamp = parse_timestamp(&caps[1]).unwrap_or_else(Utc::now);
    let level = LogLevel::parse(&caps[2])?;
    let message = caps[4].trim();
    if message.is_empty() {
        return None;
    }
    Some(LogEntry::new(level, &caps[3], message).at(timestamp))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let normalized = raw.replace(',', ".");
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Container fallback
// ============================================================================

/// Accept anything non-blank. A CRI prefix is stripped and its payload is
/// given another chance as JSON or the text layout.
pub fn parse_container(line: &str, default_service: &str) -> Option<LogEntry> {
    let (timestamp, payload) = match RE_CRI_PREFIX.captures(line) {
        Some(caps) => (parse_timestamp(&caps[1]), caps.get(2).map_or("", |m| m.as_str())),
        None => (None, line),
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if timestamp.is_some() {
        if let Some(entry) = parse_structured(payload, default_service).or_else(|| parse_text(payload)) {
            return Some(entry);
        }
    }
    let entry = LogEntry::new(infer_level(payload), default_service, payload);
    Some(match timestamp {
        Some(ts) => entry.at(ts),
        None => entry,
    })
}

fn infer_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    if ["error", "exception", "fatal", "panic"]
        .iter()
        .any(|k| lower.contains(k))
    {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}
