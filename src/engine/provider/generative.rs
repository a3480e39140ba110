//! Last-resort strategy that asks a generative model for remediation steps.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::healing::{Applicability, HealingContext, HealingStrategy};
use crate::engine::types::{ActionKind, HealingResult, RemediationAction};
use crate::error::AppError;

use super::{CompletionClient, CompletionRequest};

/// Fixed confidence for model output; kept below every deterministic strategy.
pub const GENERATIVE_CONFIDENCE: f64 = 0.75;
pub const GENERATIVE_ETA_SECS: u64 = 1800;
const TEMPERATURE: f32 = 0.2;
const MAX_TOKENS: u32 = 1000;
const MAX_LOG_LINES: usize = 5;
const MAX_LOG_CHARS: usize = 300;

const SYSTEM_PROMPT: &str = "You are a site reliability engineer. Propose concrete remediation \
steps for a recurring production error. Respond with JSON only: \
{\"actions\":[{\"type\":\"code_fix|config_change|restart|scale|dependency_update\",\
\"target\":\"...\",\"description\":\"...\"}],\"reasoning\":\"...\"}";

pub struct GenerativeStrategy {
    client: Arc<dyn CompletionClient>,
    applicability: Applicability,
}

impl GenerativeStrategy {
    pub const NAME: &'static str = "generative_fallback";
    pub const PRIORITY: i32 = 100;

    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            client,
            applicability: Applicability::Any,
        }
    }
}

#[async_trait]
impl HealingStrategy for GenerativeStrategy {
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
        let request = CompletionRequest {
            prompt: build_prompt(ctx),
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };
        let response = self.client.complete(request).await?;
        let (actions, reasoning) = parse_actions(&response.content, &ctx.fingerprint.service);

        if actions.is_empty() {
            return Ok(HealingResult::new(
                false,
                GENERATIVE_CONFIDENCE,
                reasoning.unwrap_or_else(|| "Model response contained no actionable steps".into()),
                Vec::new(),
                GENERATIVE_ETA_SECS,
            ));
        }
        Ok(HealingResult::new(
            true,
            GENERATIVE_CONFIDENCE,
            reasoning.unwrap_or_else(|| truncate(response.content.trim(), 500)),
            actions,
            GENERATIVE_ETA_SECS,
        ))
    }
}

// ============================================================================
// Prompt
// ============================================================================

pub fn build_prompt(ctx: &HealingContext) -> String {
    let fp = &ctx.fingerprint;
    let mut prompt = String::with_capacity(1024);
    prompt.push_str("## Recurring error\n");
    let _ = writeln!(prompt, "- Service: {}", fp.service);
    let _ = writeln!(prompt, "- Category: {}", fp.category);
    let _ = writeln!(prompt, "- Pattern: {}", fp.pattern);
    let _ = writeln!(prompt, "- Frequency: {}", fp.frequency);
    let _ = writeln!(prompt, "- Severity: {}", fp.severity);
    let _ = writeln!(prompt, "- First seen: {}", fp.first_seen.to_rfc3339());
    let _ = writeln!(prompt, "- Last seen: {}", fp.last_seen.to_rfc3339());
    let _ = writeln!(prompt, "- Stack signature: {}", fp.stack_signature);
    if ctx.escalated {
        prompt.push_str("- Escalated: the error just crossed the critical threshold\n");
    }

    if !ctx.recent_logs.is_empty() {
        prompt.push_str("\n## Recent occurrences\n");
        let skip = ctx.recent_logs.len().saturating_sub(MAX_LOG_LINES);
        for entry in ctx.recent_logs.iter().skip(skip) {
            let _ = writeln!(
                prompt,
                "- {} {}",
                entry.timestamp.to_rfc3339(),
                truncate(&entry.message, MAX_LOG_CHARS)
            );
        }
    }

    if !ctx.code_hints.is_empty() {
        prompt.push_str("\n## Stack trace\n```\n");
        for hint in &ctx.code_hints {
            prompt.push_str(&truncate(hint, 2000));
            prompt.push('\n');
        }
        prompt.push_str("```\n");
    }

    if !ctx.environment.is_empty() {
        prompt.push_str("\n## Environment\n");
        let mut keys: Vec<&String> = ctx.environment.keys().collect();
        keys.sort();
        for key in keys {
            let _ = writeln!(prompt, "- {}: {}", key, ctx.environment[key]);
        }
    }

    prompt.push_str("\nPropose the smallest set of actions that would stop this error from recurring.\n");
    prompt
}

// ============================================================================
// Response parsing
// ============================================================================

/// Parse model output into proposed actions plus optional reasoning.
///
/// Structured JSON is preferred (fenced block, bare object with `actions`, or
/// a bare array). When that yields nothing usable the raw text is scanned for
/// "restart" and "config".
pub fn parse_actions(output: &str, service: &str) -> (Vec<RemediationAction>, Option<String>) {
    if let Some(value) = extract_json(output) {
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .map(String::from);
        let items = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(_) => value
                .get("actions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            _ => &[],
        };
        let actions: Vec<RemediationAction> =
            items.iter().filter_map(|item| action_from_json(item, service)).collect();
        if !actions.is_empty() {
            return (actions, reasoning);
        }
    }
    (keyword_actions(output, service), None)
}

fn action_from_json(item: &Value, service: &str) -> Option<RemediationAction> {
    let kind = item
        .get("type")
        .or_else(|| item.get("kind"))
        .and_then(Value::as_str)
        .and_then(ActionKind::parse)?;
    let target = item
        .get("target")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(service);
    let description = item
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(RemediationAction::proposed(kind, target, description))
}

fn keyword_actions(output: &str, service: &str) -> Vec<RemediationAction> {
    let lower = output.to_lowercase();
    let mut actions = Vec::new();
    if lower.contains("restart") {
        actions.push(RemediationAction::proposed(
            ActionKind::Restart,
            service,
            "Restart suggested by model output",
        ));
    }
    if lower.contains("config") {
        actions.push(RemediationAction::proposed(
            ActionKind::ConfigChange,
            service,
            "Configuration change suggested by model output",
        ));
    }
    actions
}

fn extract_json(output: &str) -> Option<Value> {
    extract_fenced_json(output).or_else(|| extract_bare_json(output))
}

fn extract_fenced_json(output: &str) -> Option<Value> {
    let mut in_block = false;
    let mut content = String::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if !in_block && trimmed.starts_with("```") {
            let lang = trimmed.trim_start_matches('`').trim();
            if lang.is_empty() || lang.eq_ignore_ascii_case("json") {
                in_block = true;
                content.clear();
            }
            continue;
        }
        if in_block && trimmed == "```" {
            in_block = false;
            if let Ok(val) = serde_json::from_str::<Value>(&content) {
                if val.is_object() || val.is_array() {
                    return Some(val);
                }
            }
            continue;
        }
        if in_block {
            content.push_str(line);
            content.push('\n');
        }
    }
    None
}

/// First balanced `{...}` holding an `actions` key, else the first balanced `[...]`.
fn extract_bare_json(output: &str) -> Option<Value> {
    let chars: Vec<char> = output.chars().collect();
    let mut first_array = None;

    for (i, &ch) in chars.iter().enumerate() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let Some(end) = find_matching(&chars, i) else {
            continue;
        };
        let candidate: String = chars[i..=end].iter().collect();
        match serde_json::from_str::<Value>(&candidate) {
            Ok(val) if val.get("actions").is_some() => return Some(val),
            Ok(val) if val.is_array() && first_array.is_none() => first_array = Some(val),
            _ => {}
        }
    }
    first_array
}

fn find_matching(chars: &[char], start: usize) -> Option<usize> {
    let open = chars[start];
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if !in_string && c == open => depth += 1,
            c if !in_string && c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_offset, _)) => format!("{}...", &s[..byte_offset]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::healing::tests::make_fingerprint;
    use crate::engine::provider::CompletionResponse;
    use crate::engine::types::{ErrorCategory, LogEntry, LogLevel};
    use std::sync::Mutex;

    struct ScriptedClient {
        reply: Result<String, String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AppError> {
            self.seen.lock().unwrap().push(request);
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    model: "scripted".into(),
                    usage: Default::default(),
                }),
                Err(e) => Err(AppError::Provider(e.clone())),
            }
        }
    }

    fn context() -> HealingContext {
        HealingContext::new("a1", make_fingerprint(ErrorCategory::Unknown), false)
    }

    #[test]
    fn test_parse_fenced_json() {
        let output = "Here you go:\n```json\n{\"actions\":[{\"type\":\"code_fix\",\"target\":\"src/db.rs\",\"description\":\"null check\"}],\"reasoning\":\"npe\"}\n```\n";
        let (actions, reasoning) = parse_actions(output, "svc");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::CodeFix);
        assert_eq!(actions[0].target, "src/db.rs");
        assert_eq!(reasoning.as_deref(), Some("npe"));
    }

    #[test]
    fn test_parse_bare_object_and_array() {
        let (actions, _) = parse_actions(
            r#"Sure. {"actions":[{"kind":"scale","description":"add replicas"}]} done"#,
            "svc",
        );
        assert_eq!(actions[0].kind, ActionKind::Scale);
        assert_eq!(actions[0].target, "svc");

        let (actions, _) = parse_actions(r#"[{"type":"restart","target":"api"}]"#, "svc");
        assert_eq!(actions[0].kind, ActionKind::Restart);
        assert_eq!(actions[0].target, "api");
    }

    #[test]
    fn test_parse_falls_back_to_keywords() {
        let (actions, reasoning) =
            parse_actions("You should restart the pods and tweak the config.", "svc");
        let kinds: Vec<ActionKind> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Restart, ActionKind::ConfigChange]);
        assert!(reasoning.is_none());
        assert!(actions.iter().all(|a| !a.executed));
    }

    #[test]
    fn test_parse_unknown_types_fall_back() {
        let (actions, _) = parse_actions(r#"{"actions":[{"type":"pray"}]} restart"#, "svc");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Restart);
    }

    #[test]
    fn test_parse_nothing_actionable() {
        let (actions, _) = parse_actions("no idea", "svc");
        assert!(actions.is_empty());
    }

    #[test]
    fn test_prompt_contains_fingerprint_fields() {
        let mut ctx = context();
        ctx.recent_logs = vec![LogEntry::new(LogLevel::Error, "checkout", "request timed out after 30ms")];
        ctx.code_hints = vec!["at handler (/srv/app.js:10:2)".into()];
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("Service: checkout"));
        assert!(prompt.contains("Category: unknown"));
        assert!(prompt.contains("Frequency: 12"));
        assert!(prompt.contains("Pattern: request timed out"));
        assert!(prompt.contains("First seen:"));
        assert!(prompt.contains("## Recent occurrences"));
        assert!(prompt.contains("## Stack trace"));
    }

    #[tokio::test]
    async fn test_execute_uses_low_temperature_and_fixed_confidence() {
        let client = ScriptedClient::replying(r#"{"actions":[{"type":"restart","target":"checkout"}]}"#);
        let strategy = GenerativeStrategy::new(client.clone());
        let result = strategy.execute(&context()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.confidence, GENERATIVE_CONFIDENCE);
        assert_eq!(result.estimated_resolution_secs, GENERATIVE_ETA_SECS);
        assert!(result.is_accepted(0.7));

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].temperature, TEMPERATURE);
        assert_eq!(seen[0].max_tokens, MAX_TOKENS);
        assert!(seen[0].system_prompt.is_some());
    }

    #[tokio::test]
    async fn test_execute_without_actions_is_not_success() {
        let strategy = GenerativeStrategy::new(ScriptedClient::replying("I cannot help."));
        let result = strategy.execute(&context()).await.unwrap();
        assert!(!result.success);
        assert!(result.actions.is_empty());
    }

    #[tokio::test]
    async fn test_execute_propagates_client_error() {
        let client = Arc::new(ScriptedClient {
            reply: Err("503".into()),
            seen: Mutex::new(Vec::new()),
        });
        let err = GenerativeStrategy::new(client).execute(&context()).await.unwrap_err();
        assert_eq!(err.kind(), "provider");
    }

    #[test]
    fn test_generative_is_wildcard_and_last() {
        let strategy = GenerativeStrategy::new(ScriptedClient::replying(""));
        assert!(strategy.applicability().matches(ErrorCategory::Validation));
        assert!(strategy.priority() > crate::engine::healing::ServiceRestartStrategy::PRIORITY);
        assert!(GENERATIVE_CONFIDENCE < crate::engine::healing::TIMEOUT_CONFIG_CONFIDENCE);
    }
}
