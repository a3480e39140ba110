//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::AppError;

use super::{CompletionClient, CompletionRequest, CompletionResponse, Usage};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn chat_body<'a>(model: &'a str, request: &'a CompletionRequest) -> ChatBody<'a> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system_prompt.as_deref() {
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.prompt,
    });
    ChatBody {
        model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

fn into_completion(response: ChatResponse, fallback_model: &str) -> Result<CompletionResponse, AppError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AppError::Provider("completion returned no choices".into()))?;
    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(CompletionResponse {
        content,
        model: response.model.unwrap_or_else(|| fallback_model.to_string()),
        usage,
    })
}

// ============================================================================
// HttpCompletionClient
// ============================================================================

pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(config: &LlmConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AppError> {
        let mut req = self
            .http
            .post(self.endpoint())
            .json(&chat_body(&self.model, &request));
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response: ChatResponse = req.send().await?.error_for_status()?.json().await?;
        let completion = into_completion(response, &self.model)?;
        tracing::debug!(
            model = %completion.model,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "Completion received",
        );
        Ok(completion)
    }
}
