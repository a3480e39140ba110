pub mod generative;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub use generative::GenerativeStrategy;
pub use http::HttpCompletionClient;

// =============================================================================
// Completion request / response
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

// =============================================================================
// CompletionClient trait
// =============================================================================

/// Remote generative-model endpoint. Calls may be slow or fail; callers bound
/// them with a timeout and treat errors as a declined strategy.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AppError>;
}

/// Stand-in used when no model endpoint is configured.
pub struct DisabledCompletionClient;

#[async_trait]
impl CompletionClient for DisabledCompletionClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, AppError> {
        Err(AppError::Provider("generative model is disabled".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_client_errors() {
        let req = CompletionRequest {
            prompt: "hi".into(),
            system_prompt: None,
            temperature: 0.2,
            max_tokens: 10,
        };
        let err = DisabledCompletionClient.complete(req).await.unwrap_err();
        assert_eq!(err.kind(), "provider");
    }
}
