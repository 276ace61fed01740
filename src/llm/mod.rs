pub mod gemini;
pub mod tensorzero;

use async_trait::async_trait;
use std::{env, sync::Arc};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    /// Ask the provider for a JSON-only response when it supports the hint.
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn enrichment(system: &str, user: String) -> Self {
        Self {
            system: system.to_string(),
            user,
            temperature: 0.3,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 8192,
            json_response: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0} not configured")]
    MissingApiKey(&'static str),
    #[error("rate limited")]
    RateLimited,
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("api error: HTTP {0}: {1}")]
    Api(u16, String),
    #[error("http error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited | LlmError::Server(_) | LlmError::Transport(_) | LlmError::InvalidResponse(_)
        )
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            429 => LlmError::RateLimited,
            s if s >= 500 => LlmError::Server(s),
            s => LlmError::Api(s, body.chars().take(300).collect()),
        }
    }
}

/// One request/response round trip against a generative model.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model(&self) -> String;
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

pub type SharedCompletion = Arc<dyn CompletionService>;

pub fn from_env() -> SharedCompletion {
    let provider = env::var("LLM_PROVIDER")
        .ok()
        .map(|v| v.trim().to_lowercase())
        .unwrap_or_else(|| "gemini".into());
    match provider.as_str() {
        "tensorzero" => Arc::new(tensorzero::TensorZeroClient::from_env()),
        "gemini" => Arc::new(gemini::GeminiClient::from_env()),
        other => {
            tracing::warn!(target = "smartenrich.llm", provider = other, "unknown_llm_provider_using_gemini");
            Arc::new(gemini::GeminiClient::from_env())
        }
    }
}
