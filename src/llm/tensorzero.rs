use super::{CompletionRequest, CompletionService, LlmError};
use crate::http::build_llm_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const DEFAULT_GATEWAY: &str = "http://localhost:3000";
const DEFAULT_FUNCTION: &str = "product_enrichment";

#[derive(Debug, Clone)]
pub struct TensorZeroConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: String,
    pub model: Option<String>,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl TensorZeroConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: non_empty_env("TENSORZERO_GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY.into()),
            api_key: non_empty_env("TENSORZERO_API_KEY"),
            function_name: non_empty_env("TENSORZERO_FUNCTION").unwrap_or_else(|| DEFAULT_FUNCTION.into()),
            model: non_empty_env("TENSORZERO_MODEL"),
        }
    }
}

/// Gateway-backed provider. Sampling defaults live in the gateway's function
/// config; the request only overrides them per call.
pub struct TensorZeroClient {
    http: Client,
    config: TensorZeroConfig,
}

impl TensorZeroClient {
    pub fn new(config: TensorZeroConfig) -> Self {
        Self {
            http: build_llm_client(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(TensorZeroConfig::from_env())
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    function_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    input: InferenceInput<'a>,
    params: Value,
}

#[derive(Debug, Serialize)]
struct InferenceInput<'a> {
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

fn build_body<'a>(config: &'a TensorZeroConfig, request: &'a CompletionRequest) -> InferenceRequest<'a> {
    InferenceRequest {
        function_name: &config.function_name,
        model_name: config.model.as_deref(),
        input: InferenceInput {
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.user,
            }],
        },
        params: json!({
            "chat_completion": {
                "temperature": request.temperature,
                "top_p": request.top_p,
                "max_tokens": request.max_output_tokens,
                "json_mode": if request.json_response { "on" } else { "off" },
            }
        }),
    }
}

#[async_trait]
impl CompletionService for TensorZeroClient {
    fn model(&self) -> String {
        self.config
            .model
            .clone()
            .unwrap_or_else(|| format!("tensorzero::{}", self.config.function_name))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingApiKey("TENSORZERO_GATEWAY_URL"));
        }

        let mut call = self
            .http
            .post(format!("{gateway}/inference"))
            .json(&build_body(&self.config, request));
        if let Some(key) = &self.config.api_key {
            call = call.header("X-API-Key", key);
        }

        let response = call
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, text));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let text: String = payload
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("no text content".into()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_function_system_prompt_and_json_mode() {
        let config = TensorZeroConfig {
            gateway_url: DEFAULT_GATEWAY.into(),
            api_key: None,
            function_name: DEFAULT_FUNCTION.into(),
            model: None,
        };
        let request = CompletionRequest::enrichment("sistema", "producto".into());
        let body = serde_json::to_value(build_body(&config, &request)).expect("body");
        assert_eq!(body["function_name"], "product_enrichment");
        assert!(body.get("model_name").is_none());
        assert_eq!(body["input"]["system"], "sistema");
        assert_eq!(body["input"]["messages"][0]["content"], "producto");
        assert_eq!(body["params"]["chat_completion"]["json_mode"], "on");
        assert_eq!(body["params"]["chat_completion"]["max_tokens"], 8192);
    }
}
