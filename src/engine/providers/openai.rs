// factgraph Engine: OpenAI-Compatible Chat Client
// Handles: OpenAI, OpenRouter, Ollama (/v1), Azure OpenAI, and any
// OpenAI-compatible REST API. Non-streaming completions only.
// Implements the LlmClient boundary trait.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::{ChatRequest, LlmConfig};
use crate::atoms::traits::LlmClient;
use crate::engine::http::{build_client, send_with_retry, CircuitBreaker};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Circuit breaker shared across all OpenAI-compatible chat requests.
static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

const PROVIDER: &str = "openai";

pub struct OpenAiChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    is_azure: bool,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> EngineResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(EngineError::Config("llm.base_url is empty".into()));
        }
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let is_azure = base_url.contains(".azure.com");
        info!("[llm] OpenAI-compatible client for {}", base_url);
        Ok(OpenAiChatClient {
            client: build_client(config.timeout_secs)?,
            base_url,
            api_key: config.api_key.clone(),
            is_azure,
        })
    }

    fn endpoint(&self) -> String {
        // Base URLs that already carry the version segment (OpenRouter, Ollama /v1).
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }

    fn request_body(request: &ChatRequest) -> Value {
        json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }
}

/// Pull `choices[0].message.content` out of a completion response.
pub(crate) fn parse_completion(v: &Value) -> EngineResult<String> {
    if let Some(err) = v.get("error") {
        let message = err["message"].as_str().unwrap_or("unknown error");
        return Err(EngineError::provider(PROVIDER, message));
    }
    v["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::provider(PROVIDER, "response has no choices[0].message.content"))
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn chat(&self, request: ChatRequest) -> EngineResult<String> {
        let url = self.endpoint();
        let body = Self::request_body(&request);
        debug!("[llm] POST {} model={}", url, request.model);

        let resp = send_with_retry(PROVIDER, &OPENAI_CIRCUIT, || {
            let builder = self.client.post(&url).json(&body);
            if self.api_key.is_empty() {
                builder
            } else if self.is_azure {
                builder.header("api-key", &self.api_key)
            } else {
                builder.bearer_auth(&self.api_key)
            }
        })
        .await?;

        let v: Value = resp.json().await?;
        parse_completion(&v)
    }
}
