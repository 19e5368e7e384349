// factgraph Engine: Embedding Client
//
// Calls Ollama or OpenAI-compatible embedding APIs to produce vector
// representations of text. Used by the vector search arm and by tier-3
// entity resolution.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::EmbeddingConfig;
use crate::atoms::traits::Embedder;
use crate::engine::http::{build_client, send_with_retry, CircuitBreaker};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;

static EMBEDDING_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 30));

const EMBED_TIMEOUT_SECS: u64 = 60;

/// Embedding client: Ollama first, OpenAI-compatible `/v1/embeddings` second.
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    dims: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> EngineResult<Self> {
        if config.model.trim().is_empty() {
            return Err(EngineError::Config("embedding.model is empty".into()));
        }
        Ok(EmbeddingClient {
            client: build_client(EMBED_TIMEOUT_SECS)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            dims: config.dims,
        })
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32...]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32...] }
    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": text });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let v: Value = resp.json().await?;
                if let Some(vec) = parse_embedding(&v) {
                    return Ok(vec);
                }
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                if status.as_u16() == 404 && (text.contains("not found") || text.contains("does not exist")) {
                    return Err(EngineError::provider(
                        "ollama",
                        format!("model '{}' not found: {}", self.model, text),
                    ));
                }
                info!("[embedding] /api/embed returned {}, trying legacy endpoint", status);
            }
            Err(e) => {
                return Err(EngineError::provider(
                    "ollama",
                    format!("not reachable at {}: {}", self.base_url, e),
                ));
            }
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let body = json!({ "model": self.model, "prompt": text });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider("ollama", format!("embed {status}: {text}")));
        }
        let v: Value = resp.json().await?;
        parse_embedding(&v)
            .ok_or_else(|| EngineError::provider("ollama", "no embedding in response"))
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input }
    async fn embed_openai(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = if self.base_url.ends_with("/v1") {
            format!("{}/embeddings", self.base_url)
        } else {
            format!("{}/v1/embeddings", self.base_url)
        };
        let body = json!({ "model": self.model, "input": text });

        let resp = send_with_retry("openai-embed", &EMBEDDING_CIRCUIT, || {
            let builder = self.client.post(&url).json(&body);
            if self.api_key.is_empty() {
                builder
            } else {
                builder.bearer_auth(&self.api_key)
            }
        })
        .await?;

        let v: Value = resp.json().await?;
        parse_embedding(&v)
            .ok_or_else(|| EngineError::provider("openai-embed", "no data[0].embedding in response"))
    }

    fn check_dims(&self, vec: Vec<f32>) -> Vec<f32> {
        if self.dims > 0 && vec.len() != self.dims {
            warn!(
                "[embedding] Model '{}' returned {} dims, configured {}",
                self.model,
                vec.len(),
                self.dims
            );
        }
        vec
    }
}

/// Accepts all three response shapes: `embeddings[0]`, `embedding`, `data[0].embedding`.
pub(crate) fn parse_embedding(v: &Value) -> Option<Vec<f32>> {
    let arr = v["embeddings"][0]
        .as_array()
        .or_else(|| v["embedding"].as_array())
        .or_else(|| v["data"][0]["embedding"].as_array())?;
    let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
    if vec.is_empty() {
        None
    } else {
        Some(vec)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        // With an API key configured the endpoint is OpenAI-style; skip Ollama.
        if !self.api_key.is_empty() {
            return self.embed_openai(text).await.map(|v| self.check_dims(v));
        }

        let ollama_err = match self.embed_ollama(text).await {
            Ok(vec) => return Ok(self.check_dims(vec)),
            Err(e) => e,
        };
        match self.embed_openai(text).await {
            Ok(vec) => Ok(self.check_dims(vec)),
            Err(openai_err) => Err(EngineError::provider(
                "embedding",
                format!("Ollama: {ollama_err} | OpenAI: {openai_err}"),
            )),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ollama_new_format() {
        let v = json!({"embeddings": [[0.1, 0.2, 0.3]]});
        assert_eq!(parse_embedding(&v).unwrap().len(), 3);
    }

    #[test]
    fn test_parse_ollama_legacy_format() {
        let v = json!({"embedding": [0.5, 0.5]});
        assert_eq!(parse_embedding(&v).unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_parse_openai_format() {
        let v = json!({"data": [{"embedding": [1.0, 0.0]}]});
        assert_eq!(parse_embedding(&v).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert!(parse_embedding(&json!({"embedding": []})).is_none());
        assert!(parse_embedding(&json!({})).is_none());
    }

    #[test]
    fn test_model_name() {
        let client = EmbeddingClient::new(&EmbeddingConfig::default()).unwrap();
        assert_eq!(client.model_name(), "nomic-embed-text");
    }
}
