//! Client for the local LLM runtime.
//!
//! One non-streaming completion call per request, model listing with a short
//! cache, and a health ping. In-flight generations are bounded by a
//! semaphore; a request that would spend its whole remaining deadline
//! waiting in that queue fails fast instead.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::error::RagError;

/// How long a model listing stays fresh.
const MODEL_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub model: String,
    pub eval_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Abstracts the generation runtime so the pipeline can run against a fake.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Single non-streaming completion. `deadline` is the request-wide
    /// cutoff: queue waiting counts against it, and the HTTP call gets
    /// whatever budget is left once a slot frees up.
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: usize,
        deadline: Instant,
    ) -> Result<GenerationOutput, RagError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    async fn ping(&self) -> bool;
}

/// Rough context window by model family. Used to size the prompt budget;
/// generous defaults are fine because assembly reserves output headroom.
pub fn context_window(model: &str) -> usize {
    let lower = model.to_lowercase();
    if lower.contains("llama3") || lower.contains("llama-3") {
        131_072
    } else if lower.contains("qwen") {
        32_768
    } else if lower.contains("mistral") || lower.contains("mixtral") {
        32_768
    } else if lower.contains("phi") {
        16_384
    } else {
        8_192
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Ollama-compatible runtime client.
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<Semaphore>,
    model_cache: Mutex<Option<(Instant, Vec<ModelInfo>)>>,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, max_concurrency: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .context("Failed to build generator HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            model_cache: Mutex::new(None),
        })
    }

    /// Parse a response body as JSON, surfacing a readable error when a
    /// proxy hands back an HTML error page instead.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

        let trimmed = body.trim_start();
        if trimmed.starts_with('<') || trimmed.starts_with("<!") {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}) — the runtime may be down. Response: {}",
                endpoint, status, preview
            ));
        }

        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!(
                "Failed to parse JSON from {} (HTTP {}): {}. Body: {}",
                endpoint,
                status,
                e,
                preview
            )
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: usize,
        deadline: Instant,
    ) -> Result<GenerationOutput, RagError> {
        let wait_budget = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| {
                RagError::GeneratorBusy("deadline exhausted before generation".to_string())
            })?;

        let permit = tokio::time::timeout(wait_budget, self.limiter.clone().acquire_owned())
            .await
            .map_err(|_| {
                RagError::GeneratorBusy(format!(
                    "waited {}ms for a generation slot, deadline reached",
                    wait_budget.as_millis()
                ))
            })?
            .map_err(|_| RagError::Internal("generator limiter closed".to_string()))?;
        let _permit = permit;

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_millis(1));

        let endpoint = format!("{}/api/generate", self.base_url);
        let request = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            },
        });

        let started = std::time::Instant::now();
        let response = tokio::time::timeout(
            remaining,
            self.client.post(&endpoint).json(&request).send(),
        )
        .await
        .map_err(|_| {
            RagError::GeneratorFailed(format!(
                "generation timed out after {}ms",
                remaining.as_millis()
            ))
        })?
        .map_err(|e| {
            if e.is_connect() {
                RagError::GeneratorFailed(format!(
                    "failed to connect to runtime at {}: {}",
                    endpoint, e
                ))
            } else {
                RagError::GeneratorFailed(format!("generation request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::GeneratorFailed(format!(
                "runtime error ({}): {}",
                status, body
            )));
        }

        let parsed: GenerateResponse = Self::parse_json_response(response, &endpoint)
            .await
            .map_err(|e| RagError::GeneratorFailed(format!("{:#}", e)))?;

        if parsed.response.trim().is_empty() {
            return Err(RagError::GeneratorFailed(
                "runtime returned an empty completion".to_string(),
            ));
        }

        tracing::debug!(
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            eval_count = ?parsed.eval_count,
            "generation complete"
        );

        Ok(GenerationOutput {
            text: parsed.response,
            model: if parsed.model.is_empty() {
                model.to_string()
            } else {
                parsed.model
            },
            eval_count: parsed.eval_count,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        {
            let cache = self.model_cache.lock().await;
            if let Some((fetched_at, models)) = cache.as_ref() {
                if fetched_at.elapsed() < MODEL_CACHE_TTL {
                    return Ok(models.clone());
                }
            }
        }

        let endpoint = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .with_context(|| format!("model listing request to {} failed", endpoint))?;

        let parsed: TagsResponse = Self::parse_json_response(response, &endpoint).await?;

        let mut cache = self.model_cache.lock().await;
        *cache = Some((Instant::now(), parsed.models.clone()));
        Ok(parsed.models)
    }

    async fn ping(&self) -> bool {
        let endpoint = format!("{}/api/tags", self.base_url);
        match self.client.get(&endpoint).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_recognizes_families() {
        assert_eq!(context_window("llama3.1:8b"), 131_072);
        assert_eq!(context_window("qwen2.5-coder"), 32_768);
        assert_eq!(context_window("unknown-model"), 8_192);
    }

    #[test]
    fn generate_response_parses_runtime_shape() {
        let raw = r#"{"model": "llama3.1", "response": "Answer text.", "done": true,
                      "eval_count": 57, "total_duration": 1843000000}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.response, "Answer text.");
        assert_eq!(parsed.model, "llama3.1");
        assert_eq!(parsed.eval_count, Some(57));
    }

    #[test]
    fn tags_response_tolerates_extra_fields() {
        let raw = r#"{"models": [
            {"name": "llama3.1:8b", "size": 4920000000, "digest": "abc"},
            {"name": "nomic-embed-text"}
        ]}"#;
        let parsed: TagsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.models.len(), 2);
        assert_eq!(parsed.models[1].name, "nomic-embed-text");
        assert_eq!(parsed.models[1].size, None);
    }
}
