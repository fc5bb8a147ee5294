//! Query and document embedding.
//!
//! The embedder runs on the local model runtime over HTTP. It is a trait so
//! the retrieval pipeline can be exercised against a deterministic fake.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Produces fixed-dimension embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by the model runtime's embeddings endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    limiter: Arc<Semaphore>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build embedder HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            limiter: Arc::new(Semaphore::new(2)),
        })
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| anyhow!("embedder limiter closed"))?;

        let endpoint = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!("Failed to connect to embedder at {}: {}", endpoint, e)
                } else {
                    anyhow!("Embedding request to {} failed: {}", endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Embedder error ({}): {}", status, body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if parsed.embedding.len() != self.dimension {
            return Err(anyhow!(
                "Embedder returned {} dimensions, expected {}",
                parsed.embedding.len(),
                self.dimension
            ));
        }

        Ok(parsed.embedding)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_one(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_one(text).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
