//! Second-stage scoring with a cross-encoder.
//!
//! The cross-encoder sees (query, candidate text) pairs together, which makes
//! it far more accurate than the first-stage scores but also the most
//! expensive step of corpus retrieval. It is optional at startup: without a
//! model on disk the retriever falls back to weighted score fusion.

mod cross_encoder;

pub use cross_encoder::CrossEncoderReranker;

use anyhow::Result;
use async_trait::async_trait;

/// Scores (query, document) pairs. Higher is more relevant.
///
/// Implementations must return exactly one `(id, score)` per input pair, in
/// any order; candidates a model cannot tokenize get `f32::MIN` so they sink
/// to the bottom instead of disappearing from the result list.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score_pairs(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>>;
}
