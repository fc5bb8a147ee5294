//! Retrieval branches.
//!
//! The orchestrator treats every source the same way: something that
//! produces ranked hits for a query under a timeout. Branch failures are
//! values, so a broken source degrades the answer instead of aborting it.

pub mod corpus;
pub mod fusion;
pub mod notes;
pub mod web;

pub use corpus::CorpusRetriever;
pub use notes::NotesRetriever;
pub use web::WebSearcher;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Origin, RetrievalHit, SearchQuery, Settings};

#[derive(Error, Debug, Clone)]
pub enum BranchError {
    #[error("timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Telemetry from the corpus reranking sub-stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RerankReport {
    pub elapsed_ms: u64,
    pub fallback: bool,
}

/// One branch's contribution to a request.
#[derive(Debug, Clone, Default)]
pub struct SourceHits {
    pub hits: Vec<RetrievalHit>,
    /// Present only for the corpus branch.
    pub rerank: Option<RerankReport>,
}

/// A retrieval branch: corpus, notes or web.
#[async_trait]
pub trait SourceRetriever: Send + Sync {
    fn origin(&self) -> Origin;

    /// Retrieve hits for one planned query. The caller additionally wraps
    /// this in the per-source timeout; `deadline` is the request-wide cutoff
    /// used to budget internal sub-stages.
    async fn search(
        &self,
        query: &SearchQuery,
        settings: &Settings,
        deadline: tokio::time::Instant,
    ) -> Result<SourceHits, BranchError>;
}
