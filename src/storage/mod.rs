//! Durable chunk storage.
//!
//! The chunk store is the single source of truth for the corpus. The lexical
//! index is rebuilt from it, and the corpus version counter it carries drives
//! response-cache invalidation.

mod lance_store;

pub use lance_store::LanceStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChunkMetadata, ChunkRecord, DocumentInfo};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate chunk ids: {0:?}")]
    DuplicateId(Vec<String>),

    #[error("chunk store unavailable: {0}")]
    Unavailable(String),
}

/// A chunk as it comes back from the store. `score` is cosine similarity in
/// [-1, 1] for semantic search results and 0 for plain listings.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Persistent chunk + vector storage.
///
/// Reads are consistent with the most recent committed write within the same
/// process. All writes go through the ingest coordinator, which serializes
/// them under its mutex.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert a batch. Fails with [`StoreError::DuplicateId`] if any id
    /// already exists; nothing is written in that case.
    async fn add(&self, chunks: Vec<ChunkRecord>) -> Result<(), StoreError>;

    /// Remove every chunk of a document. Returns the number removed.
    async fn delete_by_document(&self, doc_id: &str) -> Result<usize, StoreError>;

    /// Top-k by cosine similarity, descending. Scores are in [-1, 1]; callers
    /// must not assume a normalized 0..1 range.
    async fn semantic_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Hydrate chunks by id, e.g. for lexical-only candidates.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<StoredChunk>, StoreError>;

    /// Chunks adjacent to (doc_id, chunk_index) within ±window, sorted by
    /// chunk index and excluding the anchor itself. Used to hand the
    /// generator surrounding context for top-ranked hits.
    async fn get_neighbors(
        &self,
        doc_id: &str,
        chunk_index: u32,
        window: u32,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Paginated metadata listing for admin surfaces and index rebuilds.
    async fn list(
        &self,
        filter: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Distinct documents with their chunk counts.
    async fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Monotone counter, bumped on every successful `add` or
    /// `delete_by_document`. Response-cache fingerprints include it, so any
    /// corpus mutation makes prior cache entries unreachable.
    fn version(&self) -> u64;
}
