//! Corpus write path.
//!
//! Everything that mutates the chunk store goes through the coordinator,
//! which serializes batches under one mutex: store write, then lexical
//! rebuild, so the two indexes only disagree while a rebuild is in flight
//! (and lexical searches flag themselves stale for exactly that window).
//!
//! The built-in pipeline handles plain text and markdown uploads. Richer
//! formats (PDF, OCR, transcription) belong to the external ingestion
//! collaborator, which feeds the same coordinator.

mod chunker;

pub use chunker::{snap_to_char_boundary, TextChunker};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::embedding::Embedder;
use crate::index::LexicalIndex;
use crate::storage::ChunkStore;
use crate::types::{ChunkMetadata, ChunkRecord, ContentKind};

/// Outcome of one `/ingest` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub chunks: usize,
    pub failed: usize,
}

/// Serializes corpus mutations and keeps the lexical index in step with the
/// chunk store.
pub struct IngestCoordinator {
    store: Arc<dyn ChunkStore>,
    index: Arc<LexicalIndex>,
    write_lock: Mutex<()>,
}

impl IngestCoordinator {
    pub fn new(store: Arc<dyn ChunkStore>, index: Arc<LexicalIndex>) -> Self {
        Self {
            store,
            index,
            write_lock: Mutex::new(()),
        }
    }

    /// Insert one batch and rebuild the lexical index. The corpus version
    /// advances exactly once per batch (inside the store), and the ingest
    /// mutex keeps concurrent batches from interleaving.
    pub async fn apply_batch(&self, chunks: Vec<ChunkRecord>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let count = chunks.len();
        self.store
            .add(chunks)
            .await
            .map_err(|e| anyhow!("chunk store insert failed: {}", e))?;

        self.index
            .rebuild_from(self.store.as_ref())
            .await
            .map_err(|e| anyhow!("{}", e))?;

        Ok(count)
    }

    /// Remove a document's chunks from both indexes. Returns the number of
    /// chunks removed from the store.
    pub async fn remove_document(&self, doc_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let removed = self
            .store
            .delete_by_document(doc_id)
            .await
            .map_err(|e| anyhow!("chunk store delete failed: {}", e))?;

        if removed > 0 {
            self.index
                .rebuild_from(self.store.as_ref())
                .await
                .map_err(|e| anyhow!("{}", e))?;
        }

        Ok(removed)
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }
}

/// Minimal text/markdown ingestion over the upload directory.
pub struct IngestPipeline {
    coordinator: Arc<IngestCoordinator>,
    embedder: Arc<dyn Embedder>,
    chunker: TextChunker,
    upload_dir: PathBuf,
}

impl IngestPipeline {
    pub fn new(
        coordinator: Arc<IngestCoordinator>,
        embedder: Arc<dyn Embedder>,
        upload_dir: PathBuf,
    ) -> Self {
        std::fs::create_dir_all(&upload_dir).ok();
        Self {
            coordinator,
            embedder,
            chunker: TextChunker::new(1_600, 200, 80),
            upload_dir,
        }
    }

    fn is_ingestable(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref(),
            Some("txt") | Some("md") | Some("markdown")
        )
    }

    /// Walk the upload directory and (re)index every supported file.
    /// `force_reindex` removes and re-adds files that are already indexed;
    /// otherwise they are skipped.
    pub async fn run(&self, force_reindex: bool) -> IngestReport {
        let mut report = IngestReport::default();

        let known_sources: std::collections::HashMap<String, String> = match self
            .coordinator
            .store()
            .list_documents()
            .await
        {
            Ok(docs) => docs.into_iter().map(|d| (d.source, d.doc_id)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list existing documents, reindexing all");
                Default::default()
            }
        };

        let files: Vec<PathBuf> = WalkDir::new(&self.upload_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| Self::is_ingestable(path))
            .collect();

        for path in files {
            let source = path.display().to_string();

            if let Some(doc_id) = known_sources.get(&source) {
                if !force_reindex {
                    continue;
                }
                if let Err(e) = self.coordinator.remove_document(doc_id).await {
                    tracing::warn!(source = %source, error = %e, "reindex delete failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self.ingest_file(&path).await {
                Ok(chunk_count) if chunk_count > 0 => {
                    report.processed += 1;
                    report.chunks += chunk_count;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "ingest failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            chunks = report.chunks,
            failed = report.failed,
            "ingest run complete"
        );
        report
    }

    async fn ingest_file(&self, path: &Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();
        let source = path.display().to_string();

        let doc_id = uuid::Uuid::new_v4().to_string();
        let pieces = self.chunker.chunk(&content);
        if pieces.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_documents(&texts)
            .await
            .context("embedding chunks")?;

        let now = chrono::Utc::now().timestamp();
        let records: Vec<ChunkRecord> = pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, vector)| {
                let mut extra = std::collections::HashMap::new();
                extra.insert("source".to_string(), source.clone());
                ChunkRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    doc_id: doc_id.clone(),
                    chunk_index: piece.index as u32,
                    text: piece.text,
                    vector,
                    metadata: ChunkMetadata {
                        title: title.clone(),
                        section: piece.heading.unwrap_or_default(),
                        page: None,
                        timestamp_start: None,
                        timestamp_end: None,
                        extraction: "text".to_string(),
                        kind: ContentKind::Text,
                        keywords: Vec::new(),
                        ingested_at: now,
                        extra,
                    },
                }
            })
            .collect();

        let count = self.coordinator.apply_batch(records).await?;
        tracing::info!(source = %source, chunks = count, "ingested document");
        Ok(count)
    }

    /// Store one uploaded file under the upload directory, rejecting path
    /// traversal in the client-supplied name.
    pub async fn save_upload(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid filename"))?;

        let target = self.upload_dir.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        Ok(target)
    }
}
