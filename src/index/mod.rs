//! In-memory BM25 lexical index.
//!
//! Rebuilt wholesale from the chunk store and swapped in atomically behind a
//! read-write lock, so readers always see either the previous index or the
//! new one, never a partial build. The tokenizer is a contract shared by the
//! build and query paths; changing it requires a full rebuild.

use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

use crate::storage::ChunkStore;

/// BM25 scoring parameters.
#[derive(Debug, Clone, Copy)]
pub struct LexicalConfig {
    pub k1: f32,
    pub b: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Empty,
    Ready,
    Rebuilding,
}

#[derive(Error, Debug)]
#[error("lexical index rebuild failed: {0}")]
pub struct IndexRebuildError(pub String);

/// Search outcome. `stale` is set when a rebuild was in progress, meaning the
/// hits reflect the pre-rebuild corpus (or nothing at all on a first build).
#[derive(Debug, Clone, Default)]
pub struct LexicalResult {
    pub hits: Vec<(String, f32)>,
    pub stale: bool,
}

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has",
        "have", "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "my", "no", "not",
        "of", "on", "or", "our", "she", "so", "that", "the", "their", "them", "then", "there",
        "these", "they", "this", "to", "was", "we", "were", "what", "when", "where", "which",
        "who", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// The index tokenizer: Unicode word segmentation, lowercasing, stopword
/// removal, no stemming. Build and query paths must agree on this exactly.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(w.as_str()))
        .collect()
}

struct Posting {
    doc: u32,
    tf: u32,
}

/// Immutable posting-list snapshot. Built off to the side during a rebuild
/// and installed with a single pointer swap.
struct Snapshot {
    ids: Vec<String>,
    doc_len: Vec<u32>,
    avgdl: f32,
    postings: HashMap<String, Vec<Posting>>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            ids: Vec::new(),
            doc_len: Vec::new(),
            avgdl: 0.0,
            postings: HashMap::new(),
        }
    }

    fn build(docs: Vec<(String, String)>) -> Self {
        let tokenized: Vec<(String, Vec<String>)> = docs
            .into_par_iter()
            .map(|(id, text)| {
                let terms = tokenize(&text);
                (id, terms)
            })
            .collect();

        let mut ids = Vec::with_capacity(tokenized.len());
        let mut doc_len = Vec::with_capacity(tokenized.len());
        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();

        for (doc_idx, (id, terms)) in tokenized.into_iter().enumerate() {
            ids.push(id);
            doc_len.push(terms.len() as u32);

            let mut counts: HashMap<String, u32> = HashMap::new();
            for term in terms {
                *counts.entry(term).or_insert(0) += 1;
            }
            for (term, tf) in counts {
                postings.entry(term).or_default().push(Posting {
                    doc: doc_idx as u32,
                    tf,
                });
            }
        }

        let total_len: u64 = doc_len.iter().map(|&l| l as u64).sum();
        let avgdl = if doc_len.is_empty() {
            0.0
        } else {
            total_len as f32 / doc_len.len() as f32
        };

        Self {
            ids,
            doc_len,
            avgdl,
            postings,
        }
    }

    fn search(&self, terms: &[String], k: usize, cfg: LexicalConfig) -> Vec<(String, f32)> {
        if terms.is_empty() || self.ids.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = self.ids.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for posting in list {
                let tf = posting.tf as f32;
                let dl = self.doc_len[posting.doc as usize] as f32;
                let norm = 1.0 - cfg.b + cfg.b * dl / self.avgdl.max(1e-6);
                let contribution = idf * (tf * (cfg.k1 + 1.0)) / (tf + cfg.k1 * norm);
                *scores.entry(posting.doc).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(doc, score)| (self.ids[doc as usize].clone(), score))
            .collect();

        // Deterministic under score ties.
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked
    }
}

/// Keyword-ranked retrieval over the chunk set.
///
/// Rebuilds are serialized by the ingest coordinator; searches read the
/// current snapshot without blocking on an in-flight rebuild and flag their
/// result as `stale` while one is running.
pub struct LexicalIndex {
    cfg: LexicalConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    state: RwLock<IndexState>,
}

impl LexicalIndex {
    pub fn new(cfg: LexicalConfig) -> Self {
        Self {
            cfg,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            state: RwLock::new(IndexState::Empty),
        }
    }

    pub fn state(&self) -> IndexState {
        *self.state.read()
    }

    pub fn doc_count(&self) -> usize {
        self.snapshot.read().ids.len()
    }

    /// Search for `query`, returning up to `k` `(chunk_id, score)` pairs
    /// sorted by descending BM25 score.
    pub fn search(&self, query: &str, k: usize) -> LexicalResult {
        let state = self.state();
        if state == IndexState::Empty {
            return LexicalResult::default();
        }

        let snapshot = Arc::clone(&self.snapshot.read());
        let terms = tokenize(query);
        LexicalResult {
            hits: snapshot.search(&terms, k, self.cfg),
            stale: state == IndexState::Rebuilding,
        }
    }

    /// Read all current chunks from the store and replace the posting lists.
    /// Called at startup and after every ingest batch or delete. On failure
    /// the previous snapshot stays installed and searchable.
    pub async fn rebuild_from(&self, store: &dyn ChunkStore) -> Result<usize, IndexRebuildError> {
        let previous_state = {
            let mut state = self.state.write();
            let prev = *state;
            *state = IndexState::Rebuilding;
            prev
        };

        let mut docs: Vec<(String, String)> = Vec::new();
        let mut offset = 0usize;
        const PAGE: usize = 1024;

        loop {
            let page = match store.list(None, PAGE, offset).await {
                Ok(p) => p,
                Err(e) => {
                    *self.state.write() = previous_state;
                    return Err(IndexRebuildError(format!("listing chunks: {}", e)));
                }
            };
            let fetched = page.len();
            for chunk in page {
                docs.push((chunk.id, chunk.text));
            }
            if fetched < PAGE {
                break;
            }
            offset += fetched;
        }

        let count = docs.len();
        let snapshot = tokio::task::block_in_place(|| Snapshot::build(docs));

        *self.snapshot.write() = Arc::new(snapshot);
        *self.state.write() = IndexState::Ready;

        tracing::info!(chunks = count, "lexical index rebuilt");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StoreError, StoredChunk};
    use crate::types::{ChunkMetadata, ChunkRecord, DocumentInfo};
    use async_trait::async_trait;

    #[test]
    fn tokenize_lowercases_and_drops_stopwords() {
        let terms = tokenize("The Opening Range breakout IS a strategy");
        assert_eq!(terms, vec!["opening", "range", "breakout", "strategy"]);
    }

    #[test]
    fn tokenize_handles_unicode_words() {
        let terms = tokenize("naïve Café-prices rose 3.5%");
        assert!(terms.contains(&"naïve".to_string()));
        assert!(terms.contains(&"café".to_string()));
    }

    fn snapshot_from(docs: &[(&str, &str)]) -> Snapshot {
        Snapshot::build(
            docs.iter()
                .map(|(id, text)| (id.to_string(), text.to_string()))
                .collect(),
        )
    }

    #[test]
    fn bm25_ranks_matching_doc_first() {
        let snap = snapshot_from(&[
            ("a", "opening range breakout strategy enters long"),
            ("b", "moving average crossover exits short"),
            ("c", "volume profile analysis session"),
        ]);
        let hits = snap.search(&tokenize("opening range breakout"), 10, LexicalConfig::default());
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn bm25_rare_terms_outweigh_common_ones() {
        let snap = snapshot_from(&[
            ("a", "market market market market"),
            ("b", "market stochastic divergence"),
            ("c", "market session open"),
        ]);
        // "stochastic" appears in one doc only; it should dominate.
        let hits = snap.search(&tokenize("market stochastic"), 10, LexicalConfig::default());
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn empty_query_and_empty_index_return_nothing() {
        let index = LexicalIndex::new(LexicalConfig::default());
        let result = index.search("anything", 5);
        assert!(result.hits.is_empty());
        assert!(!result.stale);

        let snap = snapshot_from(&[("a", "text here")]);
        assert!(snap.search(&[], 5, LexicalConfig::default()).is_empty());
    }

    struct FakeStore {
        chunks: Vec<StoredChunk>,
        fail: bool,
    }

    #[async_trait]
    impl ChunkStore for FakeStore {
        async fn add(&self, _chunks: Vec<ChunkRecord>) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn delete_by_document(&self, _doc_id: &str) -> Result<usize, StoreError> {
            unimplemented!()
        }
        async fn semantic_search(
            &self,
            _vector: &[f32],
            _k: usize,
            _filter: Option<&str>,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            unimplemented!()
        }
        async fn get_by_ids(&self, _ids: &[String]) -> Result<Vec<StoredChunk>, StoreError> {
            unimplemented!()
        }
        async fn get_neighbors(
            &self,
            _doc_id: &str,
            _chunk_index: u32,
            _window: u32,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            unimplemented!()
        }
        async fn list(
            &self,
            _filter: Option<&str>,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable("boom".into()));
            }
            Ok(self.chunks.iter().skip(offset).take(limit).cloned().collect())
        }
        async fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError> {
            unimplemented!()
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Ok(self.chunks.len())
        }
        fn version(&self) -> u64 {
            0
        }
    }

    fn stored(id: &str, text: &str) -> StoredChunk {
        StoredChunk {
            id: id.into(),
            doc_id: "doc".into(),
            chunk_index: 0,
            text: text.into(),
            metadata: ChunkMetadata::default(),
            score: 0.0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rebuild_installs_new_snapshot() {
        let index = LexicalIndex::new(LexicalConfig::default());
        let store = FakeStore {
            chunks: vec![stored("x", "breakout entry above range high")],
            fail: false,
        };

        let count = index.rebuild_from(&store).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.state(), IndexState::Ready);

        let result = index.search("breakout entry", 5);
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].0, "x");
        assert!(!result.stale);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_rebuild_keeps_previous_snapshot() {
        let index = LexicalIndex::new(LexicalConfig::default());
        let good = FakeStore {
            chunks: vec![stored("x", "breakout entry above range high")],
            fail: false,
        };
        index.rebuild_from(&good).await.unwrap();

        let bad = FakeStore {
            chunks: vec![],
            fail: true,
        };
        let err = index.rebuild_from(&bad).await;
        assert!(err.is_err());
        assert_eq!(index.state(), IndexState::Ready);

        // Old snapshot still answers.
        let result = index.search("breakout", 5);
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rebuild_is_equivalent_to_fresh_build() {
        let store = FakeStore {
            chunks: vec![
                stored("a", "alpha beta gamma"),
                stored("b", "beta gamma delta"),
            ],
            fail: false,
        };

        let once = LexicalIndex::new(LexicalConfig::default());
        once.rebuild_from(&store).await.unwrap();

        let twice = LexicalIndex::new(LexicalConfig::default());
        twice.rebuild_from(&store).await.unwrap();
        twice.rebuild_from(&store).await.unwrap();

        let a = once.search("beta gamma", 10).hits;
        let b = twice.search("beta gamma", 10).hits;
        assert_eq!(a, b);
    }
}
