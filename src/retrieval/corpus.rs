//! Hybrid corpus retrieval: BM25 + vector search merged, then cross-encoder
//! reranked, with a weighted-fusion fallback when the reranker is missing or
//! over budget. Near-duplicate chunks are dropped before reranking, repeated
//! documents are diversity-penalized, and the winners are expanded with
//! their neighboring chunks for more readable context.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use tokio::time::{timeout, timeout_at, Instant};

use super::{fusion, BranchError, RerankReport, SourceHits, SourceRetriever};
use crate::embedding::Embedder;
use crate::index::LexicalIndex;
use crate::rerank::Reranker;
use crate::storage::{ChunkStore, StoreError, StoredChunk};
use crate::types::{Locator, Origin, RetrievalHit, SearchQuery, Settings};

/// Word-set Jaccard similarity above which two chunks are the same content.
const NEAR_DUP_THRESHOLD: f32 = 0.75;
/// Diversity penalty per repeated document in the final ranking.
const MMR_LAMBDA: f32 = 0.7;
/// Adjacent chunks pulled in around each winning hit.
const NEIGHBOR_WINDOW: u32 = 1;

struct Candidate {
    chunk: StoredChunk,
    lexical: Option<f32>,
    semantic: Option<f32>,
    rerank: Option<f32>,
}

pub struct CorpusRetriever {
    store: Arc<dyn ChunkStore>,
    index: Arc<LexicalIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl CorpusRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        index: Arc<LexicalIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            reranker,
        }
    }

    /// Run the embed → vector-search side of the hybrid pipeline. An
    /// embedder failure degrades to lexical-only; a store failure is fatal
    /// to the whole corpus branch.
    async fn semantic_branch(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<StoredChunk>, BranchError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let vector = match self.embedder.embed_query(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "embedder failed, corpus degrades to lexical-only");
                return Ok(Vec::new());
            }
        };

        match self.store.semantic_search(&vector, k, None).await {
            Ok(hits) => Ok(hits),
            Err(StoreError::Unavailable(msg)) => Err(BranchError::Unavailable(msg)),
            Err(e) => Err(BranchError::Backend(e.to_string())),
        }
    }

    fn locator_for(chunk: &StoredChunk) -> Locator {
        let meta = &chunk.metadata;
        match (meta.timestamp_start, meta.timestamp_end) {
            (Some(start), Some(end)) => Locator::Media {
                doc_id: chunk.doc_id.clone(),
                timestamp_start: start,
                timestamp_end: end,
            },
            _ => Locator::Document {
                doc_id: chunk.doc_id.clone(),
                page: meta.page,
                section: meta.section.clone(),
            },
        }
    }

    /// Score every candidate with the cross-encoder under its own budget:
    /// half the remaining request deadline. Returns `None` on timeout or
    /// model failure, which triggers the weighted-merge fallback.
    async fn rerank_candidates(
        &self,
        query: &str,
        candidates: &[Candidate],
        deadline: Instant,
    ) -> Option<Vec<(String, f32)>> {
        let reranker = self.reranker.as_ref()?;

        let remaining = deadline.checked_duration_since(Instant::now())?;
        let budget = remaining / 2;

        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (c.chunk.id.clone(), c.chunk.text.clone()))
            .collect();

        match timeout(budget, reranker.score_pairs(query, &pairs)).await {
            Ok(Ok(scores)) => Some(scores),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cross-encoder failed, using weighted fusion");
                None
            }
            Err(_) => {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "cross-encoder over budget, using weighted fusion");
                None
            }
        }
    }

    /// Pull in ±window adjacent chunks for each winner and stitch them in
    /// reading order. Expansion failures are cosmetic and never fail the
    /// branch.
    async fn expand_with_neighbors(&self, candidates: &mut [Candidate]) {
        for candidate in candidates.iter_mut() {
            let neighbors = match self
                .store
                .get_neighbors(
                    &candidate.chunk.doc_id,
                    candidate.chunk.chunk_index,
                    NEIGHBOR_WINDOW,
                )
                .await
            {
                Ok(n) if !n.is_empty() => n,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(
                        doc_id = %candidate.chunk.doc_id,
                        error = %e,
                        "neighbor expansion skipped"
                    );
                    continue;
                }
            };

            let mut before = String::new();
            let mut after = String::new();
            for neighbor in &neighbors {
                if neighbor.chunk_index < candidate.chunk.chunk_index {
                    if !before.is_empty() {
                        before.push('\n');
                    }
                    before.push_str(&neighbor.text);
                } else if neighbor.chunk_index > candidate.chunk.chunk_index {
                    if !after.is_empty() {
                        after.push('\n');
                    }
                    after.push_str(&neighbor.text);
                }
            }

            let mut expanded = String::new();
            if !before.is_empty() {
                expanded.push_str(&before);
                expanded.push('\n');
            }
            expanded.push_str(&candidate.chunk.text);
            if !after.is_empty() {
                expanded.push('\n');
                expanded.push_str(&after);
            }
            candidate.chunk.text = expanded;
        }
    }
}

/// Drop near-identical candidates (overlapping chunk windows produce them),
/// keeping the earliest in the given order. Order the input best-first.
fn dedup_near_identical(candidates: &mut Vec<Candidate>) {
    let word_sets: Vec<HashSet<&str>> = candidates
        .iter()
        .map(|c| c.chunk.text.split_whitespace().collect::<HashSet<_>>())
        .collect();

    let mut keep: Vec<usize> = Vec::new();
    for i in 0..candidates.len() {
        let mut duplicate = false;
        for &j in &keep {
            let intersection = word_sets[i].intersection(&word_sets[j]).count();
            let union = word_sets[i].union(&word_sets[j]).count();
            if union > 0 && (intersection as f32 / union as f32) > NEAR_DUP_THRESHOLD {
                duplicate = true;
                break;
            }
        }
        if !duplicate {
            keep.push(i);
        }
    }

    let keep_set: HashSet<usize> = keep.into_iter().collect();
    let mut idx = 0;
    candidates.retain(|_| {
        let kept = keep_set.contains(&idx);
        idx += 1;
        kept
    });
}

/// Penalize repeated documents so the context spreads across sources. The
/// penalty rewrites the candidate's rerank score, which stays the canonical
/// sort key from here on; `min_score` and `rerank_top_k` are applied to the
/// penalized value. Only positive scores are scaled; cross-encoder logits
/// below zero already mean "irrelevant" and shrinking their magnitude would
/// promote them.
fn apply_mmr_diversity(candidates: &mut [Candidate], lambda: f32) {
    let mut doc_seen: HashMap<String, u32> = HashMap::new();
    for candidate in candidates.iter_mut() {
        let count = doc_seen.entry(candidate.chunk.doc_id.clone()).or_insert(0);
        if *count > 0 {
            if let Some(score) = candidate.rerank.as_mut() {
                if *score > 0.0 {
                    *score *= lambda.powi(*count as i32);
                }
            }
        }
        *count += 1;
    }
}

/// Deterministic final ordering: rerank score, then semantic score, then
/// chunk id, so identical inputs always produce identical output.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.rerank
            .partial_cmp(&a.rerank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.semantic
                    .unwrap_or(f32::MIN)
                    .partial_cmp(&a.semantic.unwrap_or(f32::MIN))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

#[async_trait]
impl SourceRetriever for CorpusRetriever {
    fn origin(&self) -> Origin {
        Origin::Corpus
    }

    async fn search(
        &self,
        query: &SearchQuery,
        settings: &Settings,
        deadline: Instant,
    ) -> Result<SourceHits, BranchError> {
        if settings.lexical_top_k == 0 && settings.semantic_top_k == 0 {
            return Ok(SourceHits::default());
        }
        if settings.rerank_top_k == 0 {
            return Ok(SourceHits::default());
        }

        let branch_deadline = deadline.min(Instant::now() + settings.per_source_timeout());

        // Both first-stage branches run concurrently under the per-source
        // timeout. A timed-out branch contributes nothing; it does not
        // cancel the other.
        let lexical_fut = async {
            let result = self.index.search(&query.text, settings.lexical_top_k);
            if result.stale {
                tracing::debug!("lexical index rebuilding, relying on semantic hits");
            }
            result.hits
        };
        let semantic_fut = self.semantic_branch(&query.text, settings.semantic_top_k);

        let (lexical_out, semantic_out) = tokio::join!(
            timeout_at(branch_deadline, lexical_fut),
            timeout_at(branch_deadline, semantic_fut),
        );

        let lexical_hits: Vec<(String, f32)> = lexical_out.unwrap_or_default();
        let semantic_hits: Vec<StoredChunk> = match semantic_out {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!("semantic branch timed out");
                Vec::new()
            }
        };

        // Merge into one candidate set keyed by chunk id, keeping whichever
        // scores each branch produced. A missing score stays absent rather
        // than becoming zero.
        let mut by_id: HashMap<String, Candidate> = HashMap::new();

        let semantic_scores: Vec<(String, f32)> = semantic_hits
            .iter()
            .map(|h| (h.id.clone(), h.score))
            .collect();

        for chunk in semantic_hits {
            let score = chunk.score;
            by_id.insert(
                chunk.id.clone(),
                Candidate {
                    chunk,
                    lexical: None,
                    semantic: Some(score),
                    rerank: None,
                },
            );
        }

        let lexical_only_ids: Vec<String> = lexical_hits
            .iter()
            .filter(|(id, _)| !by_id.contains_key(id))
            .map(|(id, _)| id.clone())
            .collect();

        if !lexical_only_ids.is_empty() {
            let hydrated = match self.store.get_by_ids(&lexical_only_ids).await {
                Ok(chunks) => chunks,
                Err(StoreError::Unavailable(msg)) => return Err(BranchError::Unavailable(msg)),
                Err(e) => return Err(BranchError::Backend(e.to_string())),
            };
            for chunk in hydrated {
                by_id.insert(
                    chunk.id.clone(),
                    Candidate {
                        chunk,
                        lexical: None,
                        semantic: None,
                        rerank: None,
                    },
                );
            }
        }

        for (id, score) in &lexical_hits {
            if let Some(candidate) = by_id.get_mut(id) {
                candidate.lexical = Some(*score);
            }
        }

        if by_id.is_empty() {
            return Ok(SourceHits::default());
        }

        let mut candidates: Vec<Candidate> = by_id.into_values().collect();

        // Best-first pre-order so near-duplicate removal keeps the stronger
        // copy, then drop the echoes before the cross-encoder sees them.
        candidates.sort_by(|a, b| {
            b.semantic
                .unwrap_or(f32::MIN)
                .partial_cmp(&a.semantic.unwrap_or(f32::MIN))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.lexical
                        .unwrap_or(f32::MIN)
                        .partial_cmp(&a.lexical.unwrap_or(f32::MIN))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        dedup_near_identical(&mut candidates);

        // Second stage: one batched cross-encoder call over the deduplicated
        // candidate set, or the weighted fusion fallback.
        let rerank_started = StdInstant::now();
        let mut fallback = false;

        match self.rerank_candidates(&query.text, &candidates, deadline).await {
            Some(scores) => {
                let score_map: HashMap<String, f32> = scores.into_iter().collect();
                for candidate in candidates.iter_mut() {
                    candidate.rerank = Some(
                        score_map
                            .get(&candidate.chunk.id)
                            .copied()
                            .unwrap_or(f32::MIN),
                    );
                }
            }
            None => {
                fallback = true;
                let fused = fusion::weighted_merge(&lexical_hits, &semantic_scores);
                for candidate in candidates.iter_mut() {
                    candidate.rerank =
                        Some(fused.get(&candidate.chunk.id).copied().unwrap_or(0.0));
                }
            }
        }

        let rerank_elapsed = rerank_started.elapsed().as_millis() as u64;

        // Diversity runs before the score floor and the top-k cut: the
        // penalty rewrites the canonical rerank score, so a repeated-document
        // chunk diluted below min_score is dropped, never served with a
        // score it no longer has.
        sort_candidates(&mut candidates);
        apply_mmr_diversity(&mut candidates, MMR_LAMBDA);
        sort_candidates(&mut candidates);
        candidates.retain(|c| c.rerank.unwrap_or(f32::MIN) >= settings.min_score);
        candidates.truncate(settings.rerank_top_k);

        self.expand_with_neighbors(&mut candidates).await;

        let hits: Vec<RetrievalHit> = candidates
            .into_iter()
            .map(|c| RetrievalHit {
                id: c.chunk.id.clone(),
                text: c.chunk.text.clone(),
                origin: Origin::Corpus,
                locator: Self::locator_for(&c.chunk),
                lexical: c.lexical,
                semantic: c.semantic,
                rerank: c.rerank,
            })
            .collect();

        tracing::debug!(
            query = %query.text,
            hits = hits.len(),
            rerank_elapsed_ms = rerank_elapsed,
            fallback = fallback,
            "corpus retrieval complete"
        );

        Ok(SourceHits {
            hits,
            rerank: Some(RerankReport {
                elapsed_ms: rerank_elapsed,
                fallback,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::LexicalConfig;
    use crate::storage::StoreError;
    use crate::types::{ChunkMetadata, ChunkRecord, ContentKind, DocumentInfo};
    use parking_lot::RwLock;

    struct MemStore {
        chunks: RwLock<Vec<ChunkRecord>>,
    }

    impl MemStore {
        fn with(chunks: Vec<ChunkRecord>) -> Arc<Self> {
            Arc::new(Self {
                chunks: RwLock::new(chunks),
            })
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    fn stored(c: &ChunkRecord, score: f32) -> StoredChunk {
        StoredChunk {
            id: c.id.clone(),
            doc_id: c.doc_id.clone(),
            chunk_index: c.chunk_index,
            text: c.text.clone(),
            metadata: c.metadata.clone(),
            score,
        }
    }

    #[async_trait]
    impl ChunkStore for MemStore {
        async fn add(&self, _chunks: Vec<ChunkRecord>) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn delete_by_document(&self, _doc_id: &str) -> Result<usize, StoreError> {
            unimplemented!()
        }
        async fn semantic_search(
            &self,
            vector: &[f32],
            k: usize,
            _filter: Option<&str>,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            let chunks = self.chunks.read();
            let mut scored: Vec<StoredChunk> = chunks
                .iter()
                .map(|c| stored(c, cosine(vector, &c.vector)))
                .collect();
            scored.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(k);
            Ok(scored)
        }
        async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<StoredChunk>, StoreError> {
            let chunks = self.chunks.read();
            Ok(chunks
                .iter()
                .filter(|c| ids.contains(&c.id))
                .map(|c| stored(c, 0.0))
                .collect())
        }
        async fn get_neighbors(
            &self,
            doc_id: &str,
            chunk_index: u32,
            window: u32,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            let chunks = self.chunks.read();
            let low = chunk_index.saturating_sub(window);
            let high = chunk_index.saturating_add(window);
            let mut neighbors: Vec<StoredChunk> = chunks
                .iter()
                .filter(|c| {
                    c.doc_id == doc_id
                        && c.chunk_index != chunk_index
                        && c.chunk_index >= low
                        && c.chunk_index <= high
                })
                .map(|c| stored(c, 0.0))
                .collect();
            neighbors.sort_by_key(|c| c.chunk_index);
            Ok(neighbors)
        }
        async fn list(
            &self,
            _filter: Option<&str>,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            let chunks = self.chunks.read();
            Ok(chunks
                .iter()
                .skip(offset)
                .take(limit)
                .map(|c| stored(c, 0.0))
                .collect())
        }
        async fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError> {
            unimplemented!()
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Ok(self.chunks.read().len())
        }
        fn version(&self) -> u64 {
            0
        }
    }

    struct FixedEmbedder {
        vector: Option<Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed_query(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            self.vector
                .clone()
                .ok_or_else(|| anyhow::anyhow!("embedder offline"))
        }
        async fn embed_documents(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("not used")
        }
        fn dimension(&self) -> usize {
            3
        }
    }

    fn record(id: &str, doc: &str, index: u32, text: &str, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.into(),
            doc_id: doc.into(),
            chunk_index: index,
            text: text.into(),
            vector,
            metadata: ChunkMetadata {
                title: "t".into(),
                section: "s".into(),
                page: None,
                timestamp_start: None,
                timestamp_end: None,
                extraction: "text".into(),
                kind: ContentKind::Text,
                keywords: vec![],
                ingested_at: 0,
                extra: Default::default(),
            },
        }
    }

    fn settings() -> Settings {
        Settings {
            lexical_top_k: 10,
            semantic_top_k: 10,
            rerank_top_k: 5,
            web_results: 5,
            web_pages_parsed: 2,
            deadline_ms: 5_000,
            per_source_timeout_ms: 2_000,
            min_score: f32::NEG_INFINITY,
            generator_model: "m".into(),
            temperature: 0.0,
            max_tokens: 128,
            cache_ttl_s: 60,
        }
    }

    async fn retriever_for(
        chunks: Vec<ChunkRecord>,
        embedder_vector: Option<Vec<f32>>,
    ) -> CorpusRetriever {
        let store = MemStore::with(chunks);
        let index = Arc::new(LexicalIndex::new(LexicalConfig::default()));
        if store.count().await.unwrap() > 0 {
            index
                .rebuild_from(store.as_ref() as &dyn ChunkStore)
                .await
                .unwrap();
        }
        CorpusRetriever::new(
            store as Arc<dyn ChunkStore>,
            index,
            Arc::new(FixedEmbedder {
                vector: embedder_vector,
            }),
            None,
        )
    }

    fn query(text: &str) -> SearchQuery {
        SearchQuery::passthrough(text, Default::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embedder_failure_degrades_to_lexical_only() {
        let retriever = retriever_for(
            vec![record("a", "d1", 0, "session opening drive momentum", vec![1.0, 0.0, 0.0])],
            None,
        )
        .await;

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let result = retriever
            .search(&query("opening drive"), &settings(), deadline)
            .await
            .unwrap();

        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].lexical.is_some());
        assert!(result.hits[0].semantic.is_none());
        // Canonical sort key still present via the fallback path.
        assert!(result.hits[0].rerank.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn min_score_drops_weak_candidates() {
        let retriever = retriever_for(
            vec![
                record("a", "d1", 0, "opening drive momentum entry", vec![1.0, 0.0, 0.0]),
                record("b", "d2", 0, "completely different material", vec![0.0, 1.0, 0.0]),
            ],
            Some(vec![1.0, 0.0, 0.0]),
        )
        .await;

        let mut s = settings();
        s.min_score = 0.5;
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let result = retriever
            .search(&query("opening drive entry"), &s, deadline)
            .await
            .unwrap();

        // Only the candidate scoring above the floor survives.
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].id, "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn near_duplicate_chunks_collapse_to_one() {
        let text_a = "the opening range breakout enters long above the thirty minute high";
        // Same words, one appended token: Jaccard well above the threshold.
        let text_b = "the opening range breakout enters long above the thirty minute high today";
        let retriever = retriever_for(
            vec![
                record("a", "d1", 0, text_a, vec![1.0, 0.0, 0.0]),
                record("b", "d1", 1, text_b, vec![0.99, 0.1, 0.0]),
            ],
            Some(vec![1.0, 0.0, 0.0]),
        )
        .await;

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let result = retriever
            .search(&query("opening range breakout"), &settings(), deadline)
            .await
            .unwrap();

        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn neighbors_are_stitched_around_the_hit() {
        let retriever = retriever_for(
            vec![
                record("a0", "d1", 0, "Context before the entry rule.", vec![0.0, 0.0, 1.0]),
                record("a1", "d1", 1, "Enter long above the breakout level.", vec![1.0, 0.0, 0.0]),
                record("a2", "d1", 2, "Exit at the measured move target.", vec![0.0, 0.0, 1.0]),
            ],
            Some(vec![1.0, 0.0, 0.0]),
        )
        .await;

        let mut s = settings();
        s.rerank_top_k = 1;
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let result = retriever
            .search(&query("breakout entry"), &s, deadline)
            .await
            .unwrap();

        assert_eq!(result.hits.len(), 1);
        let text = &result.hits[0].text;
        let before = text.find("Context before").unwrap();
        let anchor = text.find("Enter long").unwrap();
        let after = text.find("Exit at").unwrap();
        assert!(before < anchor && anchor < after);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn diversity_penalty_is_applied_before_the_score_floor() {
        // Two chunks from the same document and one from another. The second
        // d1 chunk clears min_score on its raw fused score (0.5) but not
        // after the 0.7 diversity penalty (0.35), so it must be dropped, not
        // served with a score it no longer has.
        let retriever = retriever_for(
            vec![
                record("x1", "d1", 0, "alpha beta one", vec![1.0, 0.0, 0.0]),
                record("x2", "d1", 5, "alpha beta two", vec![0.95, 0.312, 0.0]),
                record("y", "d2", 0, "alpha beta three", vec![0.9, 0.435, 0.0]),
            ],
            Some(vec![1.0, 0.0, 0.0]),
        )
        .await;

        let mut s = settings();
        s.min_score = 0.4;
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let result = retriever
            .search(&query("alpha beta"), &s, deadline)
            .await
            .unwrap();

        let ids: Vec<&str> = result.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["x1"]);
        // The survivor's reported score is its canonical post-penalty value.
        assert!(result.hits[0].rerank.unwrap() >= s.min_score);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_inputs_produce_identical_order() {
        let chunks = vec![
            record("z", "d1", 0, "alpha beta gamma", vec![0.7, 0.3, 0.0]),
            record("a", "d2", 0, "alpha beta delta", vec![0.7, 0.3, 0.0]),
            record("m", "d3", 0, "alpha beta epsilon", vec![0.7, 0.3, 0.0]),
        ];
        let retriever = retriever_for(chunks.clone(), Some(vec![1.0, 0.0, 0.0])).await;
        let retriever2 = retriever_for(chunks, Some(vec![1.0, 0.0, 0.0])).await;

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let r1 = retriever
            .search(&query("alpha beta"), &settings(), deadline)
            .await
            .unwrap();
        let r2 = retriever2
            .search(&query("alpha beta"), &settings(), deadline)
            .await
            .unwrap();

        let ids1: Vec<&str> = r1.hits.iter().map(|h| h.id.as_str()).collect();
        let ids2: Vec<&str> = r2.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids1, ids2);
        // Equal scores everywhere, so ties broke on id.
        assert_eq!(ids1, vec!["a", "m", "z"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_top_k_skips_everything() {
        let retriever = retriever_for(
            vec![record("a", "d1", 0, "anything", vec![1.0, 0.0, 0.0])],
            Some(vec![1.0, 0.0, 0.0]),
        )
        .await;

        let deadline = Instant::now() + std::time::Duration::from_secs(5);

        let mut s = settings();
        s.lexical_top_k = 0;
        s.semantic_top_k = 0;
        let result = retriever.search(&query("anything"), &s, deadline).await.unwrap();
        assert!(result.hits.is_empty());
        assert!(result.rerank.is_none());

        let mut s = settings();
        s.rerank_top_k = 0;
        let result = retriever.search(&query("anything"), &s, deadline).await.unwrap();
        assert!(result.hits.is_empty());
    }
}
