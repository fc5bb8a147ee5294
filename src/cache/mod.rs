//! Response cache.
//!
//! Identical recent requests are answered from here. Correctness does not
//! depend on eviction: the fingerprint includes the corpus version, so any
//! ingest or delete makes prior entries unreachable and they age out lazily.

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::types::{AnswerRecord, Mode, Settings};

/// Collapse whitespace and lowercase, so formatting differences in the same
/// question share a cache entry.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Deterministic cache key over everything that can change the answer:
/// the normalized query, mode, output-relevant settings, generator model,
/// the user's memory blob, and the current corpus version.
pub fn fingerprint(
    query: &str,
    mode: Mode,
    settings: &Settings,
    corpus_version: u64,
    memory_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0]);
    hasher.update(mode.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(settings.generator_model.as_bytes());
    hasher.update([0]);
    hasher.update(settings.temperature.to_le_bytes());
    hasher.update(settings.max_tokens.to_le_bytes());
    hasher.update(settings.rerank_top_k.to_le_bytes());
    hasher.update(settings.min_score.to_le_bytes());
    hasher.update(settings.web_results.to_le_bytes());
    hasher.update([0]);
    hasher.update(corpus_version.to_le_bytes());
    hasher.update([0]);
    hasher.update(memory_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a user's memory blob for fingerprinting. The empty blob hashes
/// too, so requests without memory still get stable keys.
pub fn memory_hash(serialized_memory: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized_memory.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ResponseCache {
    entries: DashMap<String, AnswerRecord>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up a fingerprint. Expired entries are removed on read.
    pub fn get(&self, fingerprint: &str) -> Option<AnswerRecord> {
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.entries.get(fingerprint) {
            if entry.expires_at > now {
                return Some(entry.clone());
            }
        }
        self.entries.remove(fingerprint);
        None
    }

    /// Idempotent on identical keys: last writer wins, readers never see a
    /// torn record.
    pub fn put(&self, record: AnswerRecord) {
        self.entries.insert(record.fingerprint.clone(), record);
    }

    /// Drop entries keyed under an old corpus version. Callers run this
    /// after an ingest; entries are already unreachable by key, this just
    /// frees the memory.
    pub fn invalidate_by_version(&self, old_corpus_version: u64) {
        self.entries
            .retain(|_, record| record.corpus_version > old_corpus_version);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheStatus, ResponseMetadata};
    use std::collections::BTreeMap;

    fn settings() -> Settings {
        Settings {
            lexical_top_k: 20,
            semantic_top_k: 20,
            rerank_top_k: 8,
            web_results: 10,
            web_pages_parsed: 3,
            deadline_ms: 30_000,
            per_source_timeout_ms: 8_000,
            min_score: 0.0,
            generator_model: "llama3".into(),
            temperature: 0.2,
            max_tokens: 512,
            cache_ttl_s: 300,
        }
    }

    fn record(fp: &str, version: u64, expires_at: i64) -> AnswerRecord {
        AnswerRecord {
            answer: "hello".into(),
            citations: vec![],
            metadata: ResponseMetadata {
                request_id: "r".into(),
                cache_status: CacheStatus::Miss,
                per_source: BTreeMap::new(),
                rerank_elapsed_ms: 0,
                rerank_fallback: false,
                planner_fallback: false,
                generator_elapsed_ms: 0,
                truncated_blocks: 0,
                invalid_citation_refs: 0,
                degraded_sources: vec![],
                corpus_version: version,
            },
            generator_model: "llama3".into(),
            fingerprint: fp.into(),
            corpus_version: version,
            created_at: 0,
            expires_at,
        }
    }

    #[test]
    fn fingerprint_is_stable_under_whitespace_and_case() {
        let s = settings();
        let a = fingerprint("When do I  enter?", Mode::CorpusOnly, &s, 1, "m");
        let b = fingerprint("when do i enter?", Mode::CorpusOnly, &s, 1, "m");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_version_mode_and_relevant_settings() {
        let s = settings();
        let base = fingerprint("q", Mode::CorpusOnly, &s, 1, "m");
        assert_ne!(base, fingerprint("q", Mode::CorpusOnly, &s, 2, "m"));
        assert_ne!(base, fingerprint("q", Mode::Combined, &s, 1, "m"));
        assert_ne!(base, fingerprint("q", Mode::CorpusOnly, &s, 1, "other"));

        let mut changed = settings();
        changed.rerank_top_k = 3;
        assert_ne!(base, fingerprint("q", Mode::CorpusOnly, &changed, 1, "m"));

        // Settings that do not affect the answer shape keep the key.
        let mut irrelevant = settings();
        irrelevant.per_source_timeout_ms = 1234;
        assert_eq!(base, fingerprint("q", Mode::CorpusOnly, &irrelevant, 1, "m"));
    }

    #[test]
    fn get_respects_ttl() {
        let cache = ResponseCache::new();
        let future = chrono::Utc::now().timestamp() + 60;
        let past = chrono::Utc::now().timestamp() - 60;

        cache.put(record("live", 1, future));
        cache.put(record("dead", 1, past));

        assert!(cache.get("live").is_some());
        assert!(cache.get("dead").is_none());
        // Expired entry was removed on read.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_is_idempotent_last_writer_wins() {
        let cache = ResponseCache::new();
        let future = chrono::Utc::now().timestamp() + 60;
        cache.put(record("fp", 1, future));
        let mut second = record("fp", 1, future);
        second.answer = "updated".into();
        cache.put(second);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fp").unwrap().answer, "updated");
    }

    #[test]
    fn invalidate_by_version_sweeps_old_entries() {
        let cache = ResponseCache::new();
        let future = chrono::Utc::now().timestamp() + 60;
        cache.put(record("old", 1, future));
        cache.put(record("new", 2, future));

        cache.invalidate_by_version(1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }
}
