use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::Settings;

/// Process-wide configuration, read from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// When set, bearer tokens must match it exactly. When unset any
    /// non-empty bearer token is accepted (the real auth layer sits in
    /// front of this service).
    pub api_token: Option<String>,

    pub deadline_ms: u64,
    pub per_source_timeout_ms: u64,
    pub lexical_top_k: usize,
    pub semantic_top_k: usize,
    pub rerank_top_k: usize,
    pub min_rerank_score: f32,
    pub web_results: usize,
    pub web_pages_parsed: usize,
    pub cache_ttl_s: u64,

    pub generator_model: String,
    pub generator_max_concurrency: usize,
    pub temperature: f32,
    pub max_tokens: usize,

    pub chunk_store_url: String,
    pub notes_api_url: Option<String>,
    pub notes_api_key: Option<String>,
    pub metasearch_url: Option<String>,
    pub llm_base_url: String,

    pub reranker_model_dir: Option<PathBuf>,
    pub embedding_model: String,
    pub embedding_dimension: usize,

    pub upload_dir: PathBuf,
    pub profile_dir: PathBuf,

    /// Queries shorter than this many estimated tokens go through LLM
    /// expansion in the planner.
    pub planner_expand_below_tokens: usize,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quorum-rag");

        Self {
            bind_addr: env_string("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8087".to_string()),
            api_token: env_string("API_TOKEN"),

            deadline_ms: env_parse("DEADLINE_MS", 30_000),
            per_source_timeout_ms: env_parse("PER_SOURCE_TIMEOUT_MS", 8_000),
            lexical_top_k: env_parse("LEXICAL_TOP_K", 25),
            semantic_top_k: env_parse("SEMANTIC_TOP_K", 25),
            rerank_top_k: env_parse("RERANK_TOP_K", 8),
            min_rerank_score: env_parse("MIN_RERANK_SCORE", f32::NEG_INFINITY),
            web_results: env_parse("WEB_RESULTS", 8),
            web_pages_parsed: env_parse("WEB_PAGES_PARSED", 3),
            cache_ttl_s: env_parse("CACHE_TTL_S", 300),

            generator_model: env_string("GENERATOR_MODEL").unwrap_or_else(|| "llama3.1".to_string()),
            generator_max_concurrency: env_parse("GENERATOR_MAX_CONCURRENCY", 2),
            temperature: env_parse("GENERATOR_TEMPERATURE", 0.2),
            max_tokens: env_parse("GENERATOR_MAX_TOKENS", 1024),

            chunk_store_url: env_string("CHUNK_STORE_URL")
                .unwrap_or_else(|| data_dir.join("lance_data").display().to_string()),
            notes_api_url: env_string("NOTES_API_URL"),
            notes_api_key: env_string("NOTES_API_KEY"),
            metasearch_url: env_string("METASEARCH_URL"),
            llm_base_url: env_string("LLM_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),

            reranker_model_dir: env_string("RERANKER_MODEL_DIR").map(PathBuf::from),
            embedding_model: env_string("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            embedding_dimension: env_parse("EMBEDDING_DIMENSION", 768),

            upload_dir: env_string("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("uploads")),
            profile_dir: env_string("PROFILE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("profiles")),

            planner_expand_below_tokens: env_parse("PLANNER_EXPAND_BELOW_TOKENS", 24),
        }
    }

    /// Validate values that would otherwise fail in confusing ways deep
    /// inside the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.deadline_ms == 0 {
            return Err("DEADLINE_MS must be > 0".into());
        }
        if self.per_source_timeout_ms == 0 {
            return Err("PER_SOURCE_TIMEOUT_MS must be > 0".into());
        }
        if self.per_source_timeout_ms > self.deadline_ms {
            return Err("PER_SOURCE_TIMEOUT_MS must be <= DEADLINE_MS".into());
        }
        if self.embedding_dimension == 0 {
            return Err("EMBEDDING_DIMENSION must be > 0".into());
        }
        if self.generator_max_concurrency == 0 {
            return Err("GENERATOR_MAX_CONCURRENCY must be > 0".into());
        }
        if self.web_pages_parsed > self.web_results {
            return Err("WEB_PAGES_PARSED must be <= WEB_RESULTS".into());
        }
        Ok(())
    }

    /// Server-side default request settings; per-request overrides merge on top.
    pub fn default_settings(&self) -> Settings {
        Settings {
            lexical_top_k: self.lexical_top_k,
            semantic_top_k: self.semantic_top_k,
            rerank_top_k: self.rerank_top_k,
            web_results: self.web_results,
            web_pages_parsed: self.web_pages_parsed,
            deadline_ms: self.deadline_ms,
            per_source_timeout_ms: self.per_source_timeout_ms,
            min_score: self.min_rerank_score,
            generator_model: self.generator_model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            cache_ttl_s: self.cache_ttl_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = ServerConfig::from_env();
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_inverted_timeouts() {
        let mut cfg = ServerConfig::from_env();
        cfg.per_source_timeout_ms = cfg.deadline_ms + 1;
        assert!(cfg.validate().is_err());
    }
}
