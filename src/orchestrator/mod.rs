//! End-to-end request driver.
//!
//! One request flows: cache lookup → planning → fan-out over the enabled
//! sources → merge → prompt assembly → generation → cache write. Branches
//! run concurrently under a shared deadline; a failed branch degrades the
//! answer unless its mode makes it mandatory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};

use crate::cache::{fingerprint, memory_hash, ResponseCache};
use crate::error::RagError;
use crate::generator::Generator;
use crate::planner::{PlannerOutput, QueryPlanner};
use crate::profile::ProfileStore;
use crate::prompt::PromptAssembler;
use crate::retrieval::{BranchError, RerankReport, SourceRetriever};
use crate::storage::ChunkStore;
use crate::types::{
    AnswerRecord, AskResponse, CacheStatus, DegradedSource, HistoryTurn, Mode, Origin,
    ResponseMetadata, RetrievalHit, SearchQuery, Settings, SettingsPatch, SourceStats,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
    #[serde(default)]
    pub history: Option<Vec<HistoryTurn>>,
    #[serde(default)]
    pub user: Option<String>,
}

/// What one branch produced, successful or not.
struct BranchOutcome {
    origin: Origin,
    hits: Vec<RetrievalHit>,
    elapsed_ms: u64,
    rerank: Option<RerankReport>,
    /// Set when every task of the branch failed.
    error: Option<BranchError>,
    /// Reasons from individual failed tasks, for the degraded report.
    failures: Vec<String>,
}

pub struct Orchestrator {
    defaults: Settings,
    planner: QueryPlanner,
    cache: Arc<ResponseCache>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ChunkStore>,
    profiles: Arc<ProfileStore>,
    sources: HashMap<Origin, Arc<dyn SourceRetriever>>,
}

impl Orchestrator {
    pub fn new(
        defaults: Settings,
        planner: QueryPlanner,
        cache: Arc<ResponseCache>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn ChunkStore>,
        profiles: Arc<ProfileStore>,
        sources: Vec<Arc<dyn SourceRetriever>>,
    ) -> Self {
        let sources = sources.into_iter().map(|s| (s.origin(), s)).collect();
        Self {
            defaults,
            planner,
            cache,
            generator,
            store,
            profiles,
            sources,
        }
    }

    pub fn source_available(&self, origin: Origin) -> bool {
        self.sources.contains_key(&origin)
    }

    /// Planner output without retrieval or generation, for `/plan-queries`.
    pub async fn plan_only(&self, query: &str, mode: Option<Mode>) -> Result<PlannerOutput, RagError> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidRequest("query must not be empty".into()));
        }
        let mode = mode.unwrap_or(Mode::CorpusOnly);
        let deadline = Instant::now() + self.defaults.deadline();
        Ok(self.planner.plan(query, mode, &self.defaults, deadline).await)
    }

    /// Drive one question end to end.
    pub async fn ask(&self, req: AskRequest, default_mode: Mode) -> Result<AskResponse, RagError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let total_started = StdInstant::now();

        // Validation happens before any outbound call.
        if req.query.trim().is_empty() {
            return Err(RagError::InvalidRequest("query must not be empty".into()));
        }
        let settings = match &req.settings {
            Some(patch) => self.defaults.apply(patch),
            None => self.defaults.clone(),
        };
        if settings.deadline_ms == 0 {
            return Err(RagError::InvalidRequest("deadline must be > 0".into()));
        }

        let mode = req.mode.unwrap_or(default_mode);
        if let Some(mandatory) = mode.mandatory_origin() {
            if !self.source_available(mandatory) {
                return Err(RagError::InvalidRequest(format!(
                    "{} mode is disabled: the {} backend is not configured",
                    mode.as_str(),
                    mandatory.as_str()
                )));
            }
        }
        let enabled: Vec<Origin> = mode
            .enabled_origins()
            .iter()
            .copied()
            .filter(|origin| self.source_available(*origin))
            .collect();

        // Cache consult. A hit short-circuits everything downstream.
        let profile = req
            .user
            .as_deref()
            .map(|user| self.profiles.load(user))
            .unwrap_or_default();
        let mem_hash = memory_hash(&profile.memory_blob());
        let corpus_version = self.store.version();
        let fp = fingerprint(&req.query, mode, &settings, corpus_version, &mem_hash);

        if let Some(record) = self.cache.get(&fp) {
            tracing::info!(request_id = %request_id, fingerprint = %fp, "cache hit");
            let mut metadata = record.metadata.clone();
            metadata.request_id = request_id;
            metadata.cache_status = CacheStatus::Hit;
            metadata.generator_elapsed_ms = 0;
            return Ok(AskResponse {
                answer: record.answer,
                citations: record.citations,
                metadata,
            });
        }

        let deadline = Instant::now() + settings.deadline();

        // Plan. Never fails; at worst it echoes the original query.
        let plan = self.planner.plan(&req.query, mode, &settings, deadline).await;
        let planner_fallback = plan.llm_fallback;
        let queries = Arc::new(plan.queries);

        // Fan out: one task per (source, planned query), all under the
        // per-source timeout, all capped by the request deadline.
        let branch_futures = enabled.iter().map(|&origin| {
            let source = Arc::clone(&self.sources[&origin]);
            let queries = Arc::clone(&queries);
            let settings = settings.clone();
            async move {
                run_branch(origin, source, queries.as_slice(), &settings, deadline).await
            }
        });
        let outcomes: Vec<BranchOutcome> = join_all(branch_futures).await;

        // Merge bookkeeping.
        let mut per_source: BTreeMap<String, SourceStats> = BTreeMap::new();
        let mut degraded: Vec<DegradedSource> = Vec::new();
        let mut rerank_elapsed_ms = 0u64;
        let mut rerank_fallback = false;
        let mut merged: Vec<RetrievalHit> = Vec::new();
        let mut seen: std::collections::HashSet<(Origin, String)> = Default::default();
        let mut errored_branches = 0usize;
        let mut all_timeouts = true;

        // Origin precedence: corpus (already reranked), then notes, then
        // web. No reranking across origins.
        for origin in [Origin::Corpus, Origin::Note, Origin::Web] {
            let Some(outcome) = outcomes.iter().find(|o| o.origin == origin) else {
                continue;
            };

            per_source.insert(
                origin.as_str().to_string(),
                SourceStats {
                    hit_count: outcome.hits.len(),
                    elapsed_ms: outcome.elapsed_ms,
                },
            );

            if let Some(report) = outcome.rerank {
                rerank_elapsed_ms += report.elapsed_ms;
                rerank_fallback |= report.fallback;
            }

            if let Some(error) = &outcome.error {
                errored_branches += 1;
                if !matches!(error, BranchError::Timeout) {
                    all_timeouts = false;
                }
                if let Some(mandatory) = mode.mandatory_origin() {
                    if mandatory == origin {
                        return Err(RagError::SourceUnavailable(format!(
                            "{} branch failed: {}",
                            origin.as_str(),
                            error
                        )));
                    }
                }
            }
            for reason in &outcome.failures {
                degraded.push(DegradedSource {
                    source: origin.as_str().to_string(),
                    reason: reason.clone(),
                });
            }

            for hit in &outcome.hits {
                let key = (origin, hit.locator.dedup_key());
                if seen.insert(key) {
                    merged.push(hit.clone());
                }
            }
        }

        if !outcomes.is_empty() && errored_branches == outcomes.len() {
            return Err(if all_timeouts {
                RagError::DeadlineExceeded(
                    "no retrieval branch produced results before the deadline".into(),
                )
            } else {
                RagError::SourceUnavailable("every enabled retrieval branch failed".into())
            });
        }

        // Assemble and generate. Generation errors are fatal; no partial
        // answer is invented.
        let bundle = PromptAssembler::assemble(
            mode,
            &req.query,
            &merged,
            &profile.memory_facts(),
            profile.override_for(mode),
            req.history.as_deref().unwrap_or(&[]),
            &settings.generator_model,
            settings.max_tokens,
        );

        let generation_started = StdInstant::now();
        let output = self
            .generator
            .generate(
                bundle.rendered(),
                &settings.generator_model,
                settings.temperature,
                settings.max_tokens,
                deadline,
            )
            .await?;
        let generator_elapsed_ms = generation_started.elapsed().as_millis() as u64;

        let citation_check = crate::prompt::check_citations(&output.text, bundle.blocks.len());
        if !citation_check.invalid_refs.is_empty() {
            tracing::warn!(
                request_id = %request_id,
                invalid = ?citation_check.invalid_refs,
                blocks = bundle.blocks.len(),
                "answer cites blocks that were not in the prompt"
            );
        }

        let citations = bundle.citations();
        let now = chrono::Utc::now().timestamp();
        let metadata = ResponseMetadata {
            request_id: request_id.clone(),
            cache_status: CacheStatus::Miss,
            per_source,
            rerank_elapsed_ms,
            rerank_fallback,
            planner_fallback,
            generator_elapsed_ms,
            truncated_blocks: bundle.truncation.dropped_hit_ids.len(),
            invalid_citation_refs: citation_check.invalid_refs.len(),
            degraded_sources: degraded,
            corpus_version,
        };

        let record = AnswerRecord {
            answer: output.text.clone(),
            citations: citations.clone(),
            metadata: metadata.clone(),
            generator_model: output.model,
            fingerprint: fp,
            corpus_version,
            created_at: now,
            expires_at: now + settings.cache_ttl_s as i64,
        };
        // Past-deadline bookkeeping is best effort; the answer ships anyway.
        self.cache.put(record);

        tracing::info!(
            request_id = %request_id,
            mode = mode.as_str(),
            total_elapsed_ms = total_started.elapsed().as_millis() as u64,
            generator_elapsed_ms = generator_elapsed_ms,
            rerank_elapsed_ms = rerank_elapsed_ms,
            citations = citations.len(),
            degraded = metadata.degraded_sources.len(),
            "request complete"
        );

        Ok(AskResponse {
            answer: output.text,
            citations,
            metadata,
        })
    }
}

/// Run every planned query against one source. Queries run concurrently;
/// results merge in plan order so output is deterministic. The branch errors
/// only when every task failed.
async fn run_branch(
    origin: Origin,
    source: Arc<dyn SourceRetriever>,
    queries: &[SearchQuery],
    settings: &Settings,
    deadline: Instant,
) -> BranchOutcome {
    let started = StdInstant::now();

    let task_futures = queries.iter().map(|query| {
        let source = Arc::clone(&source);
        async move {
            // The corpus retriever budgets its own stages: first-stage
            // search under the per-source timeout, reranking under half the
            // remaining deadline. Wrapping it again here would count the
            // rerank budget against the per-source timeout.
            let task_deadline = if origin == Origin::Corpus {
                deadline
            } else {
                deadline.min(Instant::now() + settings.per_source_timeout())
            };
            match timeout_at(task_deadline, source.search(query, settings, deadline)).await {
                Ok(Ok(hits)) => Ok(hits),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BranchError::Timeout),
            }
        }
    });

    let results = join_all(task_futures).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut hits = Vec::new();
    let mut rerank: Option<RerankReport> = None;
    let mut failures = Vec::new();
    let mut succeeded = 0usize;
    let mut last_error: Option<BranchError> = None;

    for result in results {
        match result {
            Ok(source_hits) => {
                succeeded += 1;
                if let Some(report) = source_hits.rerank {
                    let merged = rerank.get_or_insert(RerankReport::default());
                    merged.elapsed_ms += report.elapsed_ms;
                    merged.fallback |= report.fallback;
                }
                hits.extend(source_hits.hits);
            }
            Err(e) => {
                tracing::warn!(origin = origin.as_str(), error = %e, "retrieval task failed");
                failures.push(e.to_string());
                last_error = Some(e);
            }
        }
    }

    BranchOutcome {
        origin,
        hits,
        elapsed_ms,
        rerank,
        error: if succeeded == 0 { last_error } else { None },
        failures,
    }
}
