use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// What kind of content a chunk was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Table,
    Spreadsheet,
    Transcript,
    Frame,
    Note,
}

impl Default for ContentKind {
    fn default() -> Self {
        Self::Text
    }
}

/// Per-chunk metadata. Either `page` or the timestamp pair is set depending
/// on whether the source document is paged or time-based media.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkMetadata {
    pub title: String,
    pub section: String,
    pub page: Option<u32>,
    pub timestamp_start: Option<f64>,
    pub timestamp_end: Option<f64>,
    /// Tag of the extraction method that produced the text (parser, ocr, asr, ...).
    pub extraction: String,
    pub kind: ContentKind,
    pub keywords: Vec<String>,
    pub ingested_at: i64,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// One unit of indexed evidence. Chunks are immutable once written and are
/// removed as a set when their source document is deleted or re-ingested.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Which retrieval branch a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Corpus,
    Note,
    Web,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Corpus => "corpus",
            Self::Note => "note",
            Self::Web => "web",
        }
    }
}

/// Origin-specific citation locator. Serialized without a tag so each
/// variant produces the flat shape clients expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locator {
    Media {
        doc_id: String,
        timestamp_start: f64,
        timestamp_end: f64,
    },
    Document {
        doc_id: String,
        page: Option<u32>,
        section: String,
    },
    NoteFile {
        note_path: String,
        heading: Option<String>,
    },
    Page {
        url: String,
        title: String,
    },
}

impl Locator {
    /// Stable key for deduplication across branches.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Document { doc_id, page, section } => {
                format!("doc:{}:{}:{}", doc_id, page.unwrap_or(0), section)
            }
            Self::Media { doc_id, timestamp_start, .. } => {
                format!("media:{}:{}", doc_id, timestamp_start)
            }
            Self::NoteFile { note_path, heading } => {
                format!("note:{}:{}", note_path, heading.as_deref().unwrap_or(""))
            }
            Self::Page { url, .. } => format!("web:{}", url),
        }
    }
}

/// A candidate chunk returned by a retriever. Lives only for the duration
/// of one request. `rerank` is the canonical sort key once set; within one
/// result list either every hit carries it or none does.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub id: String,
    pub text: String,
    pub origin: Origin,
    pub locator: Locator,
    pub lexical: Option<f32>,
    pub semantic: Option<f32>,
    pub rerank: Option<f32>,
}

impl RetrievalHit {
    pub fn citation(&self) -> Citation {
        Citation {
            origin: self.origin,
            locator: self.locator.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub origin: Origin,
    #[serde(flatten)]
    pub locator: Locator,
}

/// Intent tag attached to a planned search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    News,
    Analysis,
    Data,
    General,
    Commentary,
    Clarification,
}

impl QueryIntent {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "news" => Some(Self::News),
            "analysis" => Some(Self::Analysis),
            "data" => Some(Self::Data),
            "general" => Some(Self::General),
            "commentary" => Some(Self::Commentary),
            "clarification" => Some(Self::Clarification),
            _ => None,
        }
    }
}

/// Entities recognized by the deterministic signal pass of the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    pub tickers: Vec<String>,
    pub dates: Vec<String>,
    pub indicators: Vec<String>,
    pub quoted_phrases: Vec<String>,
    pub time_references: Vec<String>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
            && self.dates.is_empty()
            && self.indicators.is_empty()
            && self.quoted_phrases.is_empty()
            && self.time_references.is_empty()
    }
}

/// Planner output: one concrete search to issue against the retrievers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub intent: QueryIntent,
    #[serde(default)]
    pub entities: ExtractedEntities,
    /// 1..=5, higher runs first.
    pub priority: u8,
    /// The original user query this was expanded from.
    pub expansion_of: String,
}

impl SearchQuery {
    pub fn passthrough(text: &str, entities: ExtractedEntities) -> Self {
        Self {
            text: text.to_string(),
            intent: QueryIntent::General,
            entities,
            priority: 3,
            expansion_of: text.to_string(),
        }
    }
}

/// Which retrieval branches run and which system prompt is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    CorpusOnly,
    NotesOnly,
    WebOnly,
    Combined,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CorpusOnly => "corpus-only",
            Self::NotesOnly => "notes-only",
            Self::WebOnly => "web-only",
            Self::Combined => "combined",
        }
    }

    pub fn enabled_origins(&self) -> &'static [Origin] {
        match self {
            Self::CorpusOnly => &[Origin::Corpus],
            Self::NotesOnly => &[Origin::Note],
            Self::WebOnly => &[Origin::Web],
            Self::Combined => &[Origin::Corpus, Origin::Note, Origin::Web],
        }
    }

    /// A single-source mode makes that source mandatory: a branch error
    /// fails the whole request instead of degrading it.
    pub fn mandatory_origin(&self) -> Option<Origin> {
        match self {
            Self::CorpusOnly => Some(Origin::Corpus),
            Self::NotesOnly => Some(Origin::Note),
            Self::WebOnly => Some(Origin::Web),
            Self::Combined => None,
        }
    }
}

/// Effective per-request configuration after merging caller overrides on
/// top of the server defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub lexical_top_k: usize,
    pub semantic_top_k: usize,
    pub rerank_top_k: usize,
    pub web_results: usize,
    pub web_pages_parsed: usize,
    pub deadline_ms: u64,
    pub per_source_timeout_ms: u64,
    pub min_score: f32,
    pub generator_model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub cache_ttl_s: u64,
}

impl Settings {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.per_source_timeout_ms)
    }

    pub fn apply(&self, patch: &SettingsPatch) -> Settings {
        let mut s = self.clone();
        if let Some(v) = patch.lexical_top_k {
            s.lexical_top_k = v;
        }
        if let Some(v) = patch.semantic_top_k {
            s.semantic_top_k = v;
        }
        if let Some(v) = patch.rerank_top_k {
            s.rerank_top_k = v;
        }
        if let Some(v) = patch.web_results {
            s.web_results = v;
        }
        if let Some(v) = patch.web_pages_parsed {
            s.web_pages_parsed = v;
        }
        if let Some(v) = patch.deadline_ms {
            s.deadline_ms = v;
        }
        if let Some(v) = patch.per_source_timeout_ms {
            s.per_source_timeout_ms = v;
        }
        if let Some(v) = patch.min_score {
            s.min_score = v;
        }
        if let Some(ref v) = patch.generator_model {
            s.generator_model = v.clone();
        }
        if let Some(v) = patch.temperature {
            s.temperature = v;
        }
        if let Some(v) = patch.max_tokens {
            s.max_tokens = v;
        }
        if let Some(v) = patch.cache_ttl_s {
            s.cache_ttl_s = v;
        }
        s
    }
}

/// Caller-supplied settings overrides. Every field is optional; unknown
/// fields are rejected at the API boundary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub lexical_top_k: Option<usize>,
    pub semantic_top_k: Option<usize>,
    pub rerank_top_k: Option<usize>,
    pub web_results: Option<usize>,
    pub web_pages_parsed: Option<usize>,
    pub deadline_ms: Option<u64>,
    pub per_source_timeout_ms: Option<u64>,
    pub min_score: Option<f32>,
    pub generator_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub cache_ttl_s: Option<u64>,
}

/// One prior conversation turn, passed through flat from the chat layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// One context block inside an assembled prompt.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub hit_id: String,
    pub origin: Origin,
    pub locator: Locator,
    pub text: String,
}

/// Which blocks were dropped during assembly and what budget remained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TruncationReport {
    pub dropped_hit_ids: Vec<String>,
    pub kept_blocks: usize,
    pub remaining_tokens: usize,
}

/// Fully assembled generator input.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system: String,
    pub blocks: Vec<ContextBlock>,
    pub user_query: String,
    pub truncation: TruncationReport,
    rendered: String,
}

impl PromptBundle {
    pub fn new(
        system: String,
        blocks: Vec<ContextBlock>,
        user_query: String,
        truncation: TruncationReport,
        rendered: String,
    ) -> Self {
        Self {
            system,
            blocks,
            user_query,
            truncation,
            rendered,
        }
    }

    /// The final prompt string handed to the generator.
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    /// Citations for the hits that actually made it into the prompt.
    pub fn citations(&self) -> Vec<Citation> {
        self.blocks
            .iter()
            .map(|b| Citation {
                origin: b.origin,
                locator: b.locator.clone(),
            })
            .collect()
    }
}

/// Per-branch latency and hit accounting for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub hit_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedSource {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Response metadata: where the answer came from and what it cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub cache_status: CacheStatus,
    pub per_source: BTreeMap<String, SourceStats>,
    pub rerank_elapsed_ms: u64,
    pub rerank_fallback: bool,
    pub planner_fallback: bool,
    pub generator_elapsed_ms: u64,
    pub truncated_blocks: usize,
    /// `[n]` markers in the answer pointing at blocks that were never in
    /// the prompt.
    pub invalid_citation_refs: usize,
    pub degraded_sources: Vec<DegradedSource>,
    pub corpus_version: u64,
}

/// Cached answer plus everything needed to serve it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub metadata: ResponseMetadata,
    pub generator_model: String,
    pub fingerprint: String,
    pub corpus_version: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

/// The public response shape of the answer endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub metadata: ResponseMetadata,
}

/// Summary row for `GET /documents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub chunk_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_serde() {
        for mode in [Mode::CorpusOnly, Mode::NotesOnly, Mode::WebOnly, Mode::Combined] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: Mode = serde_json::from_str(&json).unwrap();
            assert_eq!(mode, back);
        }
        let m: Mode = serde_json::from_str("\"corpus-only\"").unwrap();
        assert_eq!(m, Mode::CorpusOnly);
    }

    #[test]
    fn locator_serializes_flat() {
        let c = Citation {
            origin: Origin::Corpus,
            locator: Locator::Document {
                doc_id: "d1".into(),
                page: Some(3),
                section: "Entries".into(),
            },
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["origin"], "corpus");
        assert_eq!(v["doc_id"], "d1");
        assert_eq!(v["page"], 3);
        assert_eq!(v["section"], "Entries");

        let w = Citation {
            origin: Origin::Web,
            locator: Locator::Page {
                url: "http://example.com".into(),
                title: "Example".into(),
            },
        };
        let v = serde_json::to_value(&w).unwrap();
        assert_eq!(v["url"], "http://example.com");
    }

    #[test]
    fn settings_patch_overrides_only_given_fields() {
        let base = Settings {
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
            max_tokens: 1024,
            cache_ttl_s: 300,
        };
        let patch = SettingsPatch {
            rerank_top_k: Some(3),
            generator_model: Some("mistral".into()),
            ..Default::default()
        };
        let merged = base.apply(&patch);
        assert_eq!(merged.rerank_top_k, 3);
        assert_eq!(merged.generator_model, "mistral");
        assert_eq!(merged.lexical_top_k, 20);
        assert_eq!(merged.deadline_ms, 30_000);
    }

    #[test]
    fn dedup_key_distinguishes_origins() {
        let a = Locator::Document {
            doc_id: "d".into(),
            page: None,
            section: "s".into(),
        };
        let b = Locator::NoteFile {
            note_path: "d".into(),
            heading: Some("s".into()),
        };
        assert_ne!(a.dedup_key(), b.dedup_key());
    }
}
