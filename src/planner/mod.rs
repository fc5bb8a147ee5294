//! Query planning: deterministic signal extraction and multi-part
//! decomposition that always run, plus an optional small LLM pass that
//! expands the prompt into tagged reformulations. Planning never fails a
//! request; the worst case is a single-query plan built from the original
//! prompt.

pub mod decompose;

pub use decompose::{decompose, Decomposition, SplitStrategy};

use std::sync::Arc;
use std::sync::LazyLock;

use serde::Deserialize;
use tokio::time::Instant;

use crate::generator::Generator;
use crate::prompt::estimate_tokens;
use crate::types::{ExtractedEntities, Mode, QueryIntent, SearchQuery, Settings};

static TICKER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$[A-Za-z]{1,5}\b|\b[A-Z]{2,5}\b").expect("ticker regex is valid")
});
static DATE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}/\d{2,4}\b")
        .expect("date regex is valid")
});
static INDICATOR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(RSI|MACD|EMA|SMA|VWAP|ATR|ADX|OBV|bollinger(?: bands?)?|stochastic|fibonacci|volume profile|moving average)\b",
    )
    .expect("indicator regex is valid")
});
static QUOTED_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#""([^"]{2,})""#).expect("quoted regex is valid"));
static TIME_REF_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(today|yesterday|tomorrow|this (?:week|month|quarter|year)|last (?:week|month|quarter|year)|latest|recent(?:ly)?)\b",
    )
    .expect("time reference regex is valid")
});

/// Common English words the ticker pattern would otherwise pick up.
static TICKER_BLOCKLIST: LazyLock<std::collections::HashSet<&'static str>> =
    LazyLock::new(|| {
        ["THE", "AND", "FOR", "NOT", "ARE", "BUT", "ALL", "NEW", "HOW", "WHY", "WHAT", "WHEN",
         "WHO", "CAN", "DID", "DOES", "ETF", "USA", "CEO", "GDP", "API"]
            .into_iter()
            .collect()
    });

/// Deterministic first stage: recognize tickers, dates, indicator names,
/// quoted phrases and time references in the raw prompt.
pub fn extract_signals(query: &str) -> ExtractedEntities {
    let mut entities = ExtractedEntities::default();

    for cap in TICKER_RE.find_iter(query) {
        let raw = cap.as_str();
        let symbol = raw.trim_start_matches('$').to_uppercase();
        if raw.starts_with('$') || !TICKER_BLOCKLIST.contains(symbol.as_str()) {
            if !entities.tickers.contains(&symbol) {
                entities.tickers.push(symbol);
            }
        }
    }
    for cap in DATE_RE.find_iter(query) {
        entities.dates.push(cap.as_str().to_string());
    }
    for cap in INDICATOR_RE.find_iter(query) {
        let name = cap.as_str().to_lowercase();
        if !entities.indicators.contains(&name) {
            entities.indicators.push(name);
        }
    }
    for cap in QUOTED_RE.captures_iter(query) {
        if let Some(m) = cap.get(1) {
            entities.quoted_phrases.push(m.as_str().to_string());
        }
    }
    for cap in TIME_REF_RE.find_iter(query) {
        let phrase = cap.as_str().to_lowercase();
        if !entities.time_references.contains(&phrase) {
            entities.time_references.push(phrase);
        }
    }

    entities
}

#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub queries: Vec<SearchQuery>,
    pub entities: ExtractedEntities,
    /// Set when the LLM pass was attempted but its output was unusable.
    pub llm_fallback: bool,
}

#[derive(Deserialize)]
struct ExpansionItem {
    query: String,
    #[serde(default)]
    intent: String,
    #[serde(default)]
    priority: Option<u8>,
}

const EXPANSION_PROMPT: &str = "You rewrite a user question into search queries. \
Respond with a JSON array of 1 to 5 objects, each {\"query\": string, \
\"intent\": one of news|analysis|data|general|commentary|clarification, \
\"priority\": integer 1-5}. No prose, JSON only.\n\nUser question: ";

const EXPANSION_TEMPERATURE: f32 = 0.3;
const EXPANSION_MAX_TOKENS: usize = 256;
const MAX_EXPANSIONS: usize = 5;

pub struct QueryPlanner {
    generator: Arc<dyn Generator>,
    /// Queries at or above this estimated token count skip LLM expansion
    /// unless the mode asks for web coverage.
    expand_below_tokens: usize,
}

impl QueryPlanner {
    pub fn new(generator: Arc<dyn Generator>, expand_below_tokens: usize) -> Self {
        Self {
            generator,
            expand_below_tokens,
        }
    }

    fn should_expand(&self, query: &str, mode: Mode) -> bool {
        matches!(mode, Mode::Combined | Mode::WebOnly)
            || estimate_tokens(query) < self.expand_below_tokens
    }

    /// Produce the search plan. Always returns at least one query; the
    /// original prompt with intent=general is the floor.
    pub async fn plan(
        &self,
        query: &str,
        mode: Mode,
        settings: &Settings,
        deadline: Instant,
    ) -> PlannerOutput {
        let entities = extract_signals(query);

        // Multi-part prompts turn into one query per part, each retrieved
        // independently and merged downstream.
        let decomposition = decompose(query);
        let base_queries: Vec<SearchQuery> = if decomposition.sub_queries.len() > 1 {
            tracing::debug!(
                parts = decomposition.sub_queries.len(),
                strategy = ?decomposition.strategy,
                "query decomposed"
            );
            decomposition
                .sub_queries
                .iter()
                .map(|part| SearchQuery {
                    text: part.clone(),
                    intent: QueryIntent::General,
                    entities: entities.clone(),
                    priority: 4,
                    expansion_of: query.to_string(),
                })
                .collect()
        } else {
            vec![SearchQuery::passthrough(query, entities.clone())]
        };

        if !self.should_expand(query, mode) {
            return PlannerOutput {
                queries: base_queries,
                entities,
                llm_fallback: false,
            };
        }

        // One retry on malformed output, then fall back to the base plan.
        for attempt in 0..2 {
            match self.expand_once(query, settings, deadline).await {
                Ok(mut expansions) if !expansions.is_empty() => {
                    for q in &mut expansions {
                        q.entities = entities.clone();
                    }
                    let queries = merge_plans(base_queries, expansions);
                    return PlannerOutput {
                        queries,
                        entities,
                        llm_fallback: false,
                    };
                }
                Ok(_) => {
                    tracing::debug!(attempt = attempt, "planner expansion produced no queries");
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "planner expansion failed");
                }
            }
        }

        PlannerOutput {
            queries: base_queries,
            entities,
            llm_fallback: true,
        }
    }

    async fn expand_once(
        &self,
        query: &str,
        settings: &Settings,
        deadline: Instant,
    ) -> anyhow::Result<Vec<SearchQuery>> {
        let prompt = format!("{}{}", EXPANSION_PROMPT, query);
        let output = self
            .generator
            .generate(
                &prompt,
                &settings.generator_model,
                EXPANSION_TEMPERATURE,
                EXPANSION_MAX_TOKENS,
                deadline,
            )
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(parse_expansions(&output.text, query))
    }
}

/// Combine the deterministic plan with LLM expansions: dedup by normalized
/// text, keep at most [`MAX_EXPANSIONS`] beyond the first base query, and
/// order by descending priority (stable within equal priorities).
fn merge_plans(base: Vec<SearchQuery>, expansions: Vec<SearchQuery>) -> Vec<SearchQuery> {
    let mut seen: std::collections::HashSet<String> = Default::default();
    let mut queries: Vec<SearchQuery> = Vec::new();

    for q in base.into_iter().chain(expansions) {
        let key = q.text.to_lowercase();
        if seen.insert(key) {
            queries.push(q);
        }
    }

    queries.truncate(1 + MAX_EXPANSIONS);
    queries.sort_by(|a, b| b.priority.cmp(&a.priority));
    queries
}

/// Pull a JSON array out of the model output and map it onto search queries.
/// Anything unparseable is dropped; intents outside the closed set become
/// `general`.
pub fn parse_expansions(raw: &str, original: &str) -> Vec<SearchQuery> {
    let start = match raw.find('[') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let end = match raw.rfind(']') {
        Some(i) if i > start => i,
        _ => return Vec::new(),
    };

    let items: Vec<ExpansionItem> = match serde_json::from_str(&raw[start..=end]) {
        Ok(items) => items,
        Err(_) => return Vec::new(),
    };

    items
        .into_iter()
        .filter(|item| !item.query.trim().is_empty())
        .take(MAX_EXPANSIONS)
        .map(|item| SearchQuery {
            text: item.query.trim().to_string(),
            intent: QueryIntent::parse(&item.intent).unwrap_or(QueryIntent::General),
            entities: ExtractedEntities::default(),
            priority: item.priority.unwrap_or(3).clamp(1, 5),
            expansion_of: original.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_recognize_tickers_and_indicators() {
        let e = extract_signals("Is $ES holding VWAP after the RSI divergence on SPY?");
        assert!(e.tickers.contains(&"ES".to_string()));
        assert!(e.tickers.contains(&"SPY".to_string()));
        assert!(e.indicators.contains(&"vwap".to_string()));
        assert!(e.indicators.contains(&"rsi".to_string()));
    }

    #[test]
    fn signals_skip_common_words_as_tickers() {
        let e = extract_signals("WHAT did THE report say about NEW highs");
        assert!(!e.tickers.contains(&"WHAT".to_string()));
        assert!(!e.tickers.contains(&"THE".to_string()));
        assert!(!e.tickers.contains(&"NEW".to_string()));
    }

    #[test]
    fn signals_capture_dates_quotes_and_time_refs() {
        let e = extract_signals("Summarize \"opening range\" moves since 2024-03-01, this week only");
        assert_eq!(e.dates, vec!["2024-03-01"]);
        assert_eq!(e.quoted_phrases, vec!["opening range"]);
        assert!(e.time_references.contains(&"this week".to_string()));
    }

    #[test]
    fn parse_expansions_reads_json_embedded_in_prose() {
        let raw = r#"Here you go:
[{"query": "ES futures breakout levels", "intent": "analysis", "priority": 5},
 {"query": "ES overnight range", "intent": "data", "priority": 2}]
Done."#;
        let queries = parse_expansions(raw, "orig");
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].intent, QueryIntent::Analysis);
        assert_eq!(queries[0].priority, 5);
        assert_eq!(queries[1].expansion_of, "orig");
    }

    #[test]
    fn parse_expansions_rejects_garbage() {
        assert!(parse_expansions("not json at all", "q").is_empty());
        assert!(parse_expansions("[{\"nope\": true}", "q").is_empty());
    }

    #[test]
    fn parse_expansions_defaults_unknown_intent_to_general() {
        let raw = r#"[{"query": "x y z", "intent": "prophecy"}]"#;
        let queries = parse_expansions(raw, "q");
        assert_eq!(queries[0].intent, QueryIntent::General);
        assert_eq!(queries[0].priority, 3);
    }

    #[test]
    fn merge_plans_dedups_and_sorts_by_priority() {
        let base = vec![SearchQuery::passthrough("es breakout levels", Default::default())];
        let expansions = vec![
            SearchQuery {
                text: "ES Breakout Levels".into(),
                intent: QueryIntent::Analysis,
                entities: Default::default(),
                priority: 5,
                expansion_of: "es breakout levels".into(),
            },
            SearchQuery {
                text: "overnight inventory".into(),
                intent: QueryIntent::Data,
                entities: Default::default(),
                priority: 5,
                expansion_of: "es breakout levels".into(),
            },
        ];
        let merged = merge_plans(base, expansions);
        // The case-variant duplicate is gone; highest priority runs first.
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "overnight inventory");
        assert_eq!(merged[1].text, "es breakout levels");
    }

    #[test]
    fn parse_expansions_caps_at_five() {
        let raw = r#"[
            {"query":"a1"},{"query":"a2"},{"query":"a3"},
            {"query":"a4"},{"query":"a5"},{"query":"a6"}
        ]"#;
        assert_eq!(parse_expansions(raw, "q").len(), 5);
    }
}
