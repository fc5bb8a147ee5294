//! Deterministic decomposition of multi-part questions.
//!
//! Splits conjunctions, enumerations, repeated questions and comparisons
//! into independent sub-queries so each can be retrieved in parallel. Runs
//! before (and independently of) the LLM expansion pass.

use std::sync::LazyLock;

static CONJUNCTION_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:and also|and then|as well as|additionally|plus)\b")
        .expect("conjunction regex is valid")
});

static QUESTION_SPLIT_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\?\s+").expect("question split regex is valid"));

static ENUMERATED_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^\s*(?:\d+[.)]\s*|[-\u{2022}]\s+)(.+)$")
        .expect("enumerated regex is valid")
});

static COMPARATIVE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:compare|difference between|versus|vs\.?)\b")
        .expect("comparative regex is valid")
});

static BETWEEN_ENTITIES_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)(?:between|compare)\s+(.+?)\s+(?:and|with|to)\s+(.+?)(?:\?|$)")
        .expect("between entities regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Single intent, nothing to split.
    Single,
    /// Enumerated items ("1. X  2. Y").
    Enumerated,
    /// Several question marks in one prompt.
    MultiQuestion,
    /// Comparison decomposed into per-entity lookups.
    Comparative,
    /// Explicit conjunction markers.
    Conjunction,
}

#[derive(Debug, Clone)]
pub struct Decomposition {
    pub sub_queries: Vec<String>,
    pub strategy: SplitStrategy,
}

impl Decomposition {
    fn single(query: &str) -> Self {
        Self {
            sub_queries: vec![query.to_string()],
            strategy: SplitStrategy::Single,
        }
    }
}

/// Split a prompt into independent sub-queries. Returns the original intact
/// when it reads as one intent; short prompts are never split.
pub fn decompose(query: &str) -> Decomposition {
    let query = query.trim();

    if query.split_whitespace().count() < 5 {
        return Decomposition::single(query);
    }

    let enumerated = extract_enumerated(query);
    if enumerated.len() >= 2 {
        return Decomposition {
            sub_queries: enumerated,
            strategy: SplitStrategy::Enumerated,
        };
    }

    let questions = split_questions(query);
    if questions.len() >= 2 {
        return Decomposition {
            sub_queries: questions,
            strategy: SplitStrategy::MultiQuestion,
        };
    }

    if COMPARATIVE_RE.is_match(query) {
        if let Some(caps) = BETWEEN_ENTITIES_RE.captures(query) {
            let left = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let right = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            if !left.is_empty() && !right.is_empty() && left != right {
                return Decomposition {
                    sub_queries: vec![left.to_string(), right.to_string(), query.to_string()],
                    strategy: SplitStrategy::Comparative,
                };
            }
        }
    }

    if let Some(parts) = split_conjunction(query) {
        return Decomposition {
            sub_queries: parts,
            strategy: SplitStrategy::Conjunction,
        };
    }

    Decomposition::single(query)
}

fn extract_enumerated(query: &str) -> Vec<String> {
    ENUMERATED_RE
        .captures_iter(query)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.split_whitespace().count() >= 2)
        .collect()
}

fn split_questions(query: &str) -> Vec<String> {
    QUESTION_SPLIT_RE
        .split(query)
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 2)
        .map(|s| {
            if s.ends_with('?') {
                s.to_string()
            } else {
                format!("{}?", s)
            }
        })
        .collect()
}

/// Conjunction splits are the loosest rule, so both sides must still look
/// like standalone queries to qualify.
fn split_conjunction(query: &str) -> Option<Vec<String>> {
    let parts: Vec<String> = CONJUNCTION_SPLIT_RE
        .split(query)
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 3)
        .map(String::from)
        .collect();

    if parts.len() >= 2 {
        Some(parts)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_queries_stay_single() {
        let d = decompose("entry rules?");
        assert_eq!(d.strategy, SplitStrategy::Single);
        assert_eq!(d.sub_queries, vec!["entry rules?"]);
    }

    #[test]
    fn plain_questions_stay_single() {
        let d = decompose("When do I enter an opening range breakout trade?");
        assert_eq!(d.strategy, SplitStrategy::Single);
    }

    #[test]
    fn enumerated_items_split() {
        let d = decompose("Answer these:\n1. What is VWAP reversion\n2. What is opening range breakout");
        assert_eq!(d.strategy, SplitStrategy::Enumerated);
        assert_eq!(d.sub_queries.len(), 2);
        assert!(d.sub_queries[0].contains("VWAP"));
    }

    #[test]
    fn multiple_questions_split() {
        let d = decompose("What is the stop placement? How large should the position be?");
        assert_eq!(d.strategy, SplitStrategy::MultiQuestion);
        assert_eq!(d.sub_queries.len(), 2);
        assert!(d.sub_queries.iter().all(|q| q.ends_with('?')));
    }

    #[test]
    fn comparison_keeps_both_entities_and_original() {
        let d = decompose("What is the difference between scalping and swing trading?");
        assert_eq!(d.strategy, SplitStrategy::Comparative);
        assert_eq!(d.sub_queries.len(), 3);
        assert!(d.sub_queries.contains(&"scalping".to_string()));
        assert!(d.sub_queries.contains(&"swing trading".to_string()));
    }

    #[test]
    fn conjunction_markers_split() {
        let d = decompose("Summarize the morning session levels and also list the overnight inventory");
        assert_eq!(d.strategy, SplitStrategy::Conjunction);
        assert_eq!(d.sub_queries.len(), 2);
    }

    #[test]
    fn bare_and_does_not_split() {
        // "and" joining noun phrases is not a second intent.
        let d = decompose("Show support and resistance levels for the morning session");
        assert_eq!(d.strategy, SplitStrategy::Single);
    }
}
