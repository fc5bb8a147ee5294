//! Validation of inline citation markers in generated answers.
//!
//! The generator is instructed to cite context blocks as `[n]`. Markers that
//! point outside the assembled block range are fabricated; they are counted
//! and reported so callers can see when a model is inventing sources.

use std::collections::BTreeSet;
use std::sync::LazyLock;

static CITATION_MARKER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[(\d{1,3})\]").expect("citation marker regex is valid"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationCheck {
    /// 1-based ordinals of context blocks the answer actually cites.
    pub cited_blocks: Vec<usize>,
    /// Markers referencing blocks that were never in the prompt.
    pub invalid_refs: Vec<usize>,
}

/// Scan an answer for `[n]` markers and classify them against the number of
/// context blocks that were in the prompt.
pub fn check_citations(answer: &str, block_count: usize) -> CitationCheck {
    let mut cited: BTreeSet<usize> = BTreeSet::new();
    let mut invalid: BTreeSet<usize> = BTreeSet::new();

    for cap in CITATION_MARKER_RE.captures_iter(answer) {
        let Some(m) = cap.get(1) else { continue };
        let Ok(ordinal) = m.as_str().parse::<usize>() else {
            continue;
        };
        if ordinal >= 1 && ordinal <= block_count {
            cited.insert(ordinal);
        } else {
            invalid.insert(ordinal);
        }
    }

    CitationCheck {
        cited_blocks: cited.into_iter().collect(),
        invalid_refs: invalid.into_iter().collect(),
    }
}
