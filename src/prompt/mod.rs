//! Prompt assembly.
//!
//! Selects the system prompt for the mode, folds in user memory and history,
//! then adds context blocks in rank order until the token budget runs out.
//! The user query always goes last and is never truncated.

pub mod citations;

pub use citations::{check_citations, CitationCheck};

use std::fmt::Write as _;

use crate::generator::context_window;
use crate::types::{
    ContextBlock, HistoryTurn, Mode, PromptBundle, RetrievalHit, TruncationReport,
};

/// Approximate token count: four characters per token with a whitespace
/// floor. The assembly budget reserves a 10% margin that absorbs the
/// estimation error.
pub fn estimate_tokens(text: &str) -> usize {
    let by_chars = text.len() / 4;
    let by_words = text.split_whitespace().count();
    by_chars.max(by_words)
}

/// Per-block character cap before budget accounting; one enormous chunk
/// should not crowd out every other source.
const BLOCK_CHAR_CAP: usize = 6_000;
/// Fraction of the context window reserved on top of `max_tokens`.
const OUTPUT_RESERVE: f64 = 0.10;
/// Most recent history turns considered for the prompt.
const HISTORY_TURNS: usize = 6;

const CORPUS_PROMPT: &str = "You are a research assistant answering from an indexed document \
corpus. Answer using only the numbered context blocks below. Cite the blocks you used as \
[n]. If the context does not contain the answer, say plainly that the indexed documents \
have no information on this and do not speculate.";

const NOTES_PROMPT: &str = "You are a research assistant answering from the user's personal \
notes. Answer using only the numbered note excerpts below and cite them as [n]. If the notes \
do not cover the question, say that no matching notes were found.";

const WEB_PROMPT: &str = "You are a research assistant answering from freshly retrieved web \
pages. Answer using only the numbered context blocks below and cite them as [n]. When context \
blocks are present you must synthesize an answer from them; do not refuse or claim you cannot \
browse. Only when no context is provided may you say that nothing relevant was retrieved.";

const COMBINED_PROMPT: &str = "You are a research assistant with evidence from an indexed \
corpus, personal notes, and the live web. Answer using only the numbered context blocks below, \
citing them as [n] and preferring corpus evidence over web evidence on conflicts. When context \
blocks are present you must synthesize an answer from them; do not refuse. Only when no \
context is provided may you say that nothing relevant was found.";

/// Fixed system prompt per mode; a stored per-user override replaces it.
pub fn system_prompt_for(mode: Mode) -> &'static str {
    match mode {
        Mode::CorpusOnly => CORPUS_PROMPT,
        Mode::NotesOnly => NOTES_PROMPT,
        Mode::WebOnly => WEB_PROMPT,
        Mode::Combined => COMBINED_PROMPT,
    }
}

fn label_for(block: &ContextBlock, ordinal: usize) -> String {
    use crate::types::Locator::*;
    match &block.locator {
        Document { doc_id, page, section } => {
            let mut label = format!("[{}] corpus doc {}", ordinal, doc_id);
            if let Some(p) = page {
                let _ = write!(label, " p.{}", p);
            }
            if !section.is_empty() {
                let _ = write!(label, " \u{2014} {}", section);
            }
            label
        }
        Media { doc_id, timestamp_start, timestamp_end } => format!(
            "[{}] corpus media {} {:.0}s-{:.0}s",
            ordinal, doc_id, timestamp_start, timestamp_end
        ),
        NoteFile { note_path, heading } => match heading {
            Some(h) => format!("[{}] note {} \u{2014} {}", ordinal, note_path, h),
            None => format!("[{}] note {}", ordinal, note_path),
        },
        Page { url, title } => {
            if title.is_empty() {
                format!("[{}] web {}", ordinal, url)
            } else {
                format!("[{}] web {} ({})", ordinal, title, url)
            }
        }
    }
}

pub struct PromptAssembler;

impl PromptAssembler {
    /// Build the generator input for one request.
    ///
    /// `hits` must already be in final rank order; blocks are added greedily
    /// and whatever does not fit is recorded in the truncation report.
    pub fn assemble(
        mode: Mode,
        user_query: &str,
        hits: &[RetrievalHit],
        memory_facts: &[(String, String)],
        system_override: Option<&str>,
        history: &[HistoryTurn],
        model: &str,
        max_tokens: usize,
    ) -> PromptBundle {
        let window = context_window(model);
        let reserve = (window as f64 * OUTPUT_RESERVE) as usize;
        let budget = window.saturating_sub(max_tokens).saturating_sub(reserve);

        let system = system_override
            .map(|s| s.to_string())
            .unwrap_or_else(|| system_prompt_for(mode).to_string());

        let mut rendered = String::with_capacity(4_096);
        rendered.push_str(&system);
        rendered.push_str("\n\n");

        if !memory_facts.is_empty() {
            rendered.push_str("Facts about the user:\n");
            for (key, value) in memory_facts {
                let _ = writeln!(rendered, "- {}: {}", key, value);
            }
            rendered.push('\n');
        }

        if !history.is_empty() {
            rendered.push_str("Conversation so far:\n");
            let start = history.len().saturating_sub(HISTORY_TURNS);
            for turn in &history[start..] {
                let _ = writeln!(rendered, "{}: {}", turn.role, turn.content);
            }
            rendered.push('\n');
        }

        // Everything after this point competes with the fixed tail (the user
        // query), so account for the tail up front.
        let query_tail = format!("\nQuestion: {}\nAnswer:", user_query);
        let mut used = estimate_tokens(&rendered) + estimate_tokens(&query_tail);

        let mut blocks: Vec<ContextBlock> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();

        if !hits.is_empty() {
            rendered.push_str("Context:\n");
            used += 2;
        }

        for hit in hits {
            if used >= budget {
                dropped.push(hit.id.clone());
                continue;
            }

            let mut text = hit.text.clone();
            if text.len() > BLOCK_CHAR_CAP {
                let cut = crate::ingest::snap_to_char_boundary(&text, BLOCK_CHAR_CAP);
                text.truncate(cut);
            }

            let block = ContextBlock {
                hit_id: hit.id.clone(),
                origin: hit.origin,
                locator: hit.locator.clone(),
                text,
            };

            let label = label_for(&block, blocks.len() + 1);
            let block_str = format!("{}\n{}\n\n", label, block.text);
            let block_tokens = estimate_tokens(&block_str);

            if used + block_tokens > budget {
                dropped.push(hit.id.clone());
                continue;
            }

            rendered.push_str(&block_str);
            used += block_tokens;
            blocks.push(block);
        }

        rendered.push_str(&query_tail);

        let truncation = TruncationReport {
            dropped_hit_ids: dropped,
            kept_blocks: blocks.len(),
            remaining_tokens: budget.saturating_sub(used),
        };

        if !truncation.dropped_hit_ids.is_empty() {
            tracing::debug!(
                kept = truncation.kept_blocks,
                dropped = truncation.dropped_hit_ids.len(),
                remaining_tokens = truncation.remaining_tokens,
                "context truncated to fit token budget"
            );
        }

        PromptBundle::new(system, blocks, user_query.to_string(), truncation, rendered)
    }
}
