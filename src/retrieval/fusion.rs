//! Score fusion for the rerank-fallback path.
//!
//! When the cross-encoder is unavailable or over budget, lexical and
//! semantic scores are min–max normalized within the request and blended
//! with fixed weights. Candidates present in both branches therefore rank
//! above single-branch candidates, all else being equal.

use std::collections::HashMap;

pub const LEXICAL_WEIGHT: f32 = 0.4;
pub const SEMANTIC_WEIGHT: f32 = 0.6;

/// Min–max normalize into [0, 1] within this result set. Identical scores
/// all map to 0.5 so a uniform list does not collapse to zeros.
pub fn min_max_normalize(scores: &[(String, f32)]) -> HashMap<String, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let max = scores.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
    let min = scores.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return scores.iter().map(|(id, _)| (id.clone(), 0.5)).collect();
    }
    let range = max - min;
    scores
        .iter()
        .map(|(id, s)| (id.clone(), (s - min) / range))
        .collect()
}

/// Blend normalized lexical and semantic scores. A candidate missing from a
/// branch contributes 0 for that component.
pub fn weighted_merge(
    lexical: &[(String, f32)],
    semantic: &[(String, f32)],
) -> HashMap<String, f32> {
    let lex_norm = min_max_normalize(lexical);
    let sem_norm = min_max_normalize(semantic);

    let mut fused: HashMap<String, f32> = HashMap::new();
    for (id, score) in &lex_norm {
        fused.insert(id.clone(), LEXICAL_WEIGHT * score);
    }
    for (id, score) in &sem_norm {
        *fused.entry(id.clone()).or_insert(0.0) += SEMANTIC_WEIGHT * score;
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn normalize_maps_to_unit_range() {
        let norm = min_max_normalize(&list(&[("a", 2.0), ("b", 6.0), ("c", 4.0)]));
        assert_eq!(norm["a"], 0.0);
        assert_eq!(norm["b"], 1.0);
        assert!((norm["c"] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalize_uniform_scores_are_half() {
        let norm = min_max_normalize(&list(&[("a", 3.0), ("b", 3.0)]));
        assert_eq!(norm["a"], 0.5);
        assert_eq!(norm["b"], 0.5);
    }

    #[test]
    fn both_branch_candidates_beat_single_branch() {
        // "both" tops neither list but appears in both; with 0.4/0.6 weights
        // it must outrank the single-branch candidates.
        let lexical = list(&[("lex_only", 10.0), ("both", 8.0)]);
        let semantic = list(&[("sem_only", 0.9), ("both", 0.8)]);
        let fused = weighted_merge(&lexical, &semantic);

        assert!(fused["both"] > fused["lex_only"]);
        assert!(fused["both"] > fused["sem_only"]);
    }

    #[test]
    fn missing_component_counts_as_zero() {
        let lexical = list(&[("a", 1.0), ("b", 0.0)]);
        let semantic = list(&[]);
        let fused = weighted_merge(&lexical, &semantic);
        assert!((fused["a"] - LEXICAL_WEIGHT).abs() < 1e-6);
        assert_eq!(fused["b"], 0.0);
    }
}
