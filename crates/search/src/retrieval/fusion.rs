//! Merging vector and keyword candidates
//!
//! Candidates are keyed by item id. An item found by both modes keeps the
//! higher of its two scores and whichever record was already loaded.

use super::{Candidate, RetrievalMode};
use std::collections::HashMap;

/// Union of both candidate lists, best score first.
pub fn fuse(vector_results: Vec<Candidate>, keyword_results: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: HashMap<String, Candidate> = HashMap::new();

    for candidate in vector_results.into_iter().chain(keyword_results) {
        match merged.get_mut(&candidate.item_id) {
            Some(existing) => {
                if existing.mode != candidate.mode {
                    existing.mode = RetrievalMode::Hybrid;
                }
                existing.score = existing.score.max(candidate.score);
                if existing.item.is_none() {
                    existing.item = candidate.item;
                }
            }
            None => {
                merged.insert(candidate.item_id.clone(), candidate);
            }
        }
    }

    let mut fused: Vec<Candidate> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgrag_common::models::ItemKind;

    fn candidate(id: &str, score: f64, mode: RetrievalMode) -> Candidate {
        Candidate {
            kind: ItemKind::Entity,
            item_id: id.to_string(),
            score,
            item: None,
            mode,
        }
    }

    #[test]
    fn test_fuse_merges_by_id() {
        let vector = vec![
            candidate("a", 0.9, RetrievalMode::Vector),
            candidate("b", 0.4, RetrievalMode::Vector),
        ];
        let keyword = vec![
            candidate("b", 0.8, RetrievalMode::Keyword),
            candidate("c", 0.2, RetrievalMode::Keyword),
        ];

        let fused = fuse(vector, keyword);
        let ids: Vec<&str> = fused.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(fused[1].mode, RetrievalMode::Hybrid);
        assert!((fused[1].score - 0.8).abs() < 1e-12);
        assert_eq!(fused[2].mode, RetrievalMode::Keyword);
    }

    #[test]
    fn test_fuse_empty() {
        assert!(fuse(vec![], vec![]).is_empty());
    }
}
