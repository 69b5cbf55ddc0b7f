//! Keyword search over the primary store
//!
//! Scores each item of the kind by the best fraction of query-variant
//! words found in its keyword text.

use super::{Candidate, KindRequest, RetrievalMode, Retriever};
use kgrag_common::errors::Result;
use kgrag_common::store::Conditions;
use kgrag_common::PrimaryStore;
use std::sync::Arc;

/// Keyword hits count as similarity up to this value
const KEYWORD_SCORE_SCALE: f64 = 0.8;

/// Upper bound on items scanned per kind
const SCAN_LIMIT: usize = 2000;

pub struct KeywordRetriever {
    primary: Arc<dyn PrimaryStore>,
}

impl KeywordRetriever {
    pub fn new(primary: Arc<dyn PrimaryStore>) -> Self {
        Self { primary }
    }

    /// Best fraction of a variant's words contained in `text`.
    fn match_score(text: &str, variants: &[Vec<String>]) -> f64 {
        variants
            .iter()
            .filter(|words| !words.is_empty())
            .map(|words| {
                let hits = words.iter().filter(|w| text.contains(w.as_str())).count();
                hits as f64 / words.len() as f64
            })
            .fold(0.0, f64::max)
    }
}

#[async_trait::async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, request: &KindRequest<'_>) -> Result<Vec<Candidate>> {
        let variants: Vec<Vec<String>> = request
            .query
            .variants()
            .into_iter()
            .map(|v| v.split_whitespace().map(str::to_lowercase).collect())
            .collect();
        if variants.iter().all(Vec::is_empty) {
            return Ok(vec![]);
        }

        let conditions = Conditions {
            limit: Some(SCAN_LIMIT),
            ..Conditions::scope(request.filters.scope_id.as_deref())
        };
        let items = self.primary.query_by_conditions(request.kind, &conditions).await?;

        let mut candidates: Vec<Candidate> = items
            .into_iter()
            .filter_map(|item| {
                let text = (item.strategy().keyword_text)(&item.payload).to_lowercase();
                let score = Self::match_score(&text, &variants);
                (score > 0.0).then(|| Candidate {
                    kind: request.kind,
                    item_id: item.id.clone(),
                    score: score * KEYWORD_SCORE_SCALE,
                    item: Some(item),
                    mode: RetrievalMode::Keyword,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(request.limit);
        Ok(candidates)
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Keyword
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_match_score_takes_best_variant() {
        let text = "acme robotics partner of globex";
        let variants = vec![words("acme unknown"), words("acme globex"), vec![]];
        assert_eq!(KeywordRetriever::match_score(text, &variants), 1.0);
        assert_eq!(KeywordRetriever::match_score(text, &[words("initech")]), 0.0);
        assert_eq!(KeywordRetriever::match_score(text, &[]), 0.0);
    }
}
