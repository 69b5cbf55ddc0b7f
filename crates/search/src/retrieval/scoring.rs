//! Composite scoring and query-driven weight adjustment

use chrono::{DateTime, Utc};
use kgrag_common::models::{recency_score, ItemPayload, KnowledgeItem};
use serde::{Deserialize, Serialize};

const RECENCY_CUES: &[&str] = &["最新", "最近", "新しい", "recent", "latest", "newest"];
const IMPORTANCE_CUES: &[&str] = &["重要", "優先", "緊急", "important", "priority", "critical"];

/// Weight added to a factor whose cue words appear in the query
const CUE_BOOST: f64 = 0.2;

/// Weights of the composite score. Always sums to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub similarity: f64,
    pub recency: f64,
    pub importance: f64,
    pub metadata: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            similarity: 0.7,
            recency: 0.1,
            importance: 0.1,
            metadata: 0.1,
        }
    }
}

impl ScoringWeights {
    /// Defaults, shifted towards recency or importance when the query asks for it.
    pub fn for_query(query: &str) -> Self {
        let lower = query.to_lowercase();
        let mut weights = Self::default();
        if RECENCY_CUES.iter().any(|c| lower.contains(c)) {
            weights.recency += CUE_BOOST;
        }
        if IMPORTANCE_CUES.iter().any(|c| lower.contains(c)) {
            weights.importance += CUE_BOOST;
        }
        weights.normalized()
    }

    pub fn sum(&self) -> f64 {
        self.similarity + self.recency + self.importance + self.metadata
    }

    pub fn normalized(self) -> Self {
        let sum = self.sum();
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            similarity: self.similarity / sum,
            recency: self.recency / sum,
            importance: self.importance / sum,
            metadata: self.metadata / sum,
        }
    }
}

/// Raw cosine similarity clamped to 0.0 - 1.0.
pub fn normalize_similarity(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn composite_score(
    similarity: f64,
    item: &KnowledgeItem,
    weights: &ScoringWeights,
    boost_fields: &[String],
    now: DateTime<Utc>,
) -> f64 {
    let strategy = item.strategy();
    let score = weights.similarity * similarity
        + weights.recency * recency_score(item.last_touched(), now)
        + weights.importance * (strategy.importance)(&item.payload)
        + weights.metadata * (strategy.metadata_score)(&item.payload, boost_fields);
    score.clamp(0.0, 1.0)
}

/// Entity-only boosts for type, name, alias and metadata matches. Capped at 1.0.
pub fn entity_boost(
    score: f64,
    item: &KnowledgeItem,
    query: &str,
    entity_type: Option<&str>,
) -> f64 {
    let ItemPayload::Entity(entity) = &item.payload else {
        return score;
    };
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().filter(|w| w.chars().count() > 2).collect();
    let mut score = score;

    if entity_type.is_some() && entity.entity_type.as_deref() == entity_type {
        score = (score + 0.1).min(1.0);
    }
    if words.is_empty() {
        return score;
    }

    let name = entity.name.to_lowercase();
    let name_hits = words.iter().filter(|w| name.contains(*w)).count();
    if name_hits > 0 {
        let ratio = (name_hits as f64 / words.len() as f64).min(1.0);
        score = (score + 0.05 * ratio).min(1.0);
    }

    for alias in &entity.aliases {
        let alias = alias.to_lowercase();
        if words.iter().any(|w| alias.contains(*w)) {
            score = (score + 0.03).min(1.0);
        }
    }

    if !entity.metadata.is_empty() {
        let metadata = serde_json::to_string(&entity.metadata)
            .unwrap_or_default()
            .to_lowercase();
        if words.iter().any(|w| metadata.contains(*w)) {
            score = (score + 0.02).min(1.0);
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgrag_common::models::EntityPayload;

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = ScoringWeights::for_query("Acme の担当者");
        assert_eq!(w, ScoringWeights::default().normalized());
        assert!((w.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_recency_cue_reweights() {
        let w = ScoringWeights::for_query("most recent partnership news");
        assert!(w.recency > 0.1);
        assert!(w.similarity < 0.7);
        assert!((w.sum() - 1.0).abs() < 1e-6);

        let both = ScoringWeights::for_query("最新の重要な会議");
        assert!(both.recency > 0.1 && both.importance > 0.1);
        assert!((both.recency - both.importance).abs() < 1e-9);
        assert!((both.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_similarity_clamps() {
        assert_eq!(normalize_similarity(-0.4), 0.0);
        assert_eq!(normalize_similarity(1.2), 1.0);
        assert_eq!(normalize_similarity(f64::NAN), 0.0);
        assert!((normalize_similarity(0.42) - 0.42).abs() < 1e-12);
    }

    #[test]
    fn test_entity_boosts_are_capped() {
        let mut item = KnowledgeItem::new(
            "e1",
            "org-1",
            ItemPayload::Entity(EntityPayload {
                name: "Acme Robotics".into(),
                aliases: vec!["acme corp".into()],
                entity_type: Some("company".into()),
                ..Default::default()
            }),
        );
        let boosted = entity_boost(0.5, &item, "acme robotics", Some("company"));
        // type 0.1 + full name match 0.05 + alias 0.03
        assert!((boosted - 0.68).abs() < 1e-9);
        assert_eq!(entity_boost(0.99, &item, "acme", Some("company")), 1.0);

        item.payload = ItemPayload::Entity(EntityPayload {
            name: "Globex".into(),
            ..Default::default()
        });
        assert_eq!(entity_boost(0.5, &item, "acme", None), 0.5);
    }

    #[test]
    fn test_composite_prefers_fresh_items() {
        let now = Utc::now();
        let mut fresh = KnowledgeItem::new(
            "e1",
            "org-1",
            ItemPayload::Entity(EntityPayload {
                name: "Acme".into(),
                ..Default::default()
            }),
        );
        fresh.updated_at = Some(now);
        let mut stale = fresh.clone();
        stale.updated_at = Some(now - chrono::Duration::days(400));

        let w = ScoringWeights::for_query("latest");
        let a = composite_score(0.6, &fresh, &w, &[], now);
        let b = composite_score(0.6, &stale, &w, &[], now);
        assert!(a > b);
        assert!((0.0..=1.0).contains(&a));
    }
}
