//! Multi-stage result filter
//!
//! Stages run in order over the survivors of the previous one:
//! 1. similarity floor
//! 2. required metadata fields, noting which boost fields are present
//! 3. rerank with recency, importance and metadata richness
//!
//! Each stage can be switched off. Stage 3 never drops results.

use chrono::{DateTime, Utc};
use kgrag_common::models::{present_boost_fields, recency_score, SearchResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata fields that make an item more useful as context.
pub const DEFAULT_BOOST_FIELDS: &[&str] = &[
    "role",
    "department",
    "position",
    "industry",
    "date",
    "amount",
    "percentage",
];

/// Field count at which the richness score saturates
const RICHNESS_FIELD_SATURATION: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RerankWeights {
    pub recency: f64,
    pub importance: f64,
    pub metadata: f64,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            recency: 0.2,
            importance: 0.2,
            metadata: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub similarity_stage: bool,
    pub metadata_stage: bool,
    pub rerank_stage: bool,
    pub min_similarity: f64,
    /// Metadata fields an item must carry to pass stage 2
    pub required_fields: Vec<String>,
    pub boost_fields: Vec<String>,
    pub rerank: RerankWeights,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            similarity_stage: true,
            metadata_stage: true,
            rerank_stage: true,
            min_similarity: 0.3,
            required_fields: Vec::new(),
            boost_fields: DEFAULT_BOOST_FIELDS.iter().map(|f| f.to_string()).collect(),
            rerank: RerankWeights::default(),
        }
    }
}

/// Result counts after each stage.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FilterReport {
    pub input: usize,
    pub after_similarity: usize,
    pub after_metadata: usize,
    pub output: usize,
}

/// A result travelling through the stages with its present boost fields.
struct Staged {
    result: SearchResult,
    boosts: Option<usize>,
}

pub struct MultiStageFilter {
    config: FilterConfig,
}

impl MultiStageFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn apply(
        &self,
        results: Vec<SearchResult>,
        now: DateTime<Utc>,
    ) -> (Vec<SearchResult>, FilterReport) {
        let mut report = FilterReport {
            input: results.len(),
            ..Default::default()
        };

        let mut staged: Vec<Staged> = results
            .into_iter()
            .map(|result| Staged { result, boosts: None })
            .collect();

        if self.config.similarity_stage {
            staged.retain(|s| s.result.similarity_score >= self.config.min_similarity);
        }
        report.after_similarity = staged.len();

        if self.config.metadata_stage {
            staged = self.metadata_stage(staged);
        }
        report.after_metadata = staged.len();

        if self.config.rerank_stage {
            self.rerank_stage(&mut staged, now);
        }
        report.output = staged.len();

        debug!(
            input = report.input,
            after_similarity = report.after_similarity,
            after_metadata = report.after_metadata,
            output = report.output,
            "Filter stages applied"
        );
        (staged.into_iter().map(|s| s.result).collect(), report)
    }

    fn metadata_stage(&self, staged: Vec<Staged>) -> Vec<Staged> {
        let required = &self.config.required_fields;
        staged
            .into_iter()
            .filter_map(|mut s| {
                let Some(item) = &s.result.item else {
                    return required.is_empty().then_some(s);
                };
                let metadata = item.payload.metadata();
                if present_boost_fields(metadata, required).len() < required.len() {
                    return None;
                }
                s.boosts = Some(present_boost_fields(metadata, &self.config.boost_fields).len());
                Some(s)
            })
            .collect()
    }

    fn rerank_stage(&self, staged: &mut [Staged], now: DateTime<Utc>) {
        let weights = self.config.rerank;
        for s in staged.iter_mut() {
            let Some(item) = &s.result.item else {
                continue;
            };
            let metadata = item.payload.metadata();
            let boosts = s
                .boosts
                .unwrap_or_else(|| present_boost_fields(metadata, &self.config.boost_fields).len());
            let richness = self.richness(boosts, metadata.len());
            let importance = (item.strategy().importance)(&item.payload);

            let score = s.result.composite_score
                + recency_score(item.last_touched(), now) * weights.recency
                + importance * weights.importance
                + richness * weights.metadata;
            s.result.composite_score = score.min(1.0);
        }
        staged.sort_by(|a, b| {
            b.result
                .composite_score
                .partial_cmp(&a.result.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// 0.0 - 1.0, saturating on boost-field share and total field count.
    fn richness(&self, boosts: usize, field_count: usize) -> f64 {
        let boost_share = if self.config.boost_fields.is_empty() {
            0.0
        } else {
            boosts as f64 / self.config.boost_fields.len() as f64
        };
        let fields = (field_count as f64 / RICHNESS_FIELD_SATURATION).min(1.0);
        (0.6 * boost_share + 0.4 * fields).min(1.0)
    }
}

impl Default for MultiStageFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}
