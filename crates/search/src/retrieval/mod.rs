//! Per-kind hybrid retrieval
//!
//! Two retrieval modes feed every kind:
//! - Vector search (similarity of the query embedding)
//! - Keyword search (query variants matched against item keyword text)
//!
//! [`HybridRetriever`] runs them for every requested kind concurrently and
//! merges the candidates into composite-scored results.

mod fusion;
mod hybrid;
mod keyword;
mod scoring;
mod vector;

pub use fusion::fuse;
pub use hybrid::{HybridRetriever, RetrievalOutcome, SearchOptions};
pub use keyword::KeywordRetriever;
pub use scoring::{composite_score, entity_boost, normalize_similarity, ScoringWeights};
pub use vector::VectorRetriever;

use crate::query::ProcessedQuery;
use chrono::{DateTime, Utc};
use kgrag_common::errors::Result;
use kgrag_common::models::{ItemKind, ItemPayload, KnowledgeItem};
use serde::{Deserialize, Serialize};

/// Retrieval mode that produced a candidate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Vector,
    Keyword,
    Hybrid,
}

/// One unscored match for a kind.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: ItemKind,
    pub item_id: String,
    /// 0.0 - 1.0
    pub score: f64,
    /// Present when the retriever already loaded the record
    pub item: Option<KnowledgeItem>,
    pub mode: RetrievalMode,
}

/// Search filters. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,

    /// Kinds to search; all kinds when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<ItemKind>>,

    /// Boosts matching entities rather than filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn for_scope(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: Some(scope_id.into()),
            ..Default::default()
        }
    }

    /// Requested kinds in canonical order, without duplicates.
    pub fn kinds(&self) -> Vec<ItemKind> {
        match &self.kinds {
            Some(kinds) if !kinds.is_empty() => ItemKind::ALL
                .into_iter()
                .filter(|k| kinds.contains(k))
                .collect(),
            _ => ItemKind::ALL.to_vec(),
        }
    }

    /// Items lacking a filtered timestamp never match.
    pub fn matches(&self, item: &KnowledgeItem) -> bool {
        if let Some(scope) = self.scope_id.as_deref() {
            if !item.in_scope(scope) {
                return false;
            }
        }
        if let (Some(wanted), ItemPayload::Relation(r)) =
            (self.relation_type.as_deref(), &item.payload)
        {
            if r.relation_type != wanted {
                return false;
            }
        }
        within(item.created_at, self.created_after, self.created_before)
            && within(item.updated_at, self.updated_after, self.updated_before)
    }
}

fn within(
    ts: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> bool {
    if after.is_none() && before.is_none() {
        return true;
    }
    let Some(ts) = ts else {
        return false;
    };
    after.map_or(true, |a| ts >= a) && before.map_or(true, |b| ts <= b)
}

/// One kind's share of a search.
#[derive(Debug, Clone)]
pub struct KindRequest<'a> {
    pub kind: ItemKind,
    pub query: &'a ProcessedQuery,
    /// Absent when the query could not be embedded
    pub embedding: Option<&'a [f32]>,
    pub limit: usize,
    pub filters: &'a SearchFilters,
}

/// Common trait for the per-kind retrievers
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, request: &KindRequest<'_>) -> Result<Vec<Candidate>>;

    fn mode(&self) -> RetrievalMode;
}
