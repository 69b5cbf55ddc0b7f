//! Collaborator contracts for the two stores and settings persistence
//!
//! - [`PrimaryStore`]: structured record store with keyed lookup and conditional query
//! - [`VectorIndex`]: similarity-searchable embedding store
//! - [`KvStore`]: durable string key/value store (settings, cache tier 2)
//!
//! In-memory implementations live in [`memory`]; Postgres and Redis
//! implementations live in `db` and `kv`.

pub mod memory;

use crate::errors::{AppError, Result};
use crate::models::{Embedding, ItemKind, KnowledgeItem, SyncFlag};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Filter for [`PrimaryStore::query_by_conditions`]. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conditions {
    /// Matches either owner field
    pub scope_id: Option<String>,
    pub sync_flag: Option<SyncFlag>,
    pub ids: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl Conditions {
    pub fn scope(scope_id: Option<&str>) -> Self {
        Self {
            scope_id: scope_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &KnowledgeItem) -> bool {
        if let Some(scope) = self.scope_id.as_deref() {
            if !item.in_scope(scope) {
                return false;
            }
        }
        if let Some(flag) = self.sync_flag {
            if item.sync_flag != flag {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &item.id) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn get_by_id(&self, kind: ItemKind, id: &str) -> Result<Option<KnowledgeItem>>;

    async fn query_by_conditions(
        &self,
        kind: ItemKind,
        conditions: &Conditions,
    ) -> Result<Vec<KnowledgeItem>>;

    async fn upsert(&self, item: &KnowledgeItem) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, kind: ItemKind, id: &str) -> Result<bool>;

    /// Write only the sync flag and last error of an item.
    async fn update_sync_state(
        &self,
        kind: ItemKind,
        id: &str,
        flag: SyncFlag,
        error: Option<String>,
    ) -> Result<()> {
        let mut item = self
            .get_by_id(kind, id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;
        item.sync_flag = flag;
        item.last_sync_error = error;
        self.upsert(&item).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// One similarity-search match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub item_id: String,
    /// Cosine similarity, -1.0 - 1.0
    pub score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()>;

    /// Backends without delete support answer with [`AppError::Unsupported`].
    async fn delete_embedding(&self, kind: ItemKind, item_id: &str, scope_id: &str) -> Result<()>;

    async fn similarity_search(
        &self,
        kind: ItemKind,
        query: &[f32],
        k: usize,
        scope_id: Option<&str>,
    ) -> Result<Vec<VectorHit>>;

    /// Native lookup by id, when [`supports_lookup`](Self::supports_lookup).
    async fn get_embedding(&self, kind: ItemKind, item_id: &str) -> Result<Option<Embedding>> {
        let _ = (kind, item_id);
        Err(AppError::Unsupported {
            operation: "get_embedding".to_string(),
        })
    }

    /// All stored ids of a kind, when [`supports_lookup`](Self::supports_lookup).
    async fn list_item_ids(&self, kind: ItemKind, scope_id: Option<&str>) -> Result<Vec<String>> {
        let _ = (kind, scope_id);
        Err(AppError::Unsupported {
            operation: "list_item_ids".to_string(),
        })
    }

    fn supports_lookup(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Cosine similarity of two vectors; 0.0 when either is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
