//! In-process store implementations
//!
//! Used when no database or Redis URL is configured, and as test doubles.

use super::{cosine_similarity, Conditions, KvStore, PrimaryStore, VectorHit, VectorIndex};
use crate::errors::{AppError, Result};
use crate::models::{Embedding, ItemKind, KnowledgeItem};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

type ItemKey = (ItemKind, String);

#[derive(Default)]
pub struct MemoryPrimaryStore {
    items: RwLock<HashMap<ItemKey, KnowledgeItem>>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn get_by_id(&self, kind: ItemKind, id: &str) -> Result<Option<KnowledgeItem>> {
        Ok(self.items.read().await.get(&(kind, id.to_string())).cloned())
    }

    async fn query_by_conditions(
        &self,
        kind: ItemKind,
        conditions: &Conditions,
    ) -> Result<Vec<KnowledgeItem>> {
        let items = self.items.read().await;
        let mut matched: Vec<KnowledgeItem> = items
            .iter()
            .filter(|((k, _), item)| *k == kind && conditions.matches(item))
            .map(|(_, item)| item.clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = conditions.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn upsert(&self, item: &KnowledgeItem) -> Result<()> {
        self.items
            .write()
            .await
            .insert((item.kind(), item.id.clone()), item.clone());
        Ok(())
    }

    async fn delete(&self, kind: ItemKind, id: &str) -> Result<bool> {
        Ok(self
            .items
            .write()
            .await
            .remove(&(kind, id.to_string()))
            .is_some())
    }
}

/// Brute-force cosine index.
pub struct MemoryVectorIndex {
    embeddings: RwLock<HashMap<ItemKey, Embedding>>,
    lookup: bool,
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self {
            embeddings: RwLock::new(HashMap::new()),
            lookup: true,
        }
    }
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index that only answers similarity queries, like a remote
    /// service without get-by-id.
    pub fn similarity_only() -> Self {
        Self {
            lookup: false,
            ..Self::default()
        }
    }

    pub async fn len(&self) -> usize {
        self.embeddings.read().await.len()
    }

    pub async fn contains(&self, kind: ItemKind, item_id: &str) -> bool {
        self.embeddings
            .read()
            .await
            .contains_key(&(kind, item_id.to_string()))
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        self.embeddings
            .write()
            .await
            .insert((embedding.kind, embedding.item_id.clone()), embedding.clone());
        Ok(())
    }

    async fn delete_embedding(&self, kind: ItemKind, item_id: &str, _scope_id: &str) -> Result<()> {
        self.embeddings
            .write()
            .await
            .remove(&(kind, item_id.to_string()));
        Ok(())
    }

    async fn similarity_search(
        &self,
        kind: ItemKind,
        query: &[f32],
        k: usize,
        scope_id: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        let embeddings = self.embeddings.read().await;
        let mut hits: Vec<VectorHit> = embeddings
            .values()
            .filter(|e| e.kind == kind && scope_id.map_or(true, |s| e.scope_id == s))
            .map(|e| VectorHit {
                item_id: e.item_id.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn get_embedding(&self, kind: ItemKind, item_id: &str) -> Result<Option<Embedding>> {
        if !self.lookup {
            return Err(AppError::Unsupported {
                operation: "get_embedding".to_string(),
            });
        }
        Ok(self
            .embeddings
            .read()
            .await
            .get(&(kind, item_id.to_string()))
            .cloned())
    }

    async fn list_item_ids(&self, kind: ItemKind, scope_id: Option<&str>) -> Result<Vec<String>> {
        if !self.lookup {
            return Err(AppError::Unsupported {
                operation: "list_item_ids".to_string(),
            });
        }
        let embeddings = self.embeddings.read().await;
        let mut ids: Vec<String> = embeddings
            .values()
            .filter(|e| e.kind == kind && scope_id.map_or(true, |s| e.scope_id == s))
            .map(|e| e.item_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn supports_lookup(&self) -> bool {
        self.lookup
    }
}

/// Key/value store with an optional entry quota.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes of new keys once `max_entries` keys are stored.
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: Some(max_entries),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(quota) = self.quota {
            if !entries.contains_key(key) && entries.len() >= quota {
                return Err(AppError::CacheError {
                    message: format!("quota exceeded ({} entries)", quota),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityPayload, ItemPayload, SyncFlag};
    use chrono::Utc;

    fn entity(id: &str, scope: &str) -> KnowledgeItem {
        KnowledgeItem::new(
            id,
            scope,
            ItemPayload::Entity(EntityPayload {
                name: id.to_uppercase(),
                ..Default::default()
            }),
        )
    }

    fn embedding(id: &str, scope: &str, vector: Vec<f32>) -> Embedding {
        Embedding {
            item_id: id.into(),
            kind: ItemKind::Entity,
            scope_id: scope.into(),
            vector,
            model: "mock".into(),
            version: "1.0".into(),
            generated_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_primary_store_conditions() {
        let store = MemoryPrimaryStore::new();
        store.upsert(&entity("a", "org-1")).await.unwrap();
        store.upsert(&entity("b", "org-2")).await.unwrap();

        let found = store
            .query_by_conditions(ItemKind::Entity, &Conditions::scope(Some("org-1")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");

        store
            .update_sync_state(ItemKind::Entity, "b", SyncFlag::Synced, None)
            .await
            .unwrap();
        let synced = store
            .query_by_conditions(
                ItemKind::Entity,
                &Conditions {
                    sync_flag: Some(SyncFlag::Synced),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].id, "b");

        assert!(store
            .update_sync_state(ItemKind::Topic, "missing", SyncFlag::Synced, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_vector_index_scoped_search() {
        let index = MemoryVectorIndex::new();
        index.upsert_embedding(&embedding("a", "org-1", vec![1.0, 0.0])).await.unwrap();
        index.upsert_embedding(&embedding("b", "org-1", vec![0.6, 0.8])).await.unwrap();
        index.upsert_embedding(&embedding("c", "org-2", vec![1.0, 0.0])).await.unwrap();

        let hits = index
            .similarity_search(ItemKind::Entity, &[1.0, 0.0], 5, Some("org-1"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item_id, "a");

        index.delete_embedding(ItemKind::Entity, "a", "org-1").await.unwrap();
        assert!(!index.contains(ItemKind::Entity, "a").await);
    }

    #[tokio::test]
    async fn test_similarity_only_index_rejects_lookup() {
        let index = MemoryVectorIndex::similarity_only();
        assert!(!index.supports_lookup());
        let err = index.get_embedding(ItemKind::Entity, "a").await.unwrap_err();
        assert!(err.is_unsupported_operation());
    }

    #[tokio::test]
    async fn test_kv_quota() {
        let kv = MemoryKvStore::with_quota(1);
        kv.set("a", "1").await.unwrap();
        kv.set("a", "2").await.unwrap();
        assert!(kv.set("b", "1").await.is_err());
        assert_eq!(kv.keys_with_prefix("a").await.unwrap(), vec!["a".to_string()]);
    }
}
