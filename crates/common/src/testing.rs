//! Fault-injection wrappers
//!
//! Wrap a real store or embedder and flip switches at runtime to make
//! selected calls fail, slow down, or report an unsupported operation.

use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::models::{Embedding, ItemKind};
use crate::store::{VectorHit, VectorIndex};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FaultyVectorIndex {
    inner: Arc<dyn VectorIndex>,
    failing_upserts: Mutex<HashSet<String>>,
    fail_all_upserts: AtomicBool,
    failing_searches: Mutex<HashSet<ItemKind>>,
    search_delays: Mutex<HashMap<ItemKind, Duration>>,
    delete_unsupported: AtomicBool,
    fail_deletes: AtomicBool,
    upsert_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl FaultyVectorIndex {
    pub fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            failing_upserts: Mutex::new(HashSet::new()),
            fail_all_upserts: AtomicBool::new(false),
            failing_searches: Mutex::new(HashSet::new()),
            search_delays: Mutex::new(HashMap::new()),
            delete_unsupported: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            upsert_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_upsert_for(&self, item_id: &str) {
        guard(&self.failing_upserts).insert(item_id.to_string());
    }

    pub fn set_fail_all_upserts(&self, fail: bool) {
        self.fail_all_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_search_for(&self, kind: ItemKind) {
        guard(&self.failing_searches).insert(kind);
    }

    pub fn delay_search_for(&self, kind: ItemKind, delay: Duration) {
        guard(&self.search_delays).insert(kind, delay);
    }

    pub fn clear_faults(&self) {
        guard(&self.failing_upserts).clear();
        guard(&self.failing_searches).clear();
        guard(&self.search_delays).clear();
        self.fail_all_upserts.store(false, Ordering::SeqCst);
        self.delete_unsupported.store(false, Ordering::SeqCst);
        self.fail_deletes.store(false, Ordering::SeqCst);
    }

    pub fn set_delete_unsupported(&self, unsupported: bool) {
        self.delete_unsupported.store(unsupported, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for FaultyVectorIndex {
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all_upserts.load(Ordering::SeqCst)
            || guard(&self.failing_upserts).contains(&embedding.item_id)
        {
            return Err(AppError::VectorIndexConnection {
                message: format!("vector index connection refused for {}", embedding.item_id),
            });
        }
        self.inner.upsert_embedding(embedding).await
    }

    async fn delete_embedding(&self, kind: ItemKind, item_id: &str, scope_id: &str) -> Result<()> {
        if self.delete_unsupported.load(Ordering::SeqCst) {
            return Err(AppError::Unsupported {
                operation: "delete_embedding".to_string(),
            });
        }
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::VectorIndexConnection {
                message: "vector index connection reset".to_string(),
            });
        }
        self.inner.delete_embedding(kind, item_id, scope_id).await
    }

    async fn similarity_search(
        &self,
        kind: ItemKind,
        query: &[f32],
        k: usize,
        scope_id: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let delay = guard(&self.search_delays).get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if guard(&self.failing_searches).contains(&kind) {
            return Err(AppError::VectorIndexSearch {
                message: format!("vector index query failed for {}", kind),
            });
        }
        self.inner.similarity_search(kind, query, k, scope_id).await
    }

    async fn get_embedding(&self, kind: ItemKind, item_id: &str) -> Result<Option<Embedding>> {
        self.inner.get_embedding(kind, item_id).await
    }

    async fn list_item_ids(&self, kind: ItemKind, scope_id: Option<&str>) -> Result<Vec<String>> {
        self.inner.list_item_ids(kind, scope_id).await
    }

    fn supports_lookup(&self) -> bool {
        self.inner.supports_lookup()
    }
}

/// Counts calls and can be switched into failure.
pub struct CountingEmbedder {
    inner: Arc<dyn Embedder>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl CountingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::EmbeddingError {
                message: "embedding generation failed: insufficient_quota".to_string(),
            });
        }
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
