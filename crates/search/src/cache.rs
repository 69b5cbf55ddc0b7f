//! Two-tier search result cache
//!
//! Tier 1 is a bounded in-process map evicting in insertion order. Tier 2
//! lives in the key/value store under a hashed key, bounded by periodic
//! cleanup. Caching is best-effort: store failures are logged, never
//! returned.

use chrono::Utc;
use kgrag_common::config::CacheConfig;
use kgrag_common::metrics;
use kgrag_common::models::{ItemKind, SearchResult};
use kgrag_common::KvStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Tier 2 cleanup runs after this many writes
const CLEANUP_EVERY: usize = 10;

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub results: Vec<SearchResult>,
    pub timestamp_ms: i64,
    pub ttl_ms: u64,
    /// Tier 1 insertion order
    #[serde(skip)]
    seq: u64,
}

impl CacheEntry {
    /// Expired strictly after `ttl` has elapsed.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp_ms > self.ttl_ms as i64
    }

    fn references(&self, kind: ItemKind, item_id: &str) -> bool {
        self.results.iter().any(|r| r.kind == kind && r.id == item_id)
    }

    /// Unscoped searches can include items from any scope.
    fn touches_scope(&self, scope_id: &str) -> bool {
        match self.scope_id.as_deref() {
            None => true,
            Some(scope) if scope == scope_id => true,
            Some(_) => self
                .results
                .iter()
                .any(|r| r.item.as_ref().is_some_and(|i| i.in_scope(scope_id))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_count: usize,
    pub persistent_count: usize,
    pub total: usize,
}

/// Stable key for a query and its filter entries: the JSON encoding of
/// both, with entries sorted by name.
pub fn cache_key(query: &str, filters: &BTreeMap<String, String>) -> String {
    serde_json::json!([query.trim(), filters]).to_string()
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ResultCache {
    config: CacheConfig,
    memory: Mutex<HashMap<String, CacheEntry>>,
    persistent: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    writes: AtomicUsize,
    inserted: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig, persistent: Arc<dyn KvStore>) -> Self {
        Self::with_clock(config, persistent, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        persistent: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            memory: Mutex::new(HashMap::new()),
            persistent,
            clock,
            writes: AtomicUsize::new(0),
            inserted: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn storage_key(&self, key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        format!("{}{}", self.config.key_prefix, hex::encode(digest))
    }

    pub async fn get(&self, key: &str) -> Option<Vec<SearchResult>> {
        if !self.config.enabled {
            return None;
        }
        let now = self.clock.now_millis();

        {
            let mut memory = guard(&self.memory);
            if let Some(entry) = memory.get(key) {
                if !entry.is_expired(now) {
                    metrics::record_cache(true, "memory");
                    return Some(entry.results.clone());
                }
                memory.remove(key);
            }
        }
        metrics::record_cache(false, "memory");

        let storage_key = self.storage_key(key);
        let raw = match self.persistent.get(&storage_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Persistent cache read failed");
                None
            }
        };
        let entry = raw.and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok());

        match entry {
            Some(entry) if !entry.is_expired(now) && entry.key == key => {
                metrics::record_cache(true, "persistent");
                let results = entry.results.clone();
                self.insert_memory(entry);
                Some(results)
            }
            other => {
                if other.is_some() {
                    self.delete_persistent(&storage_key).await;
                }
                metrics::record_cache(false, "persistent");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, scope_id: Option<&str>, results: &[SearchResult]) {
        if !self.config.enabled {
            return;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            scope_id: scope_id.map(str::to_string),
            results: results.to_vec(),
            timestamp_ms: self.clock.now_millis(),
            ttl_ms: self.config.ttl().as_millis() as u64,
            seq: 0,
        };

        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache entry");
                return;
            }
        };
        self.insert_memory(entry);

        let storage_key = self.storage_key(key);
        if let Err(e) = self.persistent.set(&storage_key, &payload).await {
            warn!(error = %e, "Persistent cache write failed, cleaning up and retrying");
            self.cleanup().await;
            if let Err(e) = self.persistent.set(&storage_key, &payload).await {
                warn!(error = %e, "Persistent cache write failed after cleanup, skipping");
            }
            return;
        }

        if self.writes.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY == CLEANUP_EVERY - 1 {
            self.cleanup().await;
        }
    }

    /// Rewarmed entries count as fresh inserts.
    fn insert_memory(&self, mut entry: CacheEntry) {
        entry.seq = self.inserted.fetch_add(1, Ordering::Relaxed);
        let mut memory = guard(&self.memory);
        if !memory.contains_key(&entry.key) && memory.len() >= self.config.memory_capacity {
            let oldest = memory
                .values()
                .min_by_key(|e| e.seq)
                .map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                memory.remove(&oldest);
            }
        }
        if self.config.memory_capacity > 0 {
            memory.insert(entry.key.clone(), entry);
        }
    }

    async fn delete_persistent(&self, storage_key: &str) {
        if let Err(e) = self.persistent.delete(storage_key).await {
            warn!(error = %e, "Persistent cache delete failed");
        }
    }

    /// Every readable tier 2 entry with its storage key. Unreadable ones
    /// are deleted on the way.
    async fn persistent_entries(&self) -> Vec<(String, CacheEntry)> {
        let keys = match self.persistent.keys_with_prefix(&self.config.key_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Persistent cache scan failed");
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.persistent.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(entry) => entries.push((key, entry)),
                    Err(_) => self.delete_persistent(&key).await,
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Persistent cache read failed"),
            }
        }
        entries
    }

    /// Purge expired entries from both tiers, then the oldest tier 2
    /// entries over capacity. Returns the number of tier 2 entries removed.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        guard(&self.memory).retain(|_, e| !e.is_expired(now));

        let (expired, mut live): (Vec<_>, Vec<_>) = self
            .persistent_entries()
            .await
            .into_iter()
            .partition(|(_, e)| e.is_expired(now));

        let mut removed = 0;
        for (key, _) in &expired {
            self.delete_persistent(key).await;
            removed += 1;
        }

        if live.len() > self.config.persistent_capacity {
            live.sort_by_key(|(_, e)| e.timestamp_ms);
            let excess = live.len() - self.config.persistent_capacity;
            for (key, _) in live.iter().take(excess) {
                self.delete_persistent(key).await;
                removed += 1;
            }
        }

        debug!(removed, "Cache cleanup complete");
        removed
    }

    async fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed = {
            let mut memory = guard(&self.memory);
            let before = memory.len();
            memory.retain(|_, e| !predicate(e));
            before - memory.len()
        };

        for (key, entry) in self.persistent_entries().await {
            if predicate(&entry) {
                self.delete_persistent(&key).await;
                removed += 1;
            }
        }
        removed
    }

    /// Drop every entry whose results contain the item.
    pub async fn invalidate_for_item(&self, kind: ItemKind, item_id: &str) -> usize {
        let removed = self.invalidate_where(|e| e.references(kind, item_id)).await;
        debug!(kind = %kind, item_id, removed, "Cache invalidated for item");
        removed
    }

    /// Drop every entry that could include items of the scope.
    pub async fn invalidate_for_scope(&self, scope_id: &str) -> usize {
        let removed = self.invalidate_where(|e| e.touches_scope(scope_id)).await;
        debug!(scope_id, removed, "Cache invalidated for scope");
        removed
    }

    pub async fn clear(&self) {
        guard(&self.memory).clear();
        match self.persistent.keys_with_prefix(&self.config.key_prefix).await {
            Ok(keys) => {
                for key in keys {
                    self.delete_persistent(&key).await;
                }
            }
            Err(e) => warn!(error = %e, "Persistent cache scan failed"),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_count = guard(&self.memory).len();
        let persistent_count = self
            .persistent
            .keys_with_prefix(&self.config.key_prefix)
            .await
            .map(|keys| keys.len())
            .unwrap_or(0);
        CacheStats {
            memory_count,
            persistent_count,
            total: memory_count + persistent_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgrag_common::models::{EntityPayload, ItemPayload, KnowledgeItem};
    use kgrag_common::store::memory::MemoryKvStore;

    const TTL: Duration = Duration::from_secs(3600);

    fn config(memory_capacity: usize, persistent_capacity: usize) -> CacheConfig {
        CacheConfig {
            memory_capacity,
            persistent_capacity,
            ..Default::default()
        }
    }

    fn cache(config: CacheConfig, kv: Arc<MemoryKvStore>) -> (ResultCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (ResultCache::with_clock(config, kv, clock.clone()), clock)
    }

    fn result(id: &str, scope: &str) -> SearchResult {
        SearchResult {
            kind: ItemKind::Entity,
            id: id.into(),
            similarity_score: 0.8,
            composite_score: 0.7,
            item: Some(KnowledgeItem::new(
                id,
                scope,
                ItemPayload::Entity(EntityPayload {
                    name: id.into(),
                    ..Default::default()
                }),
            )),
        }
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a: BTreeMap<String, String> = [("scope_id", "org-1"), ("limit", "5")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let b: BTreeMap<String, String> = [("limit", "5"), ("scope_id", "org-1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(cache_key(" acme ", &a), cache_key("acme", &b));
        assert_ne!(cache_key("acme", &a), cache_key("globex", &a));
    }

    #[test]
    fn test_cache_key_separates_query_from_filters() {
        let nested: BTreeMap<String, String> = [("entity_type", "x|limit=5"), ("limit", "5")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let flat: BTreeMap<String, String> = [("limit".to_string(), "5".to_string())].into();
        assert_ne!(
            cache_key("Acme", &nested),
            cache_key("Acme|entity_type=x|limit=5", &flat)
        );
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let kv = Arc::new(MemoryKvStore::new());
        let (cache, clock) = cache(config(50, 100), kv);
        cache.set("q", None, &[result("e1", "org-1")]).await;

        clock.advance(TTL);
        assert_eq!(cache.get("q").await.map(|r| r.len()), Some(1));

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("q").await.is_none());
        // expired hits are purged from both tiers
        assert_eq!(cache.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_memory_tier_is_bounded_and_rewarmed() {
        let kv = Arc::new(MemoryKvStore::new());
        let (cache, clock) = cache(config(3, 100), kv);
        for i in 0..5 {
            cache.set(&format!("q{}", i), None, &[result("e1", "org-1")]).await;
            clock.advance(Duration::from_secs(1));
        }
        let stats = cache.stats().await;
        assert_eq!(stats.memory_count, 3);
        assert_eq!(stats.persistent_count, 5);

        // oldest was evicted from tier 1 but still served from tier 2
        assert!(cache.get("q0").await.is_some());
        assert!(guard(&cache.memory).contains_key("q0"));
        assert_eq!(cache.stats().await.memory_count, 3);

        // the rewarmed entry is not the next one out
        cache.set("q5", None, &[]).await;
        assert!(guard(&cache.memory).contains_key("q0"));
    }

    #[tokio::test]
    async fn test_memory_eviction_follows_insertion_order() {
        for _ in 0..20 {
            let kv = Arc::new(MemoryKvStore::new());
            let (cache, _clock) = cache(config(3, 100), kv);
            for i in 0..4 {
                cache.set(&format!("q{}", i), None, &[]).await;
            }
            let memory = guard(&cache.memory);
            let mut keys: Vec<_> = memory.keys().cloned().collect();
            keys.sort();
            assert_eq!(keys, vec!["q1", "q2", "q3"]);
        }
    }

    #[tokio::test]
    async fn test_cleanup_bounds_persistent_tier() {
        let kv = Arc::new(MemoryKvStore::new());
        let (cache, clock) = cache(config(50, 3), kv);
        for i in 0..5 {
            cache.set(&format!("q{}", i), None, &[]).await;
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(cache.cleanup().await, 2);
        assert_eq!(cache.stats().await.persistent_count, 3);

        guard(&cache.memory).clear();
        assert!(cache.get("q0").await.is_none());
        assert!(cache.get("q4").await.is_some());
    }

    #[tokio::test]
    async fn test_quota_failure_cleans_up_and_retries() {
        let kv = Arc::new(MemoryKvStore::with_quota(2));
        let (cache, clock) = cache(config(50, 100), kv);
        cache.set("a", None, &[]).await;
        cache.set("b", None, &[]).await;
        clock.advance(TTL + Duration::from_secs(1));

        cache.set("c", None, &[]).await;
        let stats = cache.stats().await;
        assert_eq!(stats.persistent_count, 1);
        assert_eq!(stats.memory_count, 1);

        // a write that still fails after cleanup is swallowed
        cache.set("d", None, &[]).await;
        cache.set("e", None, &[]).await;
        assert_eq!(cache.stats().await.persistent_count, 2);
        assert!(cache.get("e").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidation() {
        let kv = Arc::new(MemoryKvStore::new());
        let (cache, _) = cache(config(50, 100), kv);
        cache.set("q1", Some("org-1"), &[result("e1", "org-1")]).await;
        cache.set("q2", Some("org-2"), &[result("e2", "org-2")]).await;
        cache.set("q3", None, &[result("e3", "org-2")]).await;

        assert_eq!(cache.invalidate_for_item(ItemKind::Entity, "e1").await, 2);
        assert!(cache.get("q1").await.is_none());

        // unscoped entries go with any scope
        cache.invalidate_for_scope("org-2").await;
        assert!(cache.get("q2").await.is_none());
        assert!(cache.get("q3").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut cfg = config(50, 100);
        cfg.enabled = false;
        let (cache, _) = cache(cfg, kv);
        cache.set("q", None, &[result("e1", "org-1")]).await;
        assert!(cache.get("q").await.is_none());
        assert_eq!(cache.stats().await.total, 0);

        cache.set("q", None, &[]).await;
        cache.clear().await;
    }
}
