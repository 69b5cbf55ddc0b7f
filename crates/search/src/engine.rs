//! Engine facade
//!
//! [`RagEngine`] wires query processing, hybrid retrieval, filtering,
//! context assembly and the result cache together with the sync and
//! consistency machinery. It is the surface the gateway serves.

use crate::cache::{cache_key, CacheStats, ResultCache};
use crate::context::{ContextAssembler, ContextRenderer, ContextSource};
use crate::filter::{FilterConfig, FilterReport, MultiStageFilter};
use crate::query::{ProcessedQuery, QueryIntent, QueryProcessor, QueryProcessorConfig};
use crate::retrieval::{HybridRetriever, SearchFilters, SearchOptions};
use chrono::Utc;
use kgrag_common::errors::{safe_handle, AppError, Result};
use kgrag_common::metrics;
use kgrag_common::models::{Inconsistency, ItemKind, KnowledgeItem, SearchResult};
use kgrag_common::EngineContext;
use kgrag_sync::{
    never_cancel, BulkProgress, BulkRegenerator, BulkReport, CancelCheck, ConsistencyAuditor,
    ConsistencyScheduler, FlagRepairReport, FlagRepairer, SyncManager, SyncTicket, UpsertOptions,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<QueryIntent>,
    pub cached: bool,
    pub timed_out: bool,
    /// Kinds answered by keyword search alone
    pub degraded: Vec<ItemKind>,
    pub filter: FilterReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextResponse {
    pub context: String,
    pub sources: Vec<ContextSource>,
    pub results: Vec<SearchResult>,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct KindRepair {
    pub repaired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairAllReport {
    pub found: usize,
    pub per_kind: BTreeMap<ItemKind, KindRepair>,
    pub flags: BTreeMap<ItemKind, FlagRepairReport>,
}

/// Filter entries that make up the cache key. `limit` is included since
/// it changes the result set.
fn filter_entries(filters: &SearchFilters, limit: usize) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(filters) {
        for (name, value) in map {
            let value = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            entries.insert(name, value);
        }
    }
    entries.insert("limit".to_string(), limit.to_string());
    entries
}

pub struct RagEngine {
    ctx: EngineContext,
    processor: QueryProcessor,
    retriever: HybridRetriever,
    filter: MultiStageFilter,
    assembler: ContextAssembler,
    renderer: ContextRenderer,
    cache: ResultCache,
    sync: SyncManager,
    auditor: ConsistencyAuditor,
    flags: FlagRepairer,
    bulk: BulkRegenerator,
    scheduler: ConsistencyScheduler,
}

impl RagEngine {
    pub fn new(ctx: EngineContext) -> Result<Self> {
        let filter = MultiStageFilter::default();
        let sync = SyncManager::new(ctx.clone());
        let auditor = ConsistencyAuditor::new(sync.clone());
        let config = &ctx.config;

        Ok(Self {
            processor: QueryProcessor::new(QueryProcessorConfig::default())?,
            retriever: HybridRetriever::new(ctx.clone(), filter.config().boost_fields.clone()),
            assembler: ContextAssembler::new(config.context.clone()),
            renderer: ContextRenderer::new(ctx.primary.clone(), config.search.resolve_concurrency),
            cache: ResultCache::new(config.cache.clone(), ctx.settings.clone()),
            flags: FlagRepairer::new(ctx.clone()),
            bulk: BulkRegenerator::new(sync.clone()),
            scheduler: ConsistencyScheduler::new(auditor.clone()),
            filter,
            sync,
            auditor,
            ctx,
        })
    }

    pub fn with_filter(mut self, config: FilterConfig) -> Self {
        self.retriever = HybridRetriever::new(self.ctx.clone(), config.boost_fields.clone());
        self.filter = MultiStageFilter::new(config);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &ConsistencyScheduler {
        &self.scheduler
    }

    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        Ok(self.search_detailed(query, limit, filters).await?.results)
    }

    #[instrument(skip(self, filters), fields(scope_id = ?filters.scope_id))]
    pub async fn search_detailed(
        &self,
        query: &str,
        limit: Option<usize>,
        filters: &SearchFilters,
    ) -> Result<SearchResponse> {
        let start = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidQuery {
                message: "query must not be empty".to_string(),
            });
        }
        let limit = limit.unwrap_or(self.ctx.config.search.default_limit).max(1);
        let key = cache_key(query, &filter_entries(filters, limit));

        if let Some(results) = self.cache.get(&key).await {
            metrics::record_search(start.elapsed().as_secs_f64(), "cached", results.len());
            return Ok(SearchResponse {
                results,
                cached: true,
                ..Default::default()
            });
        }

        let processed: ProcessedQuery = self.processor.process(query);
        if processed.normalized.is_empty() {
            return Err(AppError::InvalidQuery {
                message: "query has no searchable text".to_string(),
            });
        }

        let options = SearchOptions::from_config(&self.ctx.config.search, limit);
        let outcome = self.retriever.search(&processed, filters, options).await;
        let (results, report) = self.filter.apply(outcome.results, Utc::now());

        let elapsed = start.elapsed().as_secs_f64();
        metrics::record_search(elapsed, processed.intent.as_str(), results.len());
        info!(
            intent = processed.intent.as_str(),
            results = results.len(),
            timed_out = outcome.timed_out,
            elapsed_ms = (elapsed * 1000.0) as u64,
            "Search complete"
        );

        // Partial answers are not cached
        if !outcome.timed_out {
            self.cache.set(&key, filters.scope_id.as_deref(), &results).await;
        }

        Ok(SearchResponse {
            results,
            intent: Some(processed.intent),
            cached: false,
            timed_out: outcome.timed_out,
            degraded: outcome.degraded,
            filter: report,
        })
    }

    /// Rendered context for `query`. Any failure yields an empty context.
    #[instrument(skip(self, filters))]
    pub async fn get_context(
        &self,
        query: &str,
        limit: Option<usize>,
        filters: &SearchFilters,
        max_tokens: Option<usize>,
    ) -> ContextResponse {
        let max_tokens = max_tokens.unwrap_or(self.ctx.config.context.max_tokens);
        let response = safe_handle(
            self.search_detailed(query, limit, filters),
            SearchResponse::default(),
            "get_context",
        )
        .await;
        if response.results.is_empty() {
            return ContextResponse::default();
        }

        let selected = self.assembler.optimize(&response.results, max_tokens, Utc::now());
        let rendered = self.renderer.render(&selected.items).await;
        let context = self.assembler.optimize_str(&rendered.text, max_tokens);

        ContextResponse {
            estimated_tokens: self.assembler.estimate_tokens(&context),
            context,
            sources: rendered.sources,
            results: selected.items,
        }
    }

    async fn invalidate_item(&self, kind: ItemKind, item_id: &str, scope_id: Option<&str>) {
        self.cache.invalidate_for_item(kind, item_id).await;
        if let Some(scope) = scope_id {
            self.cache.invalidate_for_scope(scope).await;
        }
    }

    /// Sync hook for a newly created item.
    pub async fn on_create(&self, item: &KnowledgeItem) -> Result<SyncTicket> {
        let outcome = self.sync.sync_upsert(item, UpsertOptions::default()).await;
        self.invalidate_item(item.kind(), &item.id, item.scope().as_deref()).await;
        Ok(settle(outcome))
    }

    /// Sync hook for an update. Re-embeds only when an embedding-relevant
    /// field changed.
    pub async fn on_update(
        &self,
        item: &KnowledgeItem,
        previous: Option<&KnowledgeItem>,
        updated_fields: Option<&[String]>,
    ) -> Result<SyncTicket> {
        let options = UpsertOptions {
            previous,
            updated_fields,
            scope_id: None,
        };
        let outcome = self.sync.sync_upsert(item, options).await;
        self.invalidate_item(item.kind(), &item.id, item.scope().as_deref()).await;
        Ok(settle(outcome))
    }

    pub async fn on_delete(
        &self,
        kind: ItemKind,
        item_id: &str,
        scope_id: Option<&str>,
    ) -> Result<SyncTicket> {
        let outcome = self.sync.sync_delete(kind, item_id, scope_id).await;
        self.invalidate_item(kind, item_id, scope_id).await;
        Ok(settle(outcome))
    }

    pub async fn check_consistency(&self, scope_id: Option<&str>) -> Result<Vec<Inconsistency>> {
        self.auditor.check_consistency(scope_id).await
    }

    /// Flag repair for every kind, then a full check and repair.
    #[instrument(skip(self))]
    pub async fn repair_all(&self, scope_id: Option<&str>) -> Result<RepairAllReport> {
        let mut report = RepairAllReport::default();

        for kind in ItemKind::ALL {
            match self.flags.repair_flags(kind, scope_id, &never_cancel).await {
                Ok(flags) => {
                    report.flags.insert(kind, flags);
                }
                Err(e) => warn!(kind = %kind, error = %e, "Flag repair failed"),
            }
        }

        let inconsistencies = self.auditor.check_consistency(scope_id).await?;
        report.found = inconsistencies.len();
        let repaired = self.auditor.repair(&inconsistencies, &never_cancel).await;

        for kind in ItemKind::ALL {
            let total = inconsistencies.iter().filter(|i| i.kind == kind).count();
            let failed = repaired.errors.iter().filter(|e| e.kind == kind).count();
            report.per_kind.insert(
                kind,
                KindRepair {
                    repaired: total.saturating_sub(failed),
                    failed,
                },
            );
        }

        self.invalidate_scope(scope_id).await;
        info!(
            found = report.found,
            repaired = repaired.repaired,
            failed = repaired.failed,
            "Repair-all complete"
        );
        Ok(report)
    }

    /// Regenerate every embedding of `kinds` in the scope.
    pub async fn regenerate(
        &self,
        scope_id: &str,
        kinds: &[ItemKind],
        force: bool,
        cancel: CancelCheck<'_>,
        on_progress: &(dyn Fn(BulkProgress) + Send + Sync),
    ) -> Result<BulkReport> {
        let report = self
            .bulk
            .regenerate_scope(scope_id, kinds, force, cancel, on_progress)
            .await?;
        self.invalidate_scope(Some(scope_id)).await;
        Ok(report)
    }

    async fn invalidate_scope(&self, scope_id: Option<&str>) {
        match scope_id {
            Some(scope) => {
                self.cache.invalidate_for_scope(scope).await;
            }
            None => self.cache.clear().await,
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}

/// A sync failure never fails the hook: the primary write already committed.
fn settle(outcome: Result<SyncTicket>) -> SyncTicket {
    outcome.unwrap_or_else(|e| {
        warn!(error = %e, "Index sync failed, primary store remains authoritative");
        SyncTicket::Failed(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entity, harness, relation, seed, topic, Harness};
    use kgrag_common::models::InconsistencyType;
    use kgrag_common::{PrimaryStore, SyncFlag};
    use tokio_test::{assert_err, assert_ok};

    fn engine(h: &Harness) -> RagEngine {
        RagEngine::new(h.ctx.clone()).unwrap()
    }

    async fn seed_acme(h: &Harness) {
        seed(h, &entity("e1", "Acme Robotics")).await;
        seed(h, &relation("r1", "Acme partnership with Globex")).await;
        seed(h, &topic("t1", "Acme roadmap")).await;
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query() {
        let h = harness();
        let err = assert_err!(engine(&h).search("   ", None, &SearchFilters::default()).await);
        assert!(matches!(err, AppError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_search_is_cached_until_invalidated() {
        let h = harness();
        seed_acme(&h).await;
        let engine = engine(&h);
        let filters = SearchFilters::for_scope("org-1");

        let first = engine.search_detailed("Acme", Some(5), &filters).await.unwrap();
        assert!(!first.cached);
        assert!(!first.results.is_empty());
        assert_eq!(first.intent, Some(QueryIntent::EntitySearch));

        let second = engine.search_detailed("Acme", Some(5), &filters).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.results, first.results);

        // a different limit is a different cache entry
        assert!(!engine.search_detailed("Acme", Some(2), &filters).await.unwrap().cached);

        let created = entity("e9", "Acme Labs");
        h.primary.upsert(&created).await.unwrap();
        engine.on_create(&created).await.unwrap().wait().await.unwrap();

        let third = engine.search_detailed("Acme", Some(5), &filters).await.unwrap();
        assert!(!third.cached);
        assert!(third.results.iter().any(|r| r.id == "e9"));
    }

    #[tokio::test]
    async fn test_failed_sync_still_invalidates_cache() {
        let h = harness();
        seed_acme(&h).await;
        let engine = engine(&h);
        let filters = SearchFilters::for_scope("org-1");
        engine.search_detailed("Acme", Some(5), &filters).await.unwrap();
        assert!(engine.search_detailed("Acme", Some(5), &filters).await.unwrap().cached);

        h.index.set_fail_all_upserts(true);
        let created = entity("e9", "Acme Labs");
        h.primary.upsert(&created).await.unwrap();
        let ticket = assert_ok!(engine.on_create(&created).await);
        assert!(matches!(ticket, SyncTicket::Failed(_)));

        let mut updated = created.clone();
        updated.payload = entity("e9", "Acme Labs Europe").payload;
        h.primary.upsert(&updated).await.unwrap();
        let ticket = assert_ok!(engine.on_update(&updated, Some(&created), None).await);
        assert!(matches!(ticket, SyncTicket::Failed(_)));

        // keyword retrieval still sees the primary write
        let after = engine.search_detailed("Acme", Some(5), &filters).await.unwrap();
        assert!(!after.cached);
        assert!(after.results.iter().any(|r| r.id == "e9"));
    }

    fn require_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_engine_futures_are_send() {
        let h = harness();
        let engine = engine(&h);
        let filters = SearchFilters::default();
        require_send(engine.search_detailed("acme", None, &filters));
        require_send(engine.get_context("acme", None, &filters, None));
        require_send(engine.repair_all(None));
        let progress = |_: BulkProgress| {};
        require_send(engine.regenerate("org-1", &ItemKind::ALL, false, &never_cancel, &progress));
    }

    #[tokio::test]
    async fn test_get_context_renders_sources_within_budget() {
        let h = harness();
        seed_acme(&h).await;
        let engine = engine(&h);

        let response = engine
            .get_context("Acme", Some(5), &SearchFilters::default(), Some(2000))
            .await;
        assert!(response.context.starts_with("## 関連情報"));
        assert!(response.context.contains("## 関連エンティティ"));
        assert!(!response.sources.is_empty());
        assert!(response.estimated_tokens <= 2000);

        let tight = engine
            .get_context("Acme", Some(5), &SearchFilters::default(), Some(10))
            .await;
        assert!(tight.estimated_tokens <= 10);
    }

    #[tokio::test]
    async fn test_get_context_is_empty_on_failure() {
        let h = harness();
        let response = engine(&h)
            .get_context("", None, &SearchFilters::default(), None)
            .await;
        assert!(response.context.is_empty());
        assert!(response.sources.is_empty());
    }

    #[tokio::test]
    async fn test_on_delete_removes_from_results() {
        let h = harness();
        seed_acme(&h).await;
        let engine = engine(&h);
        let filters = SearchFilters::default();
        assert!(engine
            .search("Acme", None, &filters)
            .await
            .unwrap()
            .iter()
            .any(|r| r.id == "t1"));

        h.primary.delete(ItemKind::Topic, "t1").await.unwrap();
        engine
            .on_delete(ItemKind::Topic, "t1", Some("org-1"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let results = engine.search("Acme", None, &filters).await.unwrap();
        assert!(!results.iter().any(|r| r.id == "t1"));
        assert!(!h.memory_index.contains(ItemKind::Topic, "t1").await);
    }

    #[tokio::test]
    async fn test_repair_all_heals_divergence() {
        let h = harness();
        seed_acme(&h).await;

        // primary-only item with a stale flag
        let mut stale = entity("e2", "Initech");
        stale.sync_flag = SyncFlag::Synced;
        h.primary.upsert(&stale).await.unwrap();

        let engine = engine(&h);
        let before = engine.check_consistency(Some("org-1")).await.unwrap();
        assert!(before
            .iter()
            .any(|i| i.item_id == "e2" && i.issue == InconsistencyType::MissingInIndex));

        let report = engine.repair_all(Some("org-1")).await.unwrap();
        assert_eq!(report.per_kind[&ItemKind::Entity].failed, 0);
        assert!(report.flags[&ItemKind::Entity].marked_unsynced >= 1);

        assert!(h.memory_index.contains(ItemKind::Entity, "e2").await);
        assert!(engine.check_consistency(Some("org-1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_and_cache_stats() {
        let h = harness();
        seed_acme(&h).await;
        let engine = engine(&h);
        engine.search("Acme", None, &SearchFilters::default()).await.unwrap();
        assert_eq!(engine.cache_stats().await.memory_count, 1);

        let report = engine
            .regenerate("org-1", &ItemKind::ALL, true, &never_cancel, &|_: BulkProgress| {})
            .await
            .unwrap();
        assert_eq!(report.total().succeeded, 3);
        assert_eq!(engine.cache_stats().await.total, 0);

        engine.search("Acme", None, &SearchFilters::default()).await.unwrap();
        engine.clear_cache().await;
        assert_eq!(engine.cache_stats().await.total, 0);
    }
}
