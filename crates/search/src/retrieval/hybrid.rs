//! Hybrid retrieval combining vector and keyword search per kind
//!
//! Every requested kind is searched concurrently, and each kind runs its
//! two retrievers together before merging them. The fan-out races a
//! deadline; kinds still running when it passes get one smaller recovery
//! round under its own deadline. Whatever finished by then is returned.

use super::{
    composite_score, entity_boost, fuse, Candidate, KeywordRetriever, KindRequest, Retriever,
    ScoringWeights, SearchFilters, VectorRetriever,
};
use crate::query::ProcessedQuery;
use chrono::{DateTime, Utc};
use futures::stream::{self, FuturesUnordered, StreamExt};
use kgrag_common::config::SearchConfig;
use kgrag_common::errors::Result;
use kgrag_common::metrics;
use kgrag_common::models::{ItemKind, KnowledgeItem, SearchResult};
use kgrag_common::store::Conditions;
use kgrag_common::EngineContext;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

/// Ids per batched record lookup
const RESOLVE_BATCH: usize = 10;

/// Candidates fetched per mode, as a multiple of the per-kind limit
const FETCH_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub limit_per_kind: usize,
    pub timeout: Duration,
    pub recovery_timeout: Duration,
    pub recovery_limit: usize,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig, limit_per_kind: usize) -> Self {
        Self {
            limit_per_kind,
            timeout: config.timeout(),
            recovery_timeout: config.recovery_timeout(),
            recovery_limit: config.recovery_limit,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalOutcome {
    /// All kinds, composite score descending
    pub results: Vec<SearchResult>,
    pub weights: ScoringWeights,
    pub timed_out: bool,
    /// Kinds served by keyword search alone
    pub degraded: Vec<ItemKind>,
    /// Kinds with no answer before the recovery deadline
    pub unfinished: Vec<ItemKind>,
}

#[derive(Debug, Default)]
struct KindOutcome {
    results: Vec<SearchResult>,
    degraded: bool,
}

/// Per-search inputs shared by every kind.
struct Round<'a> {
    query: &'a ProcessedQuery,
    embedding: Option<&'a [f32]>,
    filters: &'a SearchFilters,
    weights: &'a ScoringWeights,
    now: DateTime<Utc>,
}

pub struct HybridRetriever {
    ctx: EngineContext,
    vector: VectorRetriever,
    keyword: KeywordRetriever,
    boost_fields: Vec<String>,
}

impl HybridRetriever {
    pub fn new(ctx: EngineContext, boost_fields: Vec<String>) -> Self {
        Self {
            vector: VectorRetriever::new(ctx.index.clone()),
            keyword: KeywordRetriever::new(ctx.primary.clone()),
            ctx,
            boost_fields,
        }
    }

    /// Never fails: failing kinds come back empty, late kinds are dropped.
    #[instrument(
        skip(self, query, filters),
        fields(query = %query.normalized, intent = query.intent.as_str())
    )]
    pub async fn search(
        &self,
        query: &ProcessedQuery,
        filters: &SearchFilters,
        options: SearchOptions,
    ) -> RetrievalOutcome {
        let weights = ScoringWeights::for_query(&query.normalized);
        let kinds = filters.kinds();
        let deadline = Instant::now() + options.timeout;
        let embedding = self.embed_query(query, deadline).await;

        let round = Round {
            query,
            embedding: embedding.as_deref(),
            filters,
            weights: &weights,
            now: Utc::now(),
        };
        let mut outcome = RetrievalOutcome {
            weights,
            ..Default::default()
        };

        let (mut finished, pending) = self
            .run_round(&kinds, &round, options.limit_per_kind, deadline)
            .await;

        if !pending.is_empty() {
            outcome.timed_out = true;
            metrics::record_search_timeout("primary");
            let limit = options.limit_per_kind.min(options.recovery_limit).max(1);
            warn!(pending = ?pending, limit, "Search timed out, starting recovery round");

            let recovery_deadline = Instant::now() + options.recovery_timeout;
            let (recovered, unfinished) =
                self.run_round(&pending, &round, limit, recovery_deadline).await;
            if !unfinished.is_empty() {
                metrics::record_search_timeout("recovery");
                warn!(
                    unfinished = ?unfinished,
                    "Recovery round timed out, returning partial results"
                );
            }
            finished.extend(recovered);
            outcome.unfinished = unfinished;
        }

        for (kind, kind_outcome) in finished {
            if kind_outcome.degraded {
                outcome.degraded.push(kind);
            }
            outcome.results.extend(kind_outcome.results);
        }
        outcome.results.sort_by(|a, b| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        outcome
    }

    async fn embed_query(&self, query: &ProcessedQuery, deadline: Instant) -> Option<Vec<f32>> {
        match timeout_at(deadline, self.ctx.embedder.embed(&query.rewritten)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                warn!(
                    class = e.rag_kind().as_str(),
                    error = %e,
                    "Query embedding failed, keyword search only"
                );
                None
            }
            Err(_) => {
                warn!("Query embedding timed out, keyword search only");
                None
            }
        }
    }

    /// Kinds finished before `deadline`, and the kinds still running.
    async fn run_round(
        &self,
        kinds: &[ItemKind],
        round: &Round<'_>,
        limit: usize,
        deadline: Instant,
    ) -> (BTreeMap<ItemKind, KindOutcome>, Vec<ItemKind>) {
        let mut in_flight = FuturesUnordered::new();
        for &kind in kinds {
            in_flight.push(async move { (kind, self.search_kind(kind, round, limit).await) });
        }

        let mut finished = BTreeMap::new();
        while let Ok(Some((kind, outcome))) = timeout_at(deadline, in_flight.next()).await {
            finished.insert(kind, outcome);
        }

        let pending = kinds
            .iter()
            .copied()
            .filter(|k| !finished.contains_key(k))
            .collect();
        (finished, pending)
    }

    async fn search_kind(&self, kind: ItemKind, round: &Round<'_>, limit: usize) -> KindOutcome {
        let request = KindRequest {
            kind,
            query: round.query,
            embedding: round.embedding,
            limit: limit * FETCH_FACTOR,
            filters: round.filters,
        };

        let (vector, keyword) = tokio::join!(
            self.vector.retrieve(&request),
            self.keyword.retrieve(&request)
        );

        let mut degraded = false;
        let vector = vector.unwrap_or_else(|e| {
            warn!(
                kind = %kind,
                class = e.rag_kind().as_str(),
                error = %e,
                "Vector search failed, degrading to keyword results"
            );
            degraded = true;
            Vec::new()
        });
        let keyword = match keyword {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    kind = %kind,
                    class = e.rag_kind().as_str(),
                    error = %e,
                    "Keyword search failed"
                );
                if degraded {
                    return KindOutcome::default();
                }
                Vec::new()
            }
        };

        let resolved = self.resolve(kind, fuse(vector, keyword)).await;
        let mut results: Vec<SearchResult> = resolved
            .into_iter()
            .filter(|(_, item)| round.filters.matches(item))
            .map(|(candidate, item)| self.score(candidate, item, round))
            .collect();
        results.sort_by(|a, b| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        debug!(kind = %kind, count = results.len(), degraded, "Kind search complete");
        KindOutcome { results, degraded }
    }

    /// Attach records to candidates, loading missing ones in bounded
    /// concurrent batches. Candidates without a record are dropped.
    async fn resolve(
        &self,
        kind: ItemKind,
        candidates: Vec<Candidate>,
    ) -> Vec<(Candidate, KnowledgeItem)> {
        let missing: Vec<String> = candidates
            .iter()
            .filter(|c| c.item.is_none())
            .map(|c| c.item_id.clone())
            .collect();

        let mut loaded: HashMap<String, KnowledgeItem> = HashMap::new();
        if !missing.is_empty() {
            let concurrency = self.ctx.config.search.resolve_concurrency.max(1);
            let lookups: Vec<_> = missing
                .chunks(RESOLVE_BATCH)
                .map(<[String]>::to_vec)
                .map(|ids| {
                    let primary = Arc::clone(&self.ctx.primary);
                    async move {
                        let conditions = Conditions {
                            ids: Some(ids),
                            ..Default::default()
                        };
                        primary.query_by_conditions(kind, &conditions).await
                    }
                })
                .collect();
            let batches: Vec<Result<Vec<KnowledgeItem>>> =
                stream::iter(lookups).buffer_unordered(concurrency).collect().await;

            for batch in batches {
                match batch {
                    Ok(items) => loaded.extend(items.into_iter().map(|i| (i.id.clone(), i))),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Record lookup failed, dropping batch")
                    }
                }
            }
        }

        candidates
            .into_iter()
            .filter_map(|mut candidate| {
                let item = candidate.item.take().or_else(|| loaded.remove(&candidate.item_id));
                if item.is_none() {
                    debug!(
                        kind = %kind,
                        item_id = %candidate.item_id,
                        "Indexed item missing from primary store"
                    );
                }
                item.map(|item| (candidate, item))
            })
            .collect()
    }

    fn score(&self, candidate: Candidate, item: KnowledgeItem, round: &Round<'_>) -> SearchResult {
        let composite = composite_score(
            candidate.score,
            &item,
            round.weights,
            &self.boost_fields,
            round.now,
        );
        let composite = entity_boost(
            composite,
            &item,
            &round.query.normalized,
            round.filters.entity_type.as_deref(),
        );
        SearchResult {
            kind: candidate.kind,
            id: candidate.item_id,
            similarity_score: candidate.score,
            composite_score: composite,
            item: Some(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryProcessor, QueryProcessorConfig};
    use crate::test_support::{entity, harness, relation, seed, topic, Harness};
    use kgrag_common::{Embedder, VectorIndex};

    fn retriever(h: &Harness) -> HybridRetriever {
        HybridRetriever::new(h.ctx.clone(), vec!["role".into(), "industry".into()])
    }

    fn query(text: &str) -> ProcessedQuery {
        QueryProcessor::new(QueryProcessorConfig::default()).unwrap().process(text)
    }

    fn options(timeout_ms: u64, recovery_ms: u64) -> SearchOptions {
        SearchOptions {
            limit_per_kind: 5,
            timeout: Duration::from_millis(timeout_ms),
            recovery_timeout: Duration::from_millis(recovery_ms),
            recovery_limit: 3,
        }
    }

    async fn seed_acme(h: &Harness) {
        seed(h, &entity("e1", "Acme Robotics")).await;
        seed(h, &relation("r1", "Acme partnership with Globex")).await;
        seed(h, &topic("t1", "Acme roadmap")).await;
    }

    fn ids(outcome: &RetrievalOutcome) -> Vec<&str> {
        outcome.results.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_search_covers_every_kind_sorted() {
        let h = harness();
        seed_acme(&h).await;

        let outcome = retriever(&h)
            .search(&query("Acme"), &SearchFilters::for_scope("org-1"), options(5000, 1000))
            .await;

        let found = ids(&outcome);
        for id in ["e1", "r1", "t1"] {
            assert!(found.contains(&id), "missing {} in {:?}", id, found);
        }
        assert!(outcome
            .results
            .windows(2)
            .all(|w| w[0].composite_score >= w[1].composite_score));
        assert!(outcome.results.iter().all(|r| r.item.is_some()));
        assert!(!outcome.timed_out);
        assert!(outcome.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_vector_failure_degrades_only_that_kind() {
        let h = harness();
        seed_acme(&h).await;
        h.index.fail_search_for(ItemKind::Relation);

        let outcome = retriever(&h)
            .search(&query("Acme"), &SearchFilters::default(), options(5000, 1000))
            .await;

        assert_eq!(outcome.degraded, vec![ItemKind::Relation]);
        assert!(ids(&outcome).contains(&"r1"));
        assert!(ids(&outcome).contains(&"e1"));
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_keyword_results() {
        let h = harness();
        seed_acme(&h).await;
        h.embedder.set_failing(true);

        let outcome = retriever(&h)
            .search(&query("Acme"), &SearchFilters::default(), options(5000, 1000))
            .await;

        assert_eq!(outcome.degraded, ItemKind::ALL.to_vec());
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_partial_results() {
        let h = harness();
        seed_acme(&h).await;
        h.index.delay_search_for(ItemKind::Topic, Duration::from_secs(60));

        let outcome = retriever(&h)
            .search(&query("Acme"), &SearchFilters::default(), options(200, 100))
            .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.unfinished, vec![ItemKind::Topic]);
        let found = ids(&outcome);
        assert!(found.contains(&"e1"));
        assert!(!found.contains(&"t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_round_fills_late_kind() {
        let h = harness();
        seed_acme(&h).await;
        h.index.delay_search_for(ItemKind::Topic, Duration::from_millis(300));

        let outcome = retriever(&h)
            .search(&query("Acme"), &SearchFilters::default(), options(200, 1000))
            .await;

        assert!(outcome.timed_out);
        assert!(outcome.unfinished.is_empty());
        assert!(ids(&outcome).contains(&"t1"));
    }

    #[tokio::test]
    async fn test_date_filter_and_orphans() {
        let h = harness();
        seed_acme(&h).await;
        let mut undated = entity("e2", "Acme Logistics");
        undated.updated_at = None;
        seed(&h, &undated).await;

        // Indexed but absent from the primary store
        let ghost = entity("e3", "Acme Ghost");
        let manager = kgrag_sync::SyncManager::new(h.ctx.clone());
        let vector = h.ctx.embedder.embed("Acme Ghost").await.unwrap();
        h.memory_index
            .upsert_embedding(&manager.build_embedding(&ghost, "org-1", vector))
            .await
            .unwrap();

        let filters = SearchFilters {
            kinds: Some(vec![ItemKind::Entity]),
            updated_after: Some(Utc::now() - chrono::Duration::days(1)),
            ..Default::default()
        };
        let outcome = retriever(&h).search(&query("Acme"), &filters, options(5000, 1000)).await;
        assert_eq!(ids(&outcome), vec!["e1"]);
    }
}
