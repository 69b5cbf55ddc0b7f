//! Consistency auditor and repairer
//!
//! `check_consistency` compares every item of a scope against the vector
//! index; `repair` resolves what it found by re-syncing, deleting or
//! correcting the sync flag.

use crate::manager::SyncManager;
use crate::probe::IndexProbe;
use crate::CancelCheck;
use kgrag_common::errors::{AppError, Result};
use kgrag_common::metrics;
use kgrag_common::models::{Inconsistency, InconsistencyType, ItemKind, RepairReport, SyncFlag};
use kgrag_common::store::Conditions;
use kgrag_common::EngineContext;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct ConsistencyAuditor {
    ctx: EngineContext,
    manager: SyncManager,
    probe: IndexProbe,
}

impl ConsistencyAuditor {
    pub fn new(manager: SyncManager) -> Self {
        let ctx = manager.context().clone();
        Self {
            probe: IndexProbe::new(ctx.clone()),
            ctx,
            manager,
        }
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    /// Every divergence between the stores for `scope_id` (all scopes when `None`).
    #[instrument(skip(self))]
    pub async fn check_consistency(&self, scope_id: Option<&str>) -> Result<Vec<Inconsistency>> {
        let mut found = Vec::new();
        for kind in ItemKind::ALL {
            found.extend(self.check_kind(kind, scope_id).await?);
        }
        info!(inconsistencies = found.len(), "Consistency check complete");
        metrics::record_consistency(found.len(), 0);
        Ok(found)
    }

    async fn check_kind(
        &self,
        kind: ItemKind,
        scope_id: Option<&str>,
    ) -> Result<Vec<Inconsistency>> {
        let items = self
            .ctx
            .primary
            .query_by_conditions(kind, &Conditions::scope(scope_id))
            .await?;
        let mut found = Vec::new();

        for item in &items {
            if item.scope().is_none() {
                debug!(kind = %kind, item_id = %item.id, "Item has no scope, skipping");
                continue;
            }
            let indexed = match self.probe.is_indexed(item).await {
                Ok(indexed) => indexed,
                Err(e) => {
                    debug!(
                        kind = %kind,
                        item_id = %item.id,
                        error = %e,
                        "Probe failed, skipping item"
                    );
                    continue;
                }
            };

            let issue = match (indexed, item.sync_flag) {
                (false, _) => Some(InconsistencyType::MissingInIndex),
                (true, SyncFlag::Unsynced | SyncFlag::SyncFailed) => {
                    Some(InconsistencyType::FlagMismatch)
                }
                (true, SyncFlag::Synced) => None,
            };
            if let Some(issue) = issue {
                found.push(Inconsistency {
                    issue,
                    kind,
                    item_id: item.id.clone(),
                    scope_id: item.resolve_scope(scope_id),
                    details: json!({
                        "sync_flag": item.sync_flag,
                        "last_sync_error": item.last_sync_error,
                    }),
                });
            }
        }

        if self.ctx.index.supports_lookup() {
            match self.ctx.index.list_item_ids(kind, scope_id).await {
                Ok(indexed_ids) => {
                    let known: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
                    for id in indexed_ids.into_iter().filter(|id| !known.contains(id.as_str())) {
                        // Confirm against the store; a scoped query may miss re-scoped items.
                        if scope_id.is_some()
                            && self.ctx.primary.get_by_id(kind, &id).await?.is_some()
                        {
                            continue;
                        }
                        let embedding_scope = match self.ctx.index.get_embedding(kind, &id).await {
                            Ok(Some(e)) => Some(e.scope_id),
                            _ => scope_id.map(str::to_string),
                        };
                        found.push(Inconsistency {
                            issue: InconsistencyType::OrphanInIndex,
                            kind,
                            item_id: id,
                            scope_id: embedding_scope,
                            details: json!({}),
                        });
                    }
                }
                Err(e) => warn!(
                    kind = %kind,
                    error = %e,
                    "Could not list index contents, orphan check skipped"
                ),
            }
        } else {
            debug!(kind = %kind, "Index cannot enumerate ids, orphan check skipped");
        }

        Ok(found)
    }

    /// Resolve `inconsistencies`, polling `cancel` between items.
    #[instrument(skip(self, inconsistencies, cancel), fields(count = inconsistencies.len()))]
    pub async fn repair(
        &self,
        inconsistencies: &[Inconsistency],
        cancel: CancelCheck<'_>,
    ) -> RepairReport {
        let mut report = RepairReport::default();
        for inc in inconsistencies {
            if cancel() {
                info!(repaired = report.repaired, "Repair cancelled");
                break;
            }
            match self.repair_one(inc).await {
                Ok(()) => report.repaired += 1,
                Err(e) => {
                    warn!(kind = %inc.kind, item_id = %inc.item_id, error = %e, "Repair failed");
                    report.record_failure(inc.kind, &inc.item_id, e);
                }
            }
        }
        metrics::record_consistency(0, report.repaired);
        info!(repaired = report.repaired, failed = report.failed, "Repair complete");
        report
    }

    async fn repair_one(&self, inc: &Inconsistency) -> Result<()> {
        match inc.issue {
            InconsistencyType::MissingInIndex => {
                let item = self
                    .ctx
                    .primary
                    .get_by_id(inc.kind, &inc.item_id)
                    .await?
                    .ok_or_else(|| AppError::ItemNotFound {
                        kind: inc.kind.to_string(),
                        id: inc.item_id.clone(),
                    })?;
                self.manager.resync(&item).await
            }
            InconsistencyType::OrphanInIndex => {
                let scope = inc.scope_id.as_deref().ok_or_else(|| AppError::MissingField {
                    field: "scope_id".to_string(),
                })?;
                self.manager.delete_now(inc.kind, &inc.item_id, scope).await
            }
            InconsistencyType::FlagMismatch => {
                self.ctx
                    .primary
                    .update_sync_state(inc.kind, &inc.item_id, SyncFlag::Synced, None)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::never_cancel;
    use crate::test_support::{entity, harness, harness_with, relation, topic};
    use kgrag_common::store::memory::MemoryVectorIndex;
    use kgrag_common::{PrimaryStore, VectorIndex};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_synced_item_is_consistent() {
        let h = harness();
        let auditor = ConsistencyAuditor::new(SyncManager::new(h.ctx.clone()));
        let item = entity("e1", "Acme");
        h.primary.upsert(&item).await.unwrap();
        auditor.manager().resync(&item).await.unwrap();

        let found = auditor.check_consistency(Some("org-1")).await.unwrap();
        assert!(found.is_empty(), "unexpected: {:?}", found);
    }

    #[tokio::test]
    async fn test_unscoped_item_is_not_reported() {
        let h = harness();
        let auditor = ConsistencyAuditor::new(SyncManager::new(h.ctx.clone()));
        let mut item = entity("e1", "Acme");
        item.owner_scope_id = None;
        item.organization_id = None;
        h.primary.upsert(&item).await.unwrap();

        for _ in 0..2 {
            let found = assert_ok!(auditor.check_consistency(None).await);
            assert!(found.is_empty(), "unexpected: {:?}", found);
            let report = auditor.repair(&found, &never_cancel).await;
            assert_eq!(report.failed, 0);
        }
    }

    #[tokio::test]
    async fn test_similarity_only_index_consistent_after_sync() {
        let h = harness_with(MemoryVectorIndex::similarity_only());
        let auditor = ConsistencyAuditor::new(SyncManager::new(h.ctx.clone()));
        let item = topic("t1", "Market expansion plan");
        h.primary.upsert(&item).await.unwrap();
        auditor.manager().resync(&item).await.unwrap();

        let found = auditor.check_consistency(None).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_detects_missing_orphan_and_flag_mismatch() {
        let h = harness();
        let manager = SyncManager::new(h.ctx.clone());
        let auditor = ConsistencyAuditor::new(manager.clone());

        let mut missing = entity("e1", "Acme");
        missing.sync_flag = SyncFlag::Synced;
        h.primary.upsert(&missing).await.unwrap();

        let orphan = relation("r-gone", "former partner");
        manager.resync(&orphan).await.unwrap();

        let mismatch = topic("t1", "Hiring");
        h.primary.upsert(&mismatch).await.unwrap();
        manager.resync(&mismatch).await.unwrap();
        h.primary
            .update_sync_state(ItemKind::Topic, "t1", SyncFlag::Unsynced, None)
            .await
            .unwrap();

        let found = auditor.check_consistency(Some("org-1")).await.unwrap();
        let kinds: Vec<_> = found.iter().map(|i| (i.issue, i.item_id.as_str())).collect();
        assert!(kinds.contains(&(InconsistencyType::MissingInIndex, "e1")));
        assert!(kinds.contains(&(InconsistencyType::OrphanInIndex, "r-gone")));
        assert!(kinds.contains(&(InconsistencyType::FlagMismatch, "t1")));

        let report = auditor.repair(&found, &never_cancel).await;
        assert_eq!(report.repaired, 3);
        assert_eq!(report.failed, 0);
        assert!(auditor.check_consistency(Some("org-1")).await.unwrap().is_empty());
        assert!(!h.memory_index.contains(ItemKind::Relation, "r-gone").await);
    }

    #[tokio::test]
    async fn test_repair_convergence_with_one_failure() {
        let h = harness();
        let manager = SyncManager::new(h.ctx.clone());
        let auditor = ConsistencyAuditor::new(manager.clone());

        let mut inconsistencies = Vec::new();
        for i in 0..3 {
            let item = entity(&format!("m{}", i), &format!("Missing {}", i));
            h.primary.upsert(&item).await.unwrap();
            inconsistencies.push(Inconsistency {
                issue: InconsistencyType::MissingInIndex,
                kind: ItemKind::Entity,
                item_id: item.id.clone(),
                scope_id: Some("org-1".into()),
                details: json!({}),
            });
        }
        for i in 0..3 {
            let orphan = entity(&format!("o{}", i), &format!("Orphan {}", i));
            manager.resync(&orphan).await.unwrap();
            inconsistencies.push(Inconsistency {
                issue: InconsistencyType::OrphanInIndex,
                kind: ItemKind::Entity,
                item_id: orphan.id.clone(),
                scope_id: Some("org-1".into()),
                details: json!({}),
            });
        }

        h.index.fail_upsert_for("m1");
        let report = auditor.repair(&inconsistencies, &never_cancel).await;
        assert_eq!(report.repaired, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].item_id, "m1");

        assert!(h.memory_index.contains(ItemKind::Entity, "m0").await);
        assert!(!h.memory_index.contains(ItemKind::Entity, "o2").await);
    }

    #[tokio::test]
    async fn test_repair_honours_cancellation() {
        let h = harness();
        let auditor = ConsistencyAuditor::new(SyncManager::new(h.ctx.clone()));
        let incs = vec![Inconsistency {
            issue: InconsistencyType::FlagMismatch,
            kind: ItemKind::Topic,
            item_id: "t1".into(),
            scope_id: None,
            details: json!({}),
        }];
        let report = auditor.repair(&incs, &|| true).await;
        assert_eq!(report, RepairReport::default());
        assert_eq!(h.index.get_embedding(ItemKind::Topic, "t1").await.unwrap(), None);
    }
}
