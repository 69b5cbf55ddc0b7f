//! Bulk embedding regeneration for a whole scope
//!
//! Items are regenerated with a bounded pool, throttled to the policy's
//! rate limit, in batches of the policy's batch size.

use crate::manager::SyncManager;
use crate::CancelCheck;
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use kgrag_common::errors::Result;
use kgrag_common::models::{ItemKind, KnowledgeItem, SyncFlag};
use kgrag_common::notification::Notification;
use kgrag_common::store::Conditions;
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Concurrent regenerations in flight
const POOL_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BulkProgress {
    pub kind: ItemKind,
    pub current: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct KindTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BulkReport {
    pub per_kind: BTreeMap<ItemKind, KindTally>,
    pub cancelled: bool,
}

impl BulkReport {
    pub fn total(&self) -> KindTally {
        self.per_kind.values().fold(KindTally::default(), |acc, t| KindTally {
            succeeded: acc.succeeded + t.succeeded,
            failed: acc.failed + t.failed,
            skipped: acc.skipped + t.skipped,
        })
    }
}

#[derive(Clone)]
pub struct BulkRegenerator {
    manager: SyncManager,
}

impl BulkRegenerator {
    pub fn new(manager: SyncManager) -> Self {
        Self { manager }
    }

    #[instrument(skip(self, cancel, on_progress))]
    pub async fn regenerate_scope(
        &self,
        scope_id: &str,
        kinds: &[ItemKind],
        force: bool,
        cancel: CancelCheck<'_>,
        on_progress: &(dyn Fn(BulkProgress) + Send + Sync),
    ) -> Result<BulkReport> {
        let policy = self.manager.context().policy.get();
        let quota =
            Quota::per_second(NonZeroU32::new(policy.rate_limit).unwrap_or(NonZeroU32::MIN));
        let limiter = Arc::new(RateLimiter::direct(quota));
        let batch_size = policy.batch_size.max(1);

        let mut report = BulkReport::default();
        for &kind in kinds {
            if cancel() {
                report.cancelled = true;
                break;
            }
            let tally = self
                .regenerate_kind(kind, scope_id, force, batch_size, &limiter, cancel, on_progress)
                .await?;
            report.per_kind.insert(kind, tally.0);
            if tally.1 {
                report.cancelled = true;
                break;
            }
        }

        let total = report.total();
        info!(
            succeeded = total.succeeded,
            failed = total.failed,
            skipped = total.skipped,
            cancelled = report.cancelled,
            "Bulk regeneration finished"
        );
        let message = format!(
            "Embedding regeneration for {}: {} succeeded, {} failed, {} skipped{}",
            scope_id,
            total.succeeded,
            total.failed,
            total.skipped,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        self.manager.notify(if total.failed > 0 {
            Notification::warning(message)
        } else {
            Notification::info(message)
        });

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn regenerate_kind(
        &self,
        kind: ItemKind,
        scope_id: &str,
        force: bool,
        batch_size: usize,
        limiter: &Arc<DefaultDirectRateLimiter>,
        cancel: CancelCheck<'_>,
        on_progress: &(dyn Fn(BulkProgress) + Send + Sync),
    ) -> Result<(KindTally, bool)> {
        let items = self
            .manager
            .context()
            .primary
            .query_by_conditions(kind, &Conditions::scope(Some(scope_id)))
            .await?;

        let (pending, already): (Vec<KnowledgeItem>, Vec<KnowledgeItem>) = items
            .into_iter()
            .partition(|item| force || item.sync_flag != SyncFlag::Synced);

        let mut tally = KindTally {
            skipped: already.len(),
            ..Default::default()
        };
        let total = pending.len();
        let mut current = 0;
        let mut cancelled = false;

        for batch in pending.chunks(batch_size) {
            let jobs: Vec<_> = batch
                .iter()
                .cloned()
                .map(|item| {
                    let manager = self.manager.clone();
                    let limiter = Arc::clone(limiter);
                    async move {
                        if cancel() {
                            return None;
                        }
                        limiter.until_ready().await;
                        Some(manager.resync(&item).await)
                    }
                })
                .collect();
            let outcomes: Vec<Option<Result<()>>> =
                stream::iter(jobs).buffer_unordered(POOL_SIZE).collect().await;

            for outcome in outcomes {
                match outcome {
                    Some(Ok(())) => tally.succeeded += 1,
                    Some(Err(e)) => {
                        warn!(kind = %kind, error = %e, "Regeneration failed");
                        tally.failed += 1;
                    }
                    None => {
                        cancelled = true;
                        continue;
                    }
                }
                current += 1;
                on_progress(BulkProgress {
                    kind,
                    current,
                    total,
                    succeeded: tally.succeeded,
                    failed: tally.failed,
                });
            }

            if cancelled || cancel() {
                cancelled = true;
                break;
            }
        }

        Ok((tally, cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::never_cancel;
    use crate::test_support::{entity, harness, topic};
    use kgrag_common::notification::NotificationType;
    use kgrag_common::PrimaryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_regenerates_unsynced_and_skips_synced() {
        let h = harness();
        for i in 0..4 {
            h.primary.upsert(&entity(&format!("e{}", i), &format!("Co {}", i))).await.unwrap();
        }
        let mut done = topic("t1", "Roadmap");
        done.sync_flag = SyncFlag::Synced;
        h.primary.upsert(&done).await.unwrap();
        h.index.fail_upsert_for("e2");

        let progress = Mutex::new(Vec::new());
        let regen = BulkRegenerator::new(SyncManager::new(h.ctx.clone()));
        let report = regen
            .regenerate_scope(
                "org-1",
                &ItemKind::ALL,
                false,
                &never_cancel,
                &|p: BulkProgress| progress.lock().unwrap().push(p),
            )
            .await
            .unwrap();

        assert_eq!(
            report.per_kind[&ItemKind::Entity],
            KindTally { succeeded: 3, failed: 1, skipped: 0 }
        );
        assert_eq!(
            report.per_kind[&ItemKind::Topic],
            KindTally { succeeded: 0, failed: 0, skipped: 1 }
        );
        assert!(!report.cancelled);

        let progress = progress.into_inner().unwrap();
        assert_eq!(progress.len(), 4);
        let last = progress.last().unwrap();
        assert_eq!((last.current, last.total, last.failed), (4, 4, 1));

        let e0 = h.primary.get_by_id(ItemKind::Entity, "e0").await.unwrap().unwrap();
        assert_eq!(e0.sync_flag, SyncFlag::Synced);
        // One failure notice for e2, then the summary
        let notes = h.sink.take();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].kind, NotificationType::Warning);
    }

    #[tokio::test]
    async fn test_force_includes_synced_items() {
        let h = harness();
        let mut done = topic("t1", "Roadmap");
        done.sync_flag = SyncFlag::Synced;
        h.primary.upsert(&done).await.unwrap();

        let regen = BulkRegenerator::new(SyncManager::new(h.ctx.clone()));
        let report = regen
            .regenerate_scope(
                "org-1",
                &[ItemKind::Topic],
                true,
                &never_cancel,
                &|_: BulkProgress| {},
            )
            .await
            .unwrap();
        assert_eq!(report.per_kind[&ItemKind::Topic].succeeded, 1);
        assert!(h.memory_index.contains(ItemKind::Topic, "t1").await);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_items() {
        let h = harness();
        for i in 0..30 {
            h.primary.upsert(&entity(&format!("e{}", i), &format!("Co {}", i))).await.unwrap();
        }

        let polls = AtomicUsize::new(0);
        let cancel = || polls.fetch_add(1, Ordering::SeqCst) >= 3;
        let regen = BulkRegenerator::new(SyncManager::new(h.ctx.clone()));
        let report = regen
            .regenerate_scope("org-1", &[ItemKind::Entity], false, &cancel, &|_: BulkProgress| {})
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.total().succeeded < 30);
    }
}
