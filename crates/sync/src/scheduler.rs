//! Periodic consistency audit
//!
//! One recurring task per scheduler. Starting again replaces the running
//! task; the interval follows policy changes without a restart.

use crate::auditor::ConsistencyAuditor;
use crate::never_cancel;
use kgrag_common::errors::Result;
use kgrag_common::notification::Notification;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, Instrument};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TickSummary {
    pub found: usize,
    pub repaired: usize,
    pub failed: usize,
}

pub struct ConsistencyScheduler {
    auditor: ConsistencyAuditor,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsistencyScheduler {
    pub fn new(auditor: ConsistencyAuditor) -> Self {
        Self {
            auditor,
            task: Mutex::new(None),
        }
    }

    /// Start the recurring audit for `scope_id`, cancelling any previous schedule.
    pub fn start(&self, scope_id: Option<String>) {
        let auditor = self.auditor.clone();
        let span = tracing::info_span!("consistency_scheduler", scope_id = ?scope_id);
        let handle = tokio::spawn(run_schedule(auditor, scope_id).instrument(span));

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.replace(handle) {
            debug!("Replacing running consistency schedule");
            previous.abort();
        }
    }

    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Consistency schedule stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// One audit cycle outside the schedule.
    pub async fn run_once(&self, scope_id: Option<&str>) -> Result<TickSummary> {
        tick(&self.auditor, scope_id).await
    }
}

impl Drop for ConsistencyScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_schedule(auditor: ConsistencyAuditor, scope_id: Option<String>) {
    let mut policy_rx = auditor.manager().context().policy.subscribe();
    let mut period = period_of(policy_rx.borrow_and_update().consistency_interval());
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = period.as_millis() as u64, "Consistency schedule started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !auditor.manager().context().policy.get().consistency_check_enabled {
                    debug!("Consistency check disabled, skipping tick");
                    continue;
                }
                if let Err(e) = tick(&auditor, scope_id.as_deref()).await {
                    error!(error = %e, "Scheduled consistency check failed");
                }
            }
            changed = policy_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = period_of(policy_rx.borrow_and_update().consistency_interval());
                if next != period {
                    info!(interval_ms = next.as_millis() as u64, "Consistency interval changed");
                    period = next;
                    ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
            }
        }
    }
}

fn period_of(interval: Duration) -> Duration {
    interval.max(Duration::from_secs(1))
}

async fn tick(auditor: &ConsistencyAuditor, scope_id: Option<&str>) -> Result<TickSummary> {
    let found = auditor.check_consistency(scope_id).await?;
    let report = auditor.repair(&found, &never_cancel).await;
    let summary = TickSummary {
        found: found.len(),
        repaired: report.repaired,
        failed: report.failed,
    };

    let notification = if summary.found == 0 {
        Notification::info("Consistency check: stores are in agreement")
    } else if summary.failed > 0 {
        Notification::warning(format!(
            "Consistency check: {} inconsistencies, {} repaired, {} failed",
            summary.found, summary.repaired, summary.failed
        ))
    } else {
        Notification::success(format!(
            "Consistency check: repaired {} inconsistencies",
            summary.repaired
        ))
    };
    auditor.manager().notify(notification);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SyncManager;
    use crate::test_support::{entity, harness, Harness};
    use kgrag_common::models::ItemKind;
    use kgrag_common::notification::NotificationType;
    use kgrag_common::PrimaryStore;

    fn scheduler(h: &Harness) -> ConsistencyScheduler {
        ConsistencyScheduler::new(ConsistencyAuditor::new(SyncManager::new(h.ctx.clone())))
    }

    async fn enable(h: &Harness, enabled: bool) {
        let mut policy = h.ctx.policy.get();
        policy.consistency_check_enabled = enabled;
        policy.consistency_interval_ms = 1000;
        h.ctx.policy.replace(policy).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_once_repairs_and_summarises() {
        let h = harness();
        h.primary.upsert(&entity("e1", "Acme")).await.unwrap();

        let summary = scheduler(&h).run_once(Some("org-1")).await.unwrap();
        assert_eq!(summary, TickSummary { found: 1, repaired: 1, failed: 0 });
        assert!(h.memory_index.contains(ItemKind::Entity, "e1").await);

        let notes = h.sink.take();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationType::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_tick_runs_audit() {
        let h = harness();
        enable(&h, true).await;
        h.primary.upsert(&entity("e1", "Acme")).await.unwrap();

        let scheduler = scheduler(&h);
        scheduler.start(None);
        assert!(scheduler.is_running());

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !h.sink.snapshot().is_empty() {
                break;
            }
        }
        assert!(h.memory_index.contains(ItemKind::Entity, "e1").await);
        assert!(!h.sink.snapshot().is_empty());

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_skips_ticks() {
        let h = harness();
        enable(&h, false).await;
        h.primary.upsert(&entity("e1", "Acme")).await.unwrap();

        let scheduler = scheduler(&h);
        scheduler.start(Some("org-1".into()));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(h.sink.snapshot().is_empty());
        assert!(!h.memory_index.contains(ItemKind::Entity, "e1").await);
    }

    #[tokio::test]
    async fn test_restart_replaces_schedule() {
        let h = harness();
        let scheduler = scheduler(&h);
        scheduler.start(None);
        scheduler.start(Some("org-1".into()));
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
