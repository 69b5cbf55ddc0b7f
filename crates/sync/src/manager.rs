//! Dual-store sync manager
//!
//! Mutation call sites hand every created, updated or deleted item to the
//! [`SyncManager`]. Sync is subordinate to the primary-store mutation: it
//! never blocks, rolls back or retries that mutation. Outcomes flow through
//! the notification sink.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use kgrag_common::errors::{AppError, Result};
use kgrag_common::metrics;
use kgrag_common::models::{has_relevant_changes, Embedding, ItemKind, KnowledgeItem, SyncFlag};
use kgrag_common::notification::{LogSink, Notification, NotificationSink, RetryAction};
use kgrag_common::policy::SyncPolicy;
use kgrag_common::retry::with_retry_notify;
use kgrag_common::EngineContext;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    MissingScope,
    NoRelevantChanges,
}

/// What a sync call did. `Pending` is a detached task the caller may await.
#[derive(Debug)]
pub enum SyncTicket {
    Skipped(SkipReason),
    Completed,
    /// The vector-index side failed; the primary-store mutation stands.
    Failed(AppError),
    Pending(JoinHandle<Result<()>>),
}

impl SyncTicket {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncTicket::Skipped(_))
    }

    /// Wait for a detached sync, surfacing its error.
    pub async fn wait(self) -> Result<()> {
        match self {
            SyncTicket::Skipped(_) | SyncTicket::Completed => Ok(()),
            SyncTicket::Failed(e) => Err(e),
            SyncTicket::Pending(handle) => handle.await.map_err(|e| AppError::Internal {
                message: format!("sync task aborted: {}", e),
            })?,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertOptions<'a> {
    /// State before the mutation, for change detection
    pub previous: Option<&'a KnowledgeItem>,
    /// Fields touched by the mutation, for change detection
    pub updated_fields: Option<&'a [String]>,
    /// Overrides the item's own scope
    pub scope_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct SyncManager {
    ctx: EngineContext,
}

impl SyncManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Write the item's embedding to the vector index if anything
    /// embedding-relevant changed.
    #[instrument(skip(self, item, options), fields(kind = %item.kind(), item_id = %item.id))]
    pub async fn sync_upsert(
        &self,
        item: &KnowledgeItem,
        options: UpsertOptions<'_>,
    ) -> Result<SyncTicket> {
        let policy = self.ctx.policy.get();
        if !policy.enabled {
            debug!("Sync disabled, skipping upsert");
            return Ok(SyncTicket::Skipped(SkipReason::Disabled));
        }

        let Some(scope) = item.resolve_scope(options.scope_id) else {
            debug!("Item has no scope, skipping upsert");
            return Ok(SyncTicket::Skipped(SkipReason::MissingScope));
        };

        if !has_relevant_changes(options.previous, item, options.updated_fields) {
            debug!("No embedding-relevant changes");
            metrics::record_sync(item.kind().as_str(), "skipped");
            return Ok(SyncTicket::Skipped(SkipReason::NoRelevantChanges));
        }

        if policy.async_mode {
            let manager = self.clone();
            let item = item.clone();
            let handle = tokio::spawn(
                async move { manager.execute_upsert(&item, &scope, true).await }.in_current_span(),
            );
            return Ok(SyncTicket::Pending(handle));
        }

        self.execute_upsert(item, &scope, true).await?;
        Ok(SyncTicket::Completed)
    }

    /// Remove the item's embedding. Failures are reported, never raised.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn sync_delete(
        &self,
        kind: ItemKind,
        item_id: &str,
        scope_id: Option<&str>,
    ) -> Result<SyncTicket> {
        let policy = self.ctx.policy.get();
        if !policy.enabled {
            debug!("Sync disabled, skipping delete");
            return Ok(SyncTicket::Skipped(SkipReason::Disabled));
        }
        let Some(scope) = scope_id.filter(|s| !s.is_empty()).map(str::to_string) else {
            debug!("No scope given, skipping delete");
            return Ok(SyncTicket::Skipped(SkipReason::MissingScope));
        };

        if policy.async_mode {
            let manager = self.clone();
            let item_id = item_id.to_string();
            let handle = tokio::spawn(
                async move { manager.execute_delete(kind, &item_id, &scope).await }
                    .in_current_span(),
            );
            return Ok(SyncTicket::Pending(handle));
        }

        match self.execute_delete(kind, item_id, &scope).await {
            Ok(()) => Ok(SyncTicket::Completed),
            Err(e) => Ok(SyncTicket::Failed(e)),
        }
    }

    /// Regenerate immediately under the item's own scope, without
    /// announcing success. Used by repair and bulk regeneration.
    pub async fn resync(&self, item: &KnowledgeItem) -> Result<()> {
        let scope = item.scope().ok_or_else(|| AppError::Validation {
            message: format!("{} {} has no scope", item.kind(), item.id),
            field: Some("owner_scope_id".to_string()),
        })?;
        self.execute_upsert(item, &scope, false).await
    }

    /// Delete immediately; an unsupported delete counts as success.
    pub async fn delete_now(&self, kind: ItemKind, item_id: &str, scope_id: &str) -> Result<()> {
        self.execute_delete(kind, item_id, scope_id).await
    }

    pub fn build_embedding(
        &self,
        item: &KnowledgeItem,
        scope: &str,
        vector: Vec<f32>,
    ) -> Embedding {
        let model = self.ctx.embedder.model_name().to_string();
        let version = self.ctx.config.embedding.version.clone();
        Embedding {
            item_id: item.id.clone(),
            kind: item.kind(),
            scope_id: scope.to_string(),
            vector,
            metadata: json!({
                "kind": item.kind(),
                "name": item.display_name(),
                "model": model,
                "version": version,
            }),
            model,
            version,
            generated_at: Utc::now(),
        }
    }

    async fn execute_upsert(
        &self,
        item: &KnowledgeItem,
        scope: &str,
        announce: bool,
    ) -> Result<()> {
        let policy = self.ctx.policy.get();
        let kind = item.kind();

        match self.write_embedding(item, scope, &policy).await {
            Ok(()) => {
                if let Err(e) = self
                    .ctx
                    .primary
                    .update_sync_state(kind, &item.id, SyncFlag::Synced, None)
                    .await
                {
                    warn!(
                        kind = %kind,
                        item_id = %item.id,
                        error = %e,
                        "Embedding stored but sync flag not updated"
                    );
                }
                metrics::record_sync(kind.as_str(), "synced");
                if announce {
                    self.notify(
                        Notification::success(format!("{} '{}' synced", kind, item.display_name()))
                            .for_item(kind, &item.id),
                    );
                } else {
                    debug!(kind = %kind, item_id = %item.id, "Embedding regenerated");
                }
                Ok(())
            }
            Err(e) => {
                let rag_kind = e.rag_kind();
                error!(
                    kind = %kind,
                    item_id = %item.id,
                    scope_id = scope,
                    error_kind = rag_kind.as_str(),
                    error = %e,
                    "Vector index sync failed"
                );
                if let Err(flag_err) = self
                    .ctx
                    .primary
                    .update_sync_state(kind, &item.id, SyncFlag::SyncFailed, Some(e.to_string()))
                    .await
                {
                    warn!(
                        kind = %kind,
                        item_id = %item.id,
                        error = %flag_err,
                        "Failed to record sync failure"
                    );
                }
                metrics::record_sync(kind.as_str(), "failed");

                let mut notification = Notification::error(format!(
                    "Failed to sync {} '{}': {}",
                    kind,
                    item.display_name(),
                    rag_kind.user_message()
                ))
                .for_item(kind, &item.id);
                if rag_kind.is_retryable() {
                    notification = notification
                        .with_retry(self.upsert_retry(item.clone(), scope.to_string()));
                }
                self.notify(notification);
                Err(e)
            }
        }
    }

    async fn write_embedding(
        &self,
        item: &KnowledgeItem,
        scope: &str,
        policy: &SyncPolicy,
    ) -> Result<()> {
        let text = (item.strategy().embedding_text)(&item.payload);
        if text.trim().is_empty() {
            return Err(AppError::Validation {
                message: format!("{} {} has no embeddable text", item.kind(), item.id),
                field: None,
            });
        }

        let attempt = || self.embed_and_store(item, scope, &text);
        if policy.retry_on_failure {
            with_retry_notify(attempt, policy.max_retries, policy.retry_delay_base(), |a| {
                debug!(attempt = a.attempt, max_retries = a.max_retries, "Retrying embedding sync")
            })
            .await
        } else {
            attempt().await
        }
    }

    async fn embed_and_store(&self, item: &KnowledgeItem, scope: &str, text: &str) -> Result<()> {
        let vector = self.ctx.embedder.embed(text).await?;
        let embedding = self.build_embedding(item, scope, vector);
        if !embedding.is_valid() {
            return Err(AppError::EmbeddingError {
                message: format!("embedding generation returned an invalid vector for {}", item.id),
            });
        }
        self.ctx.index.upsert_embedding(&embedding).await
    }

    async fn execute_delete(&self, kind: ItemKind, item_id: &str, scope: &str) -> Result<()> {
        let policy = self.ctx.policy.get();
        let attempt = move || async move {
            match self.ctx.index.delete_embedding(kind, item_id, scope).await {
                Err(e) if e.is_unsupported_operation() => {
                    warn!(
                        kind = %kind,
                        item_id,
                        error = %e,
                        "Vector index does not support delete, treating as done"
                    );
                    Ok(())
                }
                other => other,
            }
        };

        let result = if policy.retry_on_failure {
            with_retry_notify(attempt, policy.max_retries, policy.retry_delay_base(), |a| {
                debug!(attempt = a.attempt, "Retrying embedding delete")
            })
            .await
        } else {
            attempt().await
        };

        match result {
            Ok(()) => {
                metrics::record_sync(kind.as_str(), "deleted");
                info!(kind = %kind, item_id, scope_id = scope, "Embedding removed");
                Ok(())
            }
            Err(e) => {
                let rag_kind = e.rag_kind();
                error!(
                    kind = %kind,
                    item_id,
                    scope_id = scope,
                    error = %e,
                    "Vector index delete failed"
                );
                metrics::record_sync(kind.as_str(), "delete_failed");

                let mut notification = Notification::error(format!(
                    "Failed to remove {} {} from the vector index: {}",
                    kind,
                    item_id,
                    rag_kind.user_message()
                ))
                .for_item(kind, item_id);
                if rag_kind.is_retryable() {
                    notification =
                        notification.with_retry(self.delete_retry(
                            kind,
                            item_id.to_string(),
                            scope.to_string(),
                        ));
                }
                self.notify(notification);
                Err(e)
            }
        }
    }

    fn upsert_retry(&self, item: KnowledgeItem, scope: String) -> RetryAction {
        let manager = self.clone();
        RetryAction::new("Retry sync", move || {
            manager.clone().retry_upsert(item.clone(), scope.clone())
        })
    }

    fn retry_upsert(self, item: KnowledgeItem, scope: String) -> BoxFuture<'static, Result<()>> {
        async move {
            let current = self
                .ctx
                .primary
                .get_by_id(item.kind(), &item.id)
                .await?
                .unwrap_or(item);
            self.execute_upsert(&current, &scope, true).await
        }
        .boxed()
    }

    fn delete_retry(&self, kind: ItemKind, item_id: String, scope: String) -> RetryAction {
        let manager = self.clone();
        RetryAction::new("Retry delete", move || {
            manager.clone().retry_delete(kind, item_id.clone(), scope.clone())
        })
    }

    fn retry_delete(
        self,
        kind: ItemKind,
        item_id: String,
        scope: String,
    ) -> BoxFuture<'static, Result<()>> {
        async move { self.execute_delete(kind, &item_id, &scope).await }.boxed()
    }

    pub(crate) fn notify(&self, notification: Notification) {
        if self.ctx.policy.get().notifications_enabled {
            self.ctx.notifier.receive(notification);
        } else {
            LogSink.receive(notification);
        }
    }
}
