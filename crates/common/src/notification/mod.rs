//! Sync outcome notifications
//!
//! Components never talk to a UI directly; they hand a [`Notification`] to
//! the injected [`NotificationSink`]. [`LogSink`] is the default.

use crate::errors::Result;
use crate::models::ItemKind;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Success,
    Info,
    Warning,
    Error,
}

type RetryFn = dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Callable bound to the failed operation, re-running it on demand.
#[derive(Clone)]
pub struct RetryAction {
    pub label: String,
    run: Arc<RetryFn>,
}

impl RetryAction {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            run: Arc::new(run),
        }
    }

    pub async fn run(&self) -> Result<()> {
        (self.run)().await
    }
}

impl fmt::Debug for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAction").field("label", &self.label).finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<(ItemKind, String)>,
    #[serde(skip)]
    pub retry: Option<RetryAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            item: None,
            retry: None,
            created_at: Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationType::Success, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationType::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationType::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationType::Error, message)
    }

    pub fn for_item(mut self, kind: ItemKind, id: impl Into<String>) -> Self {
        self.item = Some((kind, id.into()));
        self
    }

    pub fn with_retry(mut self, retry: RetryAction) -> Self {
        self.retry = Some(retry);
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn receive(&self, notification: Notification);
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn receive(&self, n: Notification) {
        let (kind, id) = match &n.item {
            Some((kind, id)) => (Some(kind.as_str()), Some(id.as_str())),
            None => (None, None),
        };
        let retryable = n.retry.is_some();
        match n.kind {
            NotificationType::Success | NotificationType::Info => {
                info!(kind = ?kind, item_id = ?id, "{}", n.message)
            }
            NotificationType::Warning => {
                warn!(kind = ?kind, item_id = ?id, retryable, "{}", n.message)
            }
            NotificationType::Error => {
                error!(kind = ?kind, item_id = ?id, retryable, "{}", n.message)
            }
        }
    }
}

/// Keeps every notification in memory. Useful for tests and for surfacing
/// recent outcomes through an API.
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        match self.received.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn take(&self) -> Vec<Notification> {
        match self.received.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl NotificationSink for CollectingSink {
    fn receive(&self, notification: Notification) {
        if let Ok(mut guard) = self.received.lock() {
            guard.push(notification);
        }
    }
}
