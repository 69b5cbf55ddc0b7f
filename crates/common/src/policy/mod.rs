//! Sync policy
//!
//! One [`PolicyStore`] is built at startup from configuration merged with the
//! persisted settings, then shared by every component. Reads are lock-free
//! snapshots; writes persist to the settings store and wake subscribers.

use crate::errors::{AppError, Result};
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Settings key the policy is persisted under
pub const SETTINGS_KEY: &str = "kgrag_sync_policy";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncPolicy {
    pub enabled: bool,
    /// Run sync detached from the mutation that triggered it
    pub async_mode: bool,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay_base_ms: u64,
    pub batch_size: usize,
    /// Items per second during bulk regeneration
    pub rate_limit: u32,
    pub consistency_check_enabled: bool,
    pub consistency_interval_ms: u64,
    pub notifications_enabled: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            async_mode: true,
            retry_on_failure: true,
            max_retries: 3,
            retry_delay_base_ms: 1000,
            batch_size: 10,
            rate_limit: 10,
            consistency_check_enabled: false,
            consistency_interval_ms: 3_600_000,
            notifications_enabled: true,
        }
    }
}

impl SyncPolicy {
    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_millis(self.consistency_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries > 10 {
            return Err(AppError::Validation {
                message: "max_retries must be at most 10".to_string(),
                field: Some("max_retries".to_string()),
            });
        }
        if self.batch_size == 0 {
            return Err(AppError::Validation {
                message: "batch_size must be positive".to_string(),
                field: Some("batch_size".to_string()),
            });
        }
        if self.rate_limit == 0 {
            return Err(AppError::Validation {
                message: "rate_limit must be positive".to_string(),
                field: Some("rate_limit".to_string()),
            });
        }
        if self.consistency_interval_ms < 1000 {
            return Err(AppError::Validation {
                message: "consistency_interval_ms must be at least 1000".to_string(),
                field: Some("consistency_interval_ms".to_string()),
            });
        }
        Ok(())
    }
}

/// Partial update from the settings API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPolicyPatch {
    pub enabled: Option<bool>,
    pub async_mode: Option<bool>,
    pub retry_on_failure: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_base_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub rate_limit: Option<u32>,
    pub consistency_check_enabled: Option<bool>,
    pub consistency_interval_ms: Option<u64>,
    pub notifications_enabled: Option<bool>,
}

impl SyncPolicyPatch {
    pub fn apply(&self, policy: &mut SyncPolicy) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { policy.$field = v; })*
            };
        }
        take!(
            enabled,
            async_mode,
            retry_on_failure,
            max_retries,
            retry_delay_base_ms,
            batch_size,
            rate_limit,
            consistency_check_enabled,
            consistency_interval_ms,
            notifications_enabled
        );
    }
}

pub struct PolicyStore {
    current: watch::Sender<SyncPolicy>,
    settings: Arc<dyn KvStore>,
}

impl PolicyStore {
    pub fn new(initial: SyncPolicy, settings: Arc<dyn KvStore>) -> Self {
        let (current, _) = watch::channel(initial);
        Self { current, settings }
    }

    /// Build from `defaults` overlaid with whatever was persisted.
    /// Unreadable persisted settings are logged and ignored.
    pub async fn load(defaults: SyncPolicy, settings: Arc<dyn KvStore>) -> Result<Self> {
        let policy = match settings.get(SETTINGS_KEY).await? {
            Some(raw) => match merge_persisted(&defaults, &raw) {
                Ok(policy) => {
                    info!("Loaded persisted sync policy");
                    policy
                }
                Err(e) => {
                    warn!(error = %e, "Persisted sync policy unreadable, using defaults");
                    defaults
                }
            },
            None => defaults,
        };
        Ok(Self::new(policy, settings))
    }

    /// Current policy snapshot.
    pub fn get(&self) -> SyncPolicy {
        self.current.borrow().clone()
    }

    /// Receiver that observes every policy change.
    pub fn subscribe(&self) -> watch::Receiver<SyncPolicy> {
        self.current.subscribe()
    }

    pub async fn update(&self, patch: &SyncPolicyPatch) -> Result<SyncPolicy> {
        let mut next = self.get();
        patch.apply(&mut next);
        self.replace(next.clone()).await?;
        Ok(next)
    }

    pub async fn replace(&self, policy: SyncPolicy) -> Result<()> {
        policy.validate()?;
        let raw = serde_json::to_string(&policy)?;
        self.settings
            .set(SETTINGS_KEY, &raw)
            .await
            .map_err(|e| AppError::SettingsError {
                message: format!("Failed to persist sync policy: {}", e),
            })?;
        self.current.send_replace(policy);
        info!("Sync policy updated");
        Ok(())
    }
}

fn merge_persisted(defaults: &SyncPolicy, raw: &str) -> Result<SyncPolicy> {
    let persisted: serde_json::Value = serde_json::from_str(raw)?;
    let mut merged = serde_json::to_value(defaults)?;
    if let (Some(base), Some(overlay)) = (merged.as_object_mut(), persisted.as_object()) {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }
    Ok(serde_json::from_value(merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKvStore;

    #[tokio::test]
    async fn test_load_merges_persisted_over_defaults() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(SETTINGS_KEY, r#"{"async_mode": false, "max_retries": 5}"#)
            .await
            .unwrap();

        let store = PolicyStore::load(SyncPolicy::default(), kv).await.unwrap();
        let policy = store.get();
        assert!(!policy.async_mode);
        assert_eq!(policy.max_retries, 5);
        assert!(policy.enabled);
    }

    #[tokio::test]
    async fn test_corrupt_settings_fall_back() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(SETTINGS_KEY, "not json").await.unwrap();
        let store = PolicyStore::load(SyncPolicy::default(), kv).await.unwrap();
        assert_eq!(store.get(), SyncPolicy::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_notifies() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = PolicyStore::new(SyncPolicy::default(), kv.clone());
        let mut rx = store.subscribe();

        let patch = SyncPolicyPatch {
            consistency_check_enabled: Some(true),
            ..Default::default()
        };
        store.update(&patch).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().consistency_check_enabled);
        let raw = kv.get(SETTINGS_KEY).await.unwrap().unwrap();
        assert!(raw.contains("\"consistency_check_enabled\":true"));
    }

    #[tokio::test]
    async fn test_invalid_update_rejected() {
        let store = PolicyStore::new(SyncPolicy::default(), Arc::new(MemoryKvStore::new()));
        let patch = SyncPolicyPatch {
            max_retries: Some(50),
            ..Default::default()
        };
        assert!(store.update(&patch).await.is_err());
        assert_eq!(store.get().max_retries, 3);
    }
}
