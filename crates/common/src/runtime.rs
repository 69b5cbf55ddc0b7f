//! Process-wide engine context
//!
//! Everything that would otherwise be a global (policy, stores, embedder,
//! notification sink) is built once here and passed to each component.

use crate::config::AppConfig;
use crate::db::{DbPool, PgPrimaryStore, PgVectorIndex};
use crate::embeddings::{create_embedder, Embedder, MockEmbedder};
use crate::errors::{AppError, Result};
use crate::kv::RedisKvStore;
use crate::notification::{LogSink, NotificationSink};
use crate::policy::PolicyStore;
use crate::store::memory::{MemoryKvStore, MemoryPrimaryStore, MemoryVectorIndex};
use crate::store::{KvStore, PrimaryStore, VectorIndex};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub policy: Arc<PolicyStore>,
    pub primary: Arc<dyn PrimaryStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    /// Settings persistence and persistent cache tier
    pub settings: Arc<dyn KvStore>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl EngineContext {
    /// Fully in-process context with a deterministic embedder.
    pub fn in_memory(config: AppConfig) -> Self {
        let settings: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let policy = PolicyStore::new(config.sync.clone(), settings.clone());
        let dimension = config.embedding.dimension;
        Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            primary: Arc::new(MemoryPrimaryStore::new()),
            index: Arc::new(MemoryVectorIndex::new()),
            embedder: Arc::new(MockEmbedder::new(dimension)),
            settings,
            notifier: Arc::new(LogSink),
        }
    }

    /// Build from configuration: Postgres when `database.url` is set,
    /// Redis when `redis.url` is set, in-memory otherwise.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;

        let (primary, index): (Arc<dyn PrimaryStore>, Arc<dyn VectorIndex>) =
            match config.database.url.as_deref() {
                Some(url) => {
                    let pool =
                        with_startup_retry("postgres", || DbPool::connect(url, &config.database))
                            .await?;
                    if config.database.ensure_schema {
                        pool.ensure_schema(embedder.dimension()).await?;
                    }
                    (
                        Arc::new(PgPrimaryStore::new(pool.clone())),
                        Arc::new(PgVectorIndex::new(&pool)),
                    )
                }
                None => {
                    warn!("No database URL configured, using in-memory stores");
                    (
                        Arc::new(MemoryPrimaryStore::new()),
                        Arc::new(MemoryVectorIndex::new()),
                    )
                }
            };

        let settings: Arc<dyn KvStore> = match config.redis.url.as_deref() {
            Some(url) => Arc::new(
                with_startup_retry("redis", || {
                    RedisKvStore::connect(url, &config.redis.key_namespace)
                })
                .await?,
            ),
            None => {
                warn!("No Redis URL configured, using in-memory key/value store");
                Arc::new(MemoryKvStore::new())
            }
        };

        let policy = PolicyStore::load(config.sync.clone(), settings.clone()).await?;
        info!(
            embedder = embedder.model_name(),
            lookup = index.supports_lookup(),
            "Engine context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            primary,
            index,
            embedder,
            settings,
            notifier: Arc::new(LogSink),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_stores(
        mut self,
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        self.primary = primary;
        self.index = index;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }
}

/// Retry a startup connection with exponential backoff for up to a minute.
async fn with_startup_retry<T, F, Fut>(name: &str, connect: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let connect = &connect;
    backoff::future::retry(policy, move || async move {
        connect().await.map_err(|e| match e {
            AppError::Configuration { .. } => backoff::Error::permanent(e),
            other => {
                warn!(service = name, error = %other, "Connection failed, retrying");
                backoff::Error::transient(other)
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityPayload, ItemKind, ItemPayload, KnowledgeItem};

    #[tokio::test]
    async fn test_connect_without_urls_is_in_memory() {
        let mut config = AppConfig::default();
        config.embedding.provider = "mock".into();
        config.embedding.dimension = 8;
        let ctx = EngineContext::connect(config).await.unwrap();

        let item = KnowledgeItem::new(
            "e1",
            "org-1",
            ItemPayload::Entity(EntityPayload {
                name: "Acme".into(),
                ..Default::default()
            }),
        );
        ctx.primary.upsert(&item).await.unwrap();
        assert!(ctx.primary.get_by_id(ItemKind::Entity, "e1").await.unwrap().is_some());
        assert_eq!(ctx.embedder.dimension(), 8);
        assert!(ctx.policy.get().enabled);
    }
}
