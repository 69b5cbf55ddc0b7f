//! KGRAG Sync
//!
//! Keeps the vector index in eventual agreement with the primary store:
//! - [`SyncManager`]: write-through of embeddings on create/update/delete
//! - [`ConsistencyAuditor`]: detect and repair divergence
//! - [`FlagRepairer`]: reconcile sync flags with actual index presence
//! - [`ConsistencyScheduler`]: periodic audit task
//! - [`BulkRegenerator`]: throttled regeneration of a whole scope

pub mod auditor;
pub mod bulk;
pub mod flag_repair;
pub mod manager;
mod probe;
pub mod scheduler;

pub use auditor::ConsistencyAuditor;
pub use bulk::{BulkProgress, BulkRegenerator, BulkReport, KindTally};
pub use flag_repair::{FlagRepairReport, FlagRepairer};
pub use manager::{SkipReason, SyncManager, SyncTicket, UpsertOptions};
pub use probe::IndexProbe;
pub use scheduler::{ConsistencyScheduler, TickSummary};

/// Cooperative cancellation predicate polled between items.
pub type CancelCheck<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// A predicate that never cancels.
pub fn never_cancel() -> bool {
    false
}

#[cfg(test)]
pub(crate) mod test_support {
    use kgrag_common::config::AppConfig;
    use kgrag_common::embeddings::MockEmbedder;
    use kgrag_common::models::{
        EntityPayload, ItemPayload, KnowledgeItem, RelationPayload, TopicPayload,
    };
    use kgrag_common::notification::CollectingSink;
    use kgrag_common::store::memory::{MemoryPrimaryStore, MemoryVectorIndex};
    use kgrag_common::testing::{CountingEmbedder, FaultyVectorIndex};
    use kgrag_common::EngineContext;
    use std::sync::Arc;

    pub struct Harness {
        pub ctx: EngineContext,
        pub primary: Arc<MemoryPrimaryStore>,
        pub memory_index: Arc<MemoryVectorIndex>,
        pub index: Arc<FaultyVectorIndex>,
        pub embedder: Arc<CountingEmbedder>,
        pub sink: Arc<CollectingSink>,
    }

    pub fn harness() -> Harness {
        harness_with(MemoryVectorIndex::new())
    }

    pub fn harness_with(memory_index: MemoryVectorIndex) -> Harness {
        let mut config = AppConfig::default();
        config.embedding.provider = "mock".into();
        config.embedding.dimension = 64;
        config.sync.async_mode = false;
        config.sync.retry_on_failure = false;
        config.sync.retry_delay_base_ms = 10;
        config.sync.rate_limit = 1000;

        let primary = Arc::new(MemoryPrimaryStore::new());
        let memory_index = Arc::new(memory_index);
        let index = Arc::new(FaultyVectorIndex::new(memory_index.clone()));
        let embedder = Arc::new(CountingEmbedder::new(Arc::new(MockEmbedder::new(64))));
        let sink = Arc::new(CollectingSink::new());

        let ctx = EngineContext::in_memory(config)
            .with_stores(primary.clone(), index.clone())
            .with_embedder(embedder.clone())
            .with_notifier(sink.clone());

        Harness {
            ctx,
            primary,
            memory_index,
            index,
            embedder,
            sink,
        }
    }

    pub fn entity(id: &str, name: &str) -> KnowledgeItem {
        KnowledgeItem::new(
            id,
            "org-1",
            ItemPayload::Entity(EntityPayload {
                name: name.into(),
                entity_type: Some("company".into()),
                ..Default::default()
            }),
        )
    }

    pub fn relation(id: &str, description: &str) -> KnowledgeItem {
        KnowledgeItem::new(
            id,
            "org-1",
            ItemPayload::Relation(RelationPayload {
                relation_type: "partner".into(),
                description: Some(description.into()),
                ..Default::default()
            }),
        )
    }

    pub fn topic(id: &str, title: &str) -> KnowledgeItem {
        KnowledgeItem::new(
            id,
            "org-1",
            ItemPayload::Topic(TopicPayload {
                title: title.into(),
                content: format!("{} details", title),
                ..Default::default()
            }),
        )
    }
}
