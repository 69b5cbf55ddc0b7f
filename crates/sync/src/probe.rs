//! Vector-index existence check
//!
//! Uses the index's native lookup when it has one. Otherwise embeds the
//! item's probe text and checks whether its id comes back in the top-k of a
//! scoped similarity query; a near-duplicate item can shadow the real one,
//! so this path can report false negatives.

use kgrag_common::errors::Result;
use kgrag_common::models::KnowledgeItem;
use kgrag_common::EngineContext;
use tracing::debug;

#[derive(Clone)]
pub struct IndexProbe {
    ctx: EngineContext,
}

impl IndexProbe {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Whether a valid embedding for `item` is present in the index.
    pub async fn is_indexed(&self, item: &KnowledgeItem) -> Result<bool> {
        let kind = item.kind();
        if self.ctx.index.supports_lookup() {
            match self.ctx.index.get_embedding(kind, &item.id).await {
                Ok(found) => return Ok(found.is_some_and(|e| e.is_valid())),
                Err(e) if e.is_unsupported_operation() => {
                    debug!(
                        kind = %kind,
                        "Native lookup unsupported, falling back to similarity probe"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.similarity_probe(item).await
    }

    async fn similarity_probe(&self, item: &KnowledgeItem) -> Result<bool> {
        let strategy = item.strategy();
        let mut text = (strategy.probe_text)(&item.payload);
        if text.trim().is_empty() {
            text = (strategy.embedding_text)(&item.payload);
        }
        if text.trim().is_empty() {
            return Ok(false);
        }

        let vector = self.ctx.embedder.embed(&text).await?;
        let scope = item.scope();
        let hits = self
            .ctx
            .index
            .similarity_search(
                item.kind(),
                &vector,
                self.ctx.config.search.probe_k,
                scope.as_deref(),
            )
            .await?;
        Ok(hits.iter().any(|h| h.item_id == item.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SyncManager;
    use crate::test_support::{entity, harness, harness_with, topic};
    use kgrag_common::store::memory::MemoryVectorIndex;

    #[tokio::test]
    async fn test_native_lookup() {
        let h = harness();
        let manager = SyncManager::new(h.ctx.clone());
        let probe = IndexProbe::new(h.ctx.clone());
        let item = entity("e1", "Acme");

        assert!(!probe.is_indexed(&item).await.unwrap());
        manager.resync(&item).await.unwrap();
        assert!(probe.is_indexed(&item).await.unwrap());
        assert_eq!(h.index.search_calls(), 0);
    }

    #[tokio::test]
    async fn test_similarity_fallback() {
        let h = harness_with(MemoryVectorIndex::similarity_only());
        let manager = SyncManager::new(h.ctx.clone());
        let probe = IndexProbe::new(h.ctx.clone());
        let item = topic("t1", "Quarterly pricing review");

        assert!(!probe.is_indexed(&item).await.unwrap());
        manager.resync(&item).await.unwrap();
        assert!(probe.is_indexed(&item).await.unwrap());
        assert!(h.index.search_calls() >= 1);
    }
}
