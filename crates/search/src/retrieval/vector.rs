//! Vector similarity search against the vector index
//!
//! Provides semantic search via embedding similarity

use super::{normalize_similarity, Candidate, KindRequest, RetrievalMode, Retriever};
use kgrag_common::errors::{AppError, Result};
use kgrag_common::VectorIndex;
use std::sync::Arc;

/// Vector retriever over the configured index
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
}

impl VectorRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, request: &KindRequest<'_>) -> Result<Vec<Candidate>> {
        let embedding = request.embedding.ok_or_else(|| AppError::EmbeddingError {
            message: "query embedding unavailable".to_string(),
        })?;

        let hits = self
            .index
            .similarity_search(
                request.kind,
                embedding,
                request.limit,
                request.filters.scope_id.as_deref(),
            )
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| Candidate {
                kind: request.kind,
                item_id: hit.item_id,
                score: normalize_similarity(hit.score),
                item: None,
                mode: RetrievalMode::Vector,
            })
            .collect())
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Vector
    }
}
