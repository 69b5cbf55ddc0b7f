//! pgvector-backed vector index over `item_embeddings`

use super::DbPool;
use crate::errors::{AppError, Result};
use crate::models::{Embedding, ItemKind};
use crate::store::{VectorHit, VectorIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::PgPool;
use tracing::instrument;

#[derive(Clone)]
pub struct PgVectorIndex {
    pg: PgPool,
}

impl PgVectorIndex {
    pub fn new(pool: &DbPool) -> Self {
        Self {
            pg: pool.pg().clone(),
        }
    }
}

fn index_error(operation: &str, e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::VectorIndexConnection {
                message: format!("vector index connection failed during {}: {}", operation, e),
            }
        }
        other => AppError::VectorIndexSearch {
            message: format!("vector index {} failed: {}", operation, other),
        },
    }
}

type EmbeddingRow = (
    String,
    String,
    Vector,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
);

#[async_trait]
impl VectorIndex for PgVectorIndex {
    #[instrument(
        skip(self, embedding),
        fields(kind = %embedding.kind, item_id = %embedding.item_id)
    )]
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_embeddings (kind, item_id, scope_id, embedding, model, version, metadata, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (kind, item_id) DO UPDATE SET
                scope_id = EXCLUDED.scope_id,
                embedding = EXCLUDED.embedding,
                model = EXCLUDED.model,
                version = EXCLUDED.version,
                metadata = EXCLUDED.metadata,
                generated_at = EXCLUDED.generated_at
            "#,
        )
        .bind(embedding.kind.as_str())
        .bind(&embedding.item_id)
        .bind(&embedding.scope_id)
        .bind(Vector::from(embedding.vector.clone()))
        .bind(&embedding.model)
        .bind(&embedding.version)
        .bind(&embedding.metadata)
        .bind(embedding.generated_at)
        .execute(&self.pg)
        .await
        .map_err(|e| index_error("upsert", e))?;
        Ok(())
    }

    async fn delete_embedding(&self, kind: ItemKind, item_id: &str, scope_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM item_embeddings WHERE kind = $1 AND item_id = $2 AND scope_id = $3")
            .bind(kind.as_str())
            .bind(item_id)
            .bind(scope_id)
            .execute(&self.pg)
            .await
            .map_err(|e| index_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self, query), fields(kind = %kind, k = k))]
    async fn similarity_search(
        &self,
        kind: ItemKind,
        query: &[f32],
        k: usize,
        scope_id: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"
            SELECT item_id, 1 - (embedding <=> $1) AS score
            FROM item_embeddings
            WHERE kind = $2
              AND ($3::text IS NULL OR scope_id = $3)
            ORDER BY embedding <=> $1
            LIMIT $4
            "#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(kind.as_str())
        .bind(scope_id)
        .bind(k as i64)
        .fetch_all(&self.pg)
        .await
        .map_err(|e| index_error("similarity search", e))?;

        Ok(rows
            .into_iter()
            .map(|(item_id, score)| VectorHit { item_id, score })
            .collect())
    }

    async fn get_embedding(&self, kind: ItemKind, item_id: &str) -> Result<Option<Embedding>> {
        let row: Option<EmbeddingRow> = sqlx::query_as(
            r#"
            SELECT item_id, scope_id, embedding, model, version, metadata, generated_at
            FROM item_embeddings
            WHERE kind = $1 AND item_id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(item_id)
        .fetch_optional(&self.pg)
        .await
        .map_err(|e| index_error("lookup", e))?;

        Ok(row.map(
            |(item_id, scope_id, vector, model, version, metadata, generated_at)| Embedding {
                item_id,
                kind,
                scope_id,
                vector: vector.to_vec(),
                model,
                version,
                generated_at,
                metadata,
            },
        ))
    }

    async fn list_item_ids(&self, kind: ItemKind, scope_id: Option<&str>) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT item_id FROM item_embeddings
            WHERE kind = $1 AND ($2::text IS NULL OR scope_id = $2)
            ORDER BY item_id
            "#,
        )
        .bind(kind.as_str())
        .bind(scope_id)
        .fetch_all(&self.pg)
        .await
        .map_err(|e| index_error("listing", e))?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    fn supports_lookup(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pg)
            .await
            .map_err(|e| index_error("ping", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let conn = index_error("search", sqlx::Error::PoolTimedOut);
        assert_eq!(
            conn.rag_kind(),
            crate::errors::RagErrorKind::VectorIndexConnectionFailed
        );
        let search = index_error("search", sqlx::Error::RowNotFound);
        assert_eq!(search.rag_kind(), crate::errors::RagErrorKind::VectorIndexSearchFailed);
    }
}
