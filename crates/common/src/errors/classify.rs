//! Retrieval failure taxonomy
//!
//! Raw failures from the embedding provider, vector index and primary store
//! arrive as free-form messages. They are bucketed by substring match in a
//! fixed priority order so the caller can pick a recovery policy.

use super::AppError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RagErrorKind {
    EmbeddingGenerationFailed,
    VectorIndexConnectionFailed,
    VectorIndexSearchFailed,
    PrimaryStoreSearchFailed,
    NoDataFound,
    InvalidQuery,
    Unknown,
}

const EMBEDDING_CUES: &[&str] = &[
    "api key",
    "apikey",
    "insufficient_quota",
    "quota",
    "embedding generation",
    "埋め込み生成",
];
const INDEX_CUES: &[&str] = &["chroma", "vector index", "vector_index", "pgvector", "ベクトル"];
const CONNECTION_CUES: &[&str] = &["接続", "connection", "connect"];
const STORE_CUES: &[&str] = &["sqlite", "postgres", "primary store", "database", "データベース"];
const NO_DATA_CUES: &[&str] = &["no rows", "not found", "見つかりません", "データがありません"];
const INVALID_CUES: &[&str] = &["invalid", "empty", "無効", "空です"];

fn contains_any(haystack: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| haystack.contains(cue))
}

/// Classify a raw failure message.
pub fn classify(message: &str) -> RagErrorKind {
    let lower = message.to_lowercase();

    if contains_any(&lower, EMBEDDING_CUES) {
        RagErrorKind::EmbeddingGenerationFailed
    } else if contains_any(&lower, INDEX_CUES) {
        if contains_any(&lower, CONNECTION_CUES) {
            RagErrorKind::VectorIndexConnectionFailed
        } else {
            RagErrorKind::VectorIndexSearchFailed
        }
    } else if contains_any(&lower, STORE_CUES) {
        RagErrorKind::PrimaryStoreSearchFailed
    } else if contains_any(&lower, NO_DATA_CUES) {
        RagErrorKind::NoDataFound
    } else if contains_any(&lower, INVALID_CUES) {
        RagErrorKind::InvalidQuery
    } else {
        RagErrorKind::Unknown
    }
}

impl RagErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RagErrorKind::EmbeddingGenerationFailed => "EMBEDDING_GENERATION_FAILED",
            RagErrorKind::VectorIndexConnectionFailed => "VECTOR_INDEX_CONNECTION_FAILED",
            RagErrorKind::VectorIndexSearchFailed => "VECTOR_INDEX_SEARCH_FAILED",
            RagErrorKind::PrimaryStoreSearchFailed => "PRIMARY_STORE_SEARCH_FAILED",
            RagErrorKind::NoDataFound => "NO_DATA_FOUND",
            RagErrorKind::InvalidQuery => "INVALID_QUERY",
            RagErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Message suitable for end users.
    pub fn user_message(&self) -> &'static str {
        match self {
            RagErrorKind::EmbeddingGenerationFailed => {
                "Failed to generate embeddings. Check the embedding provider credentials and quota."
            }
            RagErrorKind::VectorIndexConnectionFailed => {
                "Could not connect to the vector index. Results fall back to keyword matching."
            }
            RagErrorKind::VectorIndexSearchFailed => {
                "Vector search failed. Results fall back to keyword matching."
            }
            RagErrorKind::PrimaryStoreSearchFailed => "Failed to read from the knowledge store.",
            RagErrorKind::NoDataFound => "No matching knowledge was found.",
            RagErrorKind::InvalidQuery => "The query is empty or invalid.",
            RagErrorKind::Unknown => "An unexpected error occurred.",
        }
    }

    /// No-data and invalid-query outcomes are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RagErrorKind::NoDataFound | RagErrorKind::InvalidQuery)
    }

    /// Failures of the vector side, which degrade a kind to keyword-only results.
    pub fn is_vector_side(&self) -> bool {
        matches!(
            self,
            RagErrorKind::VectorIndexConnectionFailed
                | RagErrorKind::VectorIndexSearchFailed
                | RagErrorKind::EmbeddingGenerationFailed
        )
    }
}

impl AppError {
    /// Map this error onto the retrieval taxonomy.
    pub fn rag_kind(&self) -> RagErrorKind {
        match self {
            AppError::EmbeddingError { .. } | AppError::EmbeddingTimeout { .. } => {
                RagErrorKind::EmbeddingGenerationFailed
            }
            AppError::VectorIndexConnection { .. } => RagErrorKind::VectorIndexConnectionFailed,
            AppError::VectorIndexSearch { .. } => RagErrorKind::VectorIndexSearchFailed,
            AppError::PrimaryStore { .. }
            | AppError::Database(_)
            | AppError::Sqlx(_)
            | AppError::DatabaseConnection { .. } => RagErrorKind::PrimaryStoreSearchFailed,
            AppError::NoDataFound { .. } | AppError::ItemNotFound { .. } => {
                RagErrorKind::NoDataFound
            }
            AppError::InvalidQuery { .. }
            | AppError::Validation { .. }
            | AppError::MissingField { .. } => RagErrorKind::InvalidQuery,
            other => classify(&other.to_string()),
        }
    }
}

/// Run a fallible operation, logging a classified failure and returning `fallback`.
pub async fn safe_handle<T, F>(operation: F, fallback: T, context: &str) -> T
where
    F: Future<Output = Result<T, AppError>>,
{
    match operation.await {
        Ok(value) => value,
        Err(e) => {
            let kind = e.rag_kind();
            warn!(
                kind = kind.as_str(),
                error = %e,
                context = context,
                "Operation failed, using fallback"
            );
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert_eq!(
            classify("Invalid API key provided"),
            RagErrorKind::EmbeddingGenerationFailed
        );
        assert_eq!(
            classify("ChromaDB connection refused"),
            RagErrorKind::VectorIndexConnectionFailed
        );
        assert_eq!(
            classify("chroma query returned malformed payload"),
            RagErrorKind::VectorIndexSearchFailed
        );
        assert_eq!(
            classify("database is locked"),
            RagErrorKind::PrimaryStoreSearchFailed
        );
        assert_eq!(classify("record not found"), RagErrorKind::NoDataFound);
        assert_eq!(classify("query is empty"), RagErrorKind::InvalidQuery);
        assert_eq!(classify("segfault"), RagErrorKind::Unknown);
    }

    #[test]
    fn test_japanese_cues() {
        assert_eq!(
            classify("埋め込み生成に失敗しました"),
            RagErrorKind::EmbeddingGenerationFailed
        );
        assert_eq!(classify("データがありません"), RagErrorKind::NoDataFound);
        assert_eq!(classify("クエリが空です"), RagErrorKind::InvalidQuery);
    }

    #[test]
    fn test_typed_errors_map_directly() {
        let err = AppError::VectorIndexSearch {
            message: "timeout".into(),
        };
        assert_eq!(err.rag_kind(), RagErrorKind::VectorIndexSearchFailed);
        assert!(err.rag_kind().is_vector_side());

        let err = AppError::InvalidQuery {
            message: "blank".into(),
        };
        assert!(!err.rag_kind().is_retryable());
    }

    #[tokio::test]
    async fn test_safe_handle_returns_fallback() {
        let value = safe_handle(
            async { Err::<Vec<u32>, _>(AppError::Internal { message: "boom".into() }) },
            vec![7],
            "test",
        )
        .await;
        assert_eq!(value, vec![7]);

        let value = safe_handle(async { Ok::<_, AppError>(3) }, 0, "test").await;
        assert_eq!(value, 3);
    }
}
