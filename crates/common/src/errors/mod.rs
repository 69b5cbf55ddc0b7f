//! Error types for KGRAG services
//!
//! Provides:
//! - Distinct error types for store, index and embedding failures
//! - HTTP status code mapping
//! - Structured error responses
//! - The retrieval failure taxonomy (see [`classify`])

mod classify;

pub use classify::{classify, safe_handle, RagErrorKind};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    InvalidQuery,

    // Resource errors (4xxx)
    ItemNotFound,
    NoDataFound,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,
    PrimaryStoreSearchFailed,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingGenerationFailed,
    EmbeddingTimeout,
    VectorIndexConnectionFailed,
    VectorIndexSearchFailed,
    UnsupportedOperation,
    CacheError,
    SettingsError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidQuery => 1003,

            ErrorCode::ItemNotFound => 4002,
            ErrorCode::NoDataFound => 4003,

            ErrorCode::RateLimited => 6001,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::PrimaryStoreSearchFailed => 7003,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingGenerationFailed => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::VectorIndexConnectionFailed => 8004,
            ErrorCode::VectorIndexSearchFailed => 8005,
            ErrorCode::UnsupportedOperation => 8006,
            ErrorCode::CacheError => 8007,
            ErrorCode::SettingsError => 8008,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    // Resource errors
    #[error("Knowledge item not found: {kind}/{id}")]
    ItemNotFound { kind: String, id: String },

    #[error("No data found: {message}")]
    NoDataFound { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Primary store errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Primary store search failed: {message}")]
    PrimaryStore { message: String },

    // External service errors
    #[error("Embedding generation failed: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Vector index connection failed: {message}")]
    VectorIndexConnection { message: String },

    #[error("Vector index search failed: {message}")]
    VectorIndexSearch { message: String },

    #[error("Operation unsupported by backend: {operation}")]
    Unsupported { operation: String },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("Settings persistence error: {message}")]
    SettingsError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            AppError::ItemNotFound { .. } => ErrorCode::ItemNotFound,
            AppError::NoDataFound { .. } => ErrorCode::NoDataFound,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) | AppError::Sqlx(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::PrimaryStore { .. } => ErrorCode::PrimaryStoreSearchFailed,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingGenerationFailed,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::VectorIndexConnection { .. } => ErrorCode::VectorIndexConnectionFailed,
            AppError::VectorIndexSearch { .. } => ErrorCode::VectorIndexSearchFailed,
            AppError::Unsupported { .. } => ErrorCode::UnsupportedOperation,
            AppError::CacheError { .. } => ErrorCode::CacheError,
            AppError::SettingsError { .. } => ErrorCode::SettingsError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::InvalidQuery { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::ItemNotFound { .. } | AppError::NoDataFound { .. } => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::Sqlx(_)
            | AppError::DatabaseConnection { .. }
            | AppError::PrimaryStore { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::SettingsError { .. }
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 501 Not Implemented
            AppError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,

            // 502 Bad Gateway
            AppError::EmbeddingError { .. }
            | AppError::VectorIndexSearch { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::VectorIndexConnection { .. }
            | AppError::CacheError { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::EmbeddingTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Whether a backend rejected the call as an operation it does not implement.
    ///
    /// Remote vector indexes report this in their message text rather than a
    /// typed error, so the message is inspected as well.
    pub fn is_unsupported_operation(&self) -> bool {
        match self {
            AppError::Unsupported { .. } => true,
            AppError::VectorIndexSearch { message }
            | AppError::VectorIndexConnection { message } => {
                let lower = message.to_lowercase();
                lower.contains("unsupported")
                    || lower.contains("not found")
                    || lower.contains("command")
            }
            _ => false,
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<RagErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let kind = self.rag_kind();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                kind = kind.as_str(),
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                kind: Some(kind),
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
