//! KGRAG Common Library
//!
//! Shared code for the sync worker, search library and gateway:
//! - Data model and per-kind strategy table
//! - Store contracts, in-memory stores, Postgres/pgvector and Redis adapters
//! - Embedding provider abstraction
//! - Sync policy, retry executor and notification sink
//! - Error types with the retrieval failure taxonomy
//! - Configuration and metrics

pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod kv;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod policy;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod testing;

pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, RagErrorKind, Result};
pub use models::{ItemKind, ItemPayload, KnowledgeItem, SearchResult, SyncFlag};
pub use notification::{Notification, NotificationSink};
pub use policy::{PolicyStore, SyncPolicy};
pub use runtime::EngineContext;
pub use store::{KvStore, PrimaryStore, VectorIndex};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

/// Version tag stored with every embedding
pub const EMBEDDING_VERSION: &str = "1.0";
