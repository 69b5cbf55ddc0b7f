//! Configuration management for KGRAG services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use crate::policy::SyncPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary store / vector index database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis (settings persistence and cache tier 2)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Initial sync policy, overridden by persisted settings
    #[serde(default)]
    pub sync: SyncPolicy,

    /// Retrieval configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Context assembly configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres URL. When absent the in-memory stores are used.
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create tables on startup
    #[serde(default = "default_enabled")]
    pub ensure_schema: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL. When absent an in-memory key/value store is used.
    pub url: Option<String>,

    /// Namespace prepended to every key
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Embedding version recorded alongside stored vectors
    #[serde(default = "default_embedding_version")]
    pub version: String,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Results per kind when the caller gives no limit
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    /// Timeout for the three-way search in milliseconds
    #[serde(default = "default_search_timeout")]
    pub timeout_ms: u64,

    /// Timeout for the recovery round in milliseconds
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Per-kind limit for the recovery round
    #[serde(default = "default_recovery_limit")]
    pub recovery_limit: usize,

    /// Concurrent id-to-record lookups
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,

    /// Top-k used when probing the vector index for an item
    #[serde(default = "default_probe_k")]
    pub probe_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Enable the result cache
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// In-process tier capacity
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Persistent tier capacity
    #[serde(default = "default_persistent_capacity")]
    pub persistent_capacity: usize,

    /// Entry time-to-live in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Key prefix for persistent tier entries
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Token budget for assembled context
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Token estimate per character
    #[serde(default = "default_tokens_per_char")]
    pub tokens_per_char: f64,

    /// Per-item rendered length cap in characters
    #[serde(default = "default_item_char_cap")]
    pub item_char_cap: usize,

    /// Minimum score for an item to be considered
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_enabled")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_key_namespace() -> String { "kgrag".to_string() }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_embedding_version() -> String { crate::EMBEDDING_VERSION.to_string() }
fn default_embedding_timeout() -> u64 { 30 }
fn default_search_limit() -> usize { 5 }
fn default_search_timeout() -> u64 { 30_000 }
fn default_recovery_timeout() -> u64 { 10_000 }
fn default_recovery_limit() -> usize { 3 }
fn default_resolve_concurrency() -> usize { 5 }
fn default_probe_k() -> usize { 5 }
fn default_memory_capacity() -> usize { 50 }
fn default_persistent_capacity() -> usize { 100 }
fn default_cache_ttl() -> u64 { 3600 }
fn default_cache_prefix() -> String { "rag_search_cache_".to_string() }
fn default_max_tokens() -> usize { 4000 }
fn default_tokens_per_char() -> f64 { 0.25 }
fn default_item_char_cap() -> usize { 500 }
fn default_min_score() -> f64 { 0.3 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "kgrag".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__SYNC__MAX_RETRIES=5
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            ensure_schema: default_enabled(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_namespace: default_key_namespace(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            version: default_embedding_version(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            timeout_ms: default_search_timeout(),
            recovery_timeout_ms: default_recovery_timeout(),
            recovery_limit: default_recovery_limit(),
            resolve_concurrency: default_resolve_concurrency(),
            probe_k: default_probe_k(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            memory_capacity: default_memory_capacity(),
            persistent_capacity: default_persistent_capacity(),
            ttl_secs: default_cache_ttl(),
            key_prefix: default_cache_prefix(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            tokens_per_char: default_tokens_per_char(),
            item_char_cap: default_item_char_cap(),
            min_score: default_min_score(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_enabled(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}
