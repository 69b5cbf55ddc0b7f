//! KGRAG Search
//!
//! Turns a free-text query into ranked results and a token-budgeted context:
//! - [`query`]: normalization, intent detection, rewriting and expansion
//! - [`retrieval`]: per-kind hybrid vector + keyword retrieval under a deadline
//! - [`filter`]: similarity floor, metadata filter and rerank
//! - [`context`]: budgeted selection and sectioned rendering
//! - [`cache`]: two-tier result cache with targeted invalidation
//! - [`RagEngine`]: facade tying search to the sync hooks and repair

pub mod cache;
pub mod context;
pub mod engine;
pub mod filter;
pub mod query;
pub mod retrieval;

pub use cache::{cache_key, CacheStats, Clock, ManualClock, ResultCache, SystemClock};
pub use context::{ContextAssembler, ContextRenderer, ContextSource, OptimizedContext};
pub use engine::{ContextResponse, KindRepair, RagEngine, RepairAllReport, SearchResponse};
pub use filter::{FilterConfig, FilterReport, MultiStageFilter};
pub use query::{ProcessedQuery, QueryIntent, QueryProcessor, QueryProcessorConfig};
pub use retrieval::{HybridRetriever, RetrievalOutcome, SearchFilters, SearchOptions};
