//! Search and context handlers

use axum::{extract::State, Json};
use serde::Deserialize;
use validator::Validate;

use super::validate_request;
use crate::AppState;
use kgrag_common::errors::Result;
use kgrag_search::{ContextResponse, SearchFilters, SearchResponse};

/// Search request
#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    /// Results per kind; the configured default when unset
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,

    #[serde(default)]
    pub filters: SearchFilters,
}

/// Context request
#[derive(Debug, Deserialize, Validate)]
pub struct ContextRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,

    #[serde(default)]
    pub filters: SearchFilters,

    /// Token budget; the configured default when unset
    #[validate(range(min = 100, max = 32000))]
    pub max_tokens: Option<usize>,
}

/// Ranked results across all requested kinds
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    validate_request(&request)?;

    let response = state
        .engine
        .search_detailed(&request.query, request.limit, &request.filters)
        .await?;

    tracing::info!(
        results = response.results.len(),
        cached = response.cached,
        timed_out = response.timed_out,
        "Search served"
    );

    Ok(Json(response))
}

/// Token-budgeted context. Retrieval failures produce an empty context.
pub async fn context(
    State(state): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> Result<Json<ContextResponse>> {
    validate_request(&request)?;

    let response = state
        .engine
        .get_context(&request.query, request.limit, &request.filters, request.max_tokens)
        .await;

    Ok(Json(response))
}
