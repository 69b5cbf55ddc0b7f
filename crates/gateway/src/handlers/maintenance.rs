//! Consistency, repair and cache handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use kgrag_common::errors::{AppError, Result};
use kgrag_common::models::Inconsistency;
use kgrag_search::{CacheStats, RepairAllReport};

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub scope_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RepairRequest {
    #[serde(default)]
    pub scope_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConsistencyResponse {
    pub count: usize,
    pub inconsistencies: Vec<Inconsistency>,
}

/// Compare the primary store against the vector index
pub async fn consistency(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<ConsistencyResponse>> {
    let inconsistencies = state
        .engine
        .check_consistency(query.scope_id.as_deref())
        .await?;

    Ok(Json(ConsistencyResponse {
        count: inconsistencies.len(),
        inconsistencies,
    }))
}

/// Repair sync flags and index drift for a scope, or everywhere. An empty
/// body repairs every scope.
pub async fn repair(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RepairAllReport>> {
    let request: RepairRequest = if body.is_empty() {
        RepairRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::Validation {
            message: format!("invalid repair request: {}", e),
            field: None,
        })?
    };
    let report = state.engine.repair_all(request.scope_id.as_deref()).await?;
    Ok(Json(report))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.engine.cache_stats().await)
}

pub async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.engine.clear_cache().await;
    tracing::info!("Result cache cleared");
    StatusCode::NO_CONTENT
}
