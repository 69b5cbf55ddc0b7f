//! Sync policy settings handlers

use axum::{extract::State, Json};

use crate::AppState;
use kgrag_common::errors::Result;
use kgrag_common::policy::{SyncPolicy, SyncPolicyPatch};

pub async fn get_policy(State(state): State<AppState>) -> Json<SyncPolicy> {
    Json(state.ctx().policy.get())
}

/// Merge a partial policy, validate and persist it. Takes effect for the
/// next sync call and the consistency scheduler's next tick.
pub async fn update_policy(
    State(state): State<AppState>,
    Json(patch): Json<SyncPolicyPatch>,
) -> Result<Json<SyncPolicy>> {
    let policy = state.ctx().policy.update(&patch).await?;
    tracing::info!(?policy, "Sync policy updated");
    Ok(Json(policy))
}
