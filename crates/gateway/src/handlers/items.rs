//! Item mutation handlers
//!
//! The primary-store write is authoritative. The sync hook runs after it and
//! its outcome is reported alongside, never turned into a request failure.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::Validate;

use super::validate_request;
use crate::AppState;
use kgrag_common::errors::{AppError, Result};
use kgrag_common::models::{ItemKind, ItemPayload, KnowledgeItem, SyncFlag};
use kgrag_common::PrimaryStore;
use kgrag_sync::{BulkProgress, BulkReport, SkipReason, SyncTicket};

/// Item create request
#[derive(Debug, Deserialize, Validate)]
pub struct CreateItemRequest {
    #[validate(length(min = 1, max = 256))]
    pub id: String,

    #[serde(default)]
    pub owner_scope_id: Option<String>,

    #[serde(default)]
    pub organization_id: Option<String>,

    pub payload: ItemPayload,
}

/// Item update request. Omitted fields keep their stored value.
#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    #[serde(default)]
    pub owner_scope_id: Option<String>,

    #[serde(default)]
    pub organization_id: Option<String>,

    #[serde(default)]
    pub payload: Option<ItemPayload>,

    /// Fields the caller changed, narrowing change detection
    #[serde(default)]
    pub updated_fields: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegenerateRequest {
    #[validate(length(min = 1))]
    pub scope_id: String,

    /// All kinds when unset
    #[serde(default)]
    pub kinds: Option<Vec<ItemKind>>,

    /// Regenerate items already marked synced
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub kind: ItemKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    /// completed | pending | skipped | failed
    pub sync: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

impl ItemResponse {
    fn new(kind: ItemKind, id: &str, scope_id: Option<String>, ticket: SyncTicket) -> Self {
        let mut response = Self {
            kind,
            id: id.to_string(),
            scope_id,
            sync: "completed",
            skip_reason: None,
            sync_error: None,
        };
        match ticket {
            SyncTicket::Completed => {}
            SyncTicket::Pending(_) => response.sync = "pending",
            SyncTicket::Skipped(reason) => {
                response.sync = "skipped";
                response.skip_reason = Some(match reason {
                    SkipReason::Disabled => "disabled",
                    SkipReason::MissingScope => "missing_scope",
                    SkipReason::NoRelevantChanges => "no_relevant_changes",
                });
            }
            SyncTicket::Failed(e) => {
                response.sync = "failed";
                response.sync_error = Some(e.to_string());
            }
        }
        response
    }
}

fn parse_kind(raw: &str) -> Result<ItemKind> {
    ItemKind::from_str(raw)
}

/// Store a new item and index it
pub async fn create_item(
    State(state): State<AppState>,
    Json(request): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<ItemResponse>)> {
    validate_request(&request)?;

    let now = Utc::now();
    let item = KnowledgeItem {
        id: request.id,
        owner_scope_id: request.owner_scope_id,
        organization_id: request.organization_id,
        payload: request.payload,
        created_at: Some(now),
        updated_at: Some(now),
        sync_flag: SyncFlag::Unsynced,
        last_sync_error: None,
    };

    state.ctx().primary.upsert(&item).await?;
    let ticket = state.engine.on_create(&item).await?;

    tracing::info!(kind = %item.kind(), item_id = %item.id, "Item created");
    Ok((
        StatusCode::CREATED,
        Json(ItemResponse::new(item.kind(), &item.id, item.scope(), ticket)),
    ))
}

/// Apply an update and re-index when embedding-relevant fields changed
pub async fn update_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Json(request): Json<UpdateItemRequest>,
) -> Result<Json<ItemResponse>> {
    let kind = parse_kind(&kind)?;
    let previous = state
        .ctx()
        .primary
        .get_by_id(kind, &id)
        .await?
        .ok_or_else(|| AppError::ItemNotFound {
            kind: kind.to_string(),
            id: id.clone(),
        })?;

    let mut item = previous.clone();
    if let Some(payload) = request.payload {
        if payload.kind() != kind {
            return Err(AppError::Validation {
                message: format!("payload kind '{}' does not match '{}'", payload.kind(), kind),
                field: Some("payload".to_string()),
            });
        }
        item.payload = payload;
    }
    if request.owner_scope_id.is_some() {
        item.owner_scope_id = request.owner_scope_id;
    }
    if request.organization_id.is_some() {
        item.organization_id = request.organization_id;
    }
    item.updated_at = Some(Utc::now());

    state.ctx().primary.upsert(&item).await?;
    let ticket = state
        .engine
        .on_update(&item, Some(&previous), request.updated_fields.as_deref())
        .await?;

    Ok(Json(ItemResponse::new(kind, &item.id, item.scope(), ticket)))
}

/// Delete an item and its embedding
pub async fn delete_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<ItemResponse>> {
    let kind = parse_kind(&kind)?;
    let primary = &state.ctx().primary;
    let not_found = || AppError::ItemNotFound {
        kind: kind.to_string(),
        id: id.clone(),
    };

    let existing = primary.get_by_id(kind, &id).await?.ok_or_else(not_found)?;
    if !primary.delete(kind, &id).await? {
        return Err(not_found());
    }

    let scope = existing.scope();
    let ticket = state.engine.on_delete(kind, &id, scope.as_deref()).await?;

    tracing::info!(kind = %kind, item_id = %id, "Item deleted");
    Ok(Json(ItemResponse::new(kind, &id, scope, ticket)))
}

/// Regenerate every embedding in a scope
pub async fn regenerate(
    State(state): State<AppState>,
    Json(request): Json<RegenerateRequest>,
) -> Result<Json<BulkReport>> {
    validate_request(&request)?;

    let kinds = request.kinds.unwrap_or_else(|| ItemKind::ALL.to_vec());
    let report = state
        .engine
        .regenerate(
            &request.scope_id,
            &kinds,
            request.force,
            &kgrag_sync::never_cancel,
            &|progress: BulkProgress| {
                tracing::debug!(
                    kind = %progress.kind,
                    current = progress.current,
                    total = progress.total,
                    "Regeneration progress"
                )
            },
        )
        .await?;

    let total = report.total();
    tracing::info!(
        scope_id = %request.scope_id,
        succeeded = total.succeeded,
        failed = total.failed,
        skipped = total.skipped,
        "Regeneration complete"
    );
    Ok(Json(report))
}
