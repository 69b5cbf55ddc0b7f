//! Primary store over `knowledge_items`

use super::models::{KnowledgeItemActiveModel, KnowledgeItemColumn, KnowledgeItemEntity};
use super::DbPool;
use crate::errors::{AppError, Result};
use crate::models::{ItemKind, KnowledgeItem, SyncFlag};
use crate::store::{Conditions, PrimaryStore};
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use tracing::warn;

#[derive(Clone)]
pub struct PgPrimaryStore {
    pool: DbPool,
}

impl PgPrimaryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn search_failed(e: sea_orm::DbErr) -> AppError {
    AppError::PrimaryStore {
        message: format!("primary store database query failed: {}", e),
    }
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn get_by_id(&self, kind: ItemKind, id: &str) -> Result<Option<KnowledgeItem>> {
        KnowledgeItemEntity::find_by_id((kind.as_str().to_string(), id.to_string()))
            .one(self.pool.orm())
            .await
            .map_err(search_failed)?
            .map(|row| row.into_item())
            .transpose()
    }

    async fn query_by_conditions(
        &self,
        kind: ItemKind,
        conditions: &Conditions,
    ) -> Result<Vec<KnowledgeItem>> {
        let mut query = KnowledgeItemEntity::find()
            .filter(KnowledgeItemColumn::Kind.eq(kind.as_str()))
            .order_by_asc(KnowledgeItemColumn::Id);

        if let Some(scope) = conditions.scope_id.as_deref() {
            query = query.filter(
                Condition::any()
                    .add(KnowledgeItemColumn::OwnerScopeId.eq(scope))
                    .add(KnowledgeItemColumn::OrganizationId.eq(scope)),
            );
        }
        if let Some(flag) = conditions.sync_flag {
            query = query.filter(KnowledgeItemColumn::SyncFlag.eq(flag.as_str()));
        }
        if let Some(ids) = &conditions.ids {
            query = query.filter(KnowledgeItemColumn::Id.is_in(ids.iter().cloned()));
        }
        if let Some(limit) = conditions.limit {
            query = query.limit(limit as u64);
        }

        let rows = query.all(self.pool.orm()).await.map_err(search_failed)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_item() {
                Ok(item) => items.push(item),
                Err(e) => warn!(kind = %kind, item_id = %id, error = %e, "Skipping unreadable row"),
            }
        }
        Ok(items)
    }

    async fn upsert(&self, item: &KnowledgeItem) -> Result<()> {
        let model = KnowledgeItemActiveModel::from_item(item)?;
        KnowledgeItemEntity::insert(model)
            .on_conflict(
                OnConflict::columns([KnowledgeItemColumn::Kind, KnowledgeItemColumn::Id])
                    .update_columns([
                        KnowledgeItemColumn::OwnerScopeId,
                        KnowledgeItemColumn::OrganizationId,
                        KnowledgeItemColumn::Payload,
                        KnowledgeItemColumn::SyncFlag,
                        KnowledgeItemColumn::LastSyncError,
                        KnowledgeItemColumn::CreatedAt,
                        KnowledgeItemColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.pool.orm())
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: ItemKind, id: &str) -> Result<bool> {
        let result = KnowledgeItemEntity::delete_by_id((kind.as_str().to_string(), id.to_string()))
            .exec(self.pool.orm())
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn update_sync_state(
        &self,
        kind: ItemKind,
        id: &str,
        flag: SyncFlag,
        error: Option<String>,
    ) -> Result<()> {
        let result = KnowledgeItemEntity::update_many()
            .col_expr(KnowledgeItemColumn::SyncFlag, Expr::value(flag.as_str()))
            .col_expr(KnowledgeItemColumn::LastSyncError, Expr::value(error))
            .filter(KnowledgeItemColumn::Kind.eq(kind.as_str()))
            .filter(KnowledgeItemColumn::Id.eq(id))
            .exec(self.pool.orm())
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::ItemNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}
