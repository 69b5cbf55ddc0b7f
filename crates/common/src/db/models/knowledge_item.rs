//! Knowledge item row. Kind-specific fields live in the JSONB payload.

use crate::errors::{self, AppError};
use crate::models::{ItemPayload, KnowledgeItem, SyncFlag};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "knowledge_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub kind: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub owner_scope_id: Option<String>,

    pub organization_id: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    pub sync_flag: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_sync_error: Option<String>,

    pub created_at: Option<DateTimeWithTimeZone>,

    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_item(self) -> errors::Result<KnowledgeItem> {
        let payload: ItemPayload = serde_json::from_value(self.payload)?;
        if payload.kind().as_str() != self.kind {
            return Err(AppError::Internal {
                message: format!(
                    "row {} has kind column '{}' but a {} payload",
                    self.id,
                    self.kind,
                    payload.kind()
                ),
            });
        }
        Ok(KnowledgeItem {
            id: self.id,
            owner_scope_id: self.owner_scope_id,
            organization_id: self.organization_id,
            payload,
            created_at: self.created_at.map(Into::into),
            updated_at: self.updated_at.map(Into::into),
            sync_flag: self.sync_flag.parse::<SyncFlag>()?,
            last_sync_error: self.last_sync_error,
        })
    }
}

impl ActiveModel {
    pub fn from_item(item: &KnowledgeItem) -> errors::Result<Self> {
        Ok(Self {
            kind: Set(item.kind().as_str().to_string()),
            id: Set(item.id.clone()),
            owner_scope_id: Set(item.owner_scope_id.clone()),
            organization_id: Set(item.organization_id.clone()),
            payload: Set(serde_json::to_value(&item.payload)?),
            sync_flag: Set(item.sync_flag.as_str().to_string()),
            last_sync_error: Set(item.last_sync_error.clone()),
            created_at: Set(item.created_at.map(Into::into)),
            updated_at: Set(item.updated_at.map(Into::into)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemKind, TopicPayload};
    use tokio_test::assert_ok;

    #[test]
    fn test_row_conversion() {
        let mut item = KnowledgeItem::new(
            "t1",
            "org-1",
            ItemPayload::Topic(TopicPayload {
                title: "Pricing".into(),
                keywords: vec!["pricing".into()],
                ..Default::default()
            }),
        );
        item.sync_flag = SyncFlag::SyncFailed;
        item.last_sync_error = Some("timeout".into());

        let row = Model {
            kind: "topic".into(),
            id: "t1".into(),
            owner_scope_id: None,
            organization_id: Some("org-1".into()),
            payload: serde_json::to_value(&item.payload).unwrap(),
            sync_flag: "sync_failed".into(),
            last_sync_error: Some("timeout".into()),
            created_at: item.created_at.map(Into::into),
            updated_at: item.updated_at.map(Into::into),
        };
        let back = assert_ok!(row.clone().into_item());
        assert_eq!(back, item);
        assert_eq!(back.kind(), ItemKind::Topic);

        let active = assert_ok!(ActiveModel::from_item(&item));
        assert_eq!(active.kind.as_ref(), "topic");
        assert_eq!(active.sync_flag.as_ref(), "sync_failed");
        assert_eq!(active.payload.as_ref(), &row.payload);

        let mismatched = Model {
            kind: "entity".into(),
            ..row
        };
        assert!(mismatched.into_item().is_err());
    }
}
