//! Core data model
//!
//! Knowledge items are a closed set of kinds (entity, relation, topic). The
//! kind-specific behaviour lives in a per-kind [`KindStrategy`] table rather
//! than in scattered matches.

mod audit;
mod strategy;

pub use audit::{Inconsistency, InconsistencyType, ItemError, RepairReport};
pub use strategy::{has_relevant_changes, present_boost_fields, recency_score, KindStrategy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form metadata attached to an item. Ordered so that serialized
/// comparisons are stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Entity,
    Relation,
    Topic,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Entity, ItemKind::Relation, ItemKind::Topic];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Entity => "entity",
            ItemKind::Relation => "relation",
            ItemKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = crate::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity" => Ok(ItemKind::Entity),
            "relation" => Ok(ItemKind::Relation),
            "topic" => Ok(ItemKind::Topic),
            other => Err(crate::AppError::Validation {
                message: format!("unknown item kind '{}'", other),
                field: Some("kind".to_string()),
            }),
        }
    }
}

/// Embedding-sync status of an item. Owned by the sync engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncFlag {
    #[default]
    Unsynced,
    Synced,
    SyncFailed,
}

impl SyncFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFlag::Unsynced => "unsynced",
            SyncFlag::Synced => "synced",
            SyncFlag::SyncFailed => "sync_failed",
        }
    }
}

impl FromStr for SyncFlag {
    type Err = crate::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(SyncFlag::Unsynced),
            "synced" => Ok(SyncFlag::Synced),
            "sync_failed" => Ok(SyncFlag::SyncFailed),
            other => Err(crate::AppError::Internal {
                message: format!("unknown sync flag '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityPayload {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationPayload {
    pub relation_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_entity_id: Option<String>,
    #[serde(default)]
    pub target_entity_id: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    /// 0.0 - 1.0
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicPayload {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub semantic_category: Option<String>,
    /// "high" | "medium" | "low"
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Kind-specific fields, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemPayload {
    Entity(EntityPayload),
    Relation(RelationPayload),
    Topic(TopicPayload),
}

impl ItemPayload {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemPayload::Entity(_) => ItemKind::Entity,
            ItemPayload::Relation(_) => ItemKind::Relation,
            ItemPayload::Topic(_) => ItemKind::Topic,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            ItemPayload::Entity(e) => &e.metadata,
            ItemPayload::Relation(r) => &r.metadata,
            ItemPayload::Topic(t) => &t.metadata,
        }
    }
}

/// A record subject to retrieval: an entity, relation or topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeItem {
    pub id: String,

    /// Direct owner (e.g. a company within an organization)
    #[serde(default)]
    pub owner_scope_id: Option<String>,

    /// Enclosing organization, used when no direct owner is set
    #[serde(default)]
    pub organization_id: Option<String>,

    pub payload: ItemPayload,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub sync_flag: SyncFlag,

    #[serde(default)]
    pub last_sync_error: Option<String>,
}

impl KnowledgeItem {
    pub fn new(id: impl Into<String>, scope_id: impl Into<String>, payload: ItemPayload) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_scope_id: None,
            organization_id: Some(scope_id.into()),
            payload,
            created_at: Some(now),
            updated_at: Some(now),
            sync_flag: SyncFlag::Unsynced,
            last_sync_error: None,
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.payload.kind()
    }

    pub fn strategy(&self) -> &'static KindStrategy {
        self.kind().strategy()
    }

    /// Resolve the scope this item is synced under: an explicit scope wins,
    /// then the direct owner, then the organization.
    pub fn resolve_scope(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.owner_scope_id.clone().filter(|s| !s.is_empty()))
            .or_else(|| self.organization_id.clone().filter(|s| !s.is_empty()))
    }

    pub fn scope(&self) -> Option<String> {
        self.resolve_scope(None)
    }

    /// Whether the item belongs to `scope_id` through either owner field.
    pub fn in_scope(&self, scope_id: &str) -> bool {
        self.owner_scope_id.as_deref() == Some(scope_id)
            || self.organization_id.as_deref() == Some(scope_id)
    }

    /// Human-readable label (entity name, relation type, topic title).
    pub fn display_name(&self) -> &str {
        match &self.payload {
            ItemPayload::Entity(e) => &e.name,
            ItemPayload::Relation(r) => &r.relation_type,
            ItemPayload::Topic(t) => &t.title,
        }
    }

    /// Most recent known timestamp.
    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

/// Stored vector for one item. Lives only in the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    pub item_id: String,
    pub kind: ItemKind,
    pub scope_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Embedding {
    /// Non-empty with only finite components.
    pub fn is_valid(&self) -> bool {
        !self.vector.is_empty() && self.vector.iter().all(|v| v.is_finite())
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub kind: ItemKind,
    pub id: String,
    pub similarity_score: f64,
    pub composite_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<KnowledgeItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> KnowledgeItem {
        KnowledgeItem::new(
            "e1",
            "org-1",
            ItemPayload::Entity(EntityPayload {
                name: "Acme".into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_scope_resolution_order() {
        let mut item = entity();
        assert_eq!(item.scope().as_deref(), Some("org-1"));

        item.owner_scope_id = Some("company-9".into());
        assert_eq!(item.scope().as_deref(), Some("company-9"));
        assert_eq!(item.resolve_scope(Some("explicit")).as_deref(), Some("explicit"));
        assert_eq!(item.resolve_scope(Some("")).as_deref(), Some("company-9"));

        item.owner_scope_id = None;
        item.organization_id = None;
        assert!(item.scope().is_none());
    }

    #[test]
    fn test_payload_tagged_by_kind() {
        let json = serde_json::to_value(entity()).unwrap();
        assert_eq!(json["payload"]["kind"], "entity");
        assert_eq!(json["sync_flag"], "unsynced");

        let back: KnowledgeItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ItemKind::Entity);
    }

    #[test]
    fn test_embedding_validity() {
        let mut emb = Embedding {
            item_id: "e1".into(),
            kind: ItemKind::Entity,
            scope_id: "org-1".into(),
            vector: vec![],
            model: "m".into(),
            version: "1.0".into(),
            generated_at: Utc::now(),
            metadata: serde_json::Value::Null,
        };
        assert!(!emb.is_valid());
        emb.vector = vec![0.1, f32::NAN];
        assert!(!emb.is_valid());
        emb.vector = vec![0.1, 0.2];
        assert!(emb.is_valid());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("relation".parse::<ItemKind>().unwrap(), ItemKind::Relation);
        assert!("page".parse::<ItemKind>().is_err());
    }
}
