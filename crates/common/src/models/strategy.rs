//! Per-kind strategy table
//!
//! Each kind declares which payload fields feed its embedding, how its
//! embedding and probe text is built, and how importance and metadata
//! richness are scored.

use super::{ItemKind, ItemPayload, KnowledgeItem, Metadata};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Behaviour table for one item kind.
pub struct KindStrategy {
    pub kind: ItemKind,
    /// Payload fields whose change requires a new embedding
    pub relevant_fields: &'static [&'static str],
    /// Text the stored embedding is generated from
    pub embedding_text: fn(&ItemPayload) -> String,
    /// Short text used to look the item up by similarity
    pub probe_text: fn(&ItemPayload) -> String,
    /// Text matched against query terms in keyword search
    pub keyword_text: fn(&ItemPayload) -> String,
    /// 0.0 - 1.0
    pub importance: fn(&ItemPayload) -> f64,
    /// 0.0 - 1.0, given the configured boost fields
    pub metadata_score: fn(&ItemPayload, &[String]) -> f64,
}

const ENTITY_METADATA_KEYS: &[&str] =
    &["role", "department", "position", "industry", "email", "website"];
const TOPIC_CONTENT_CAP: usize = 2000;

static ENTITY: KindStrategy = KindStrategy {
    kind: ItemKind::Entity,
    relevant_fields: &["name", "aliases", "metadata", "entity_type"],
    embedding_text: entity_embedding_text,
    probe_text: entity_probe_text,
    keyword_text: entity_keyword_text,
    importance: |_| 0.5,
    metadata_score: entity_metadata_score,
};

static RELATION: KindStrategy = KindStrategy {
    kind: ItemKind::Relation,
    relevant_fields: &["description", "relation_type", "metadata"],
    embedding_text: relation_embedding_text,
    probe_text: relation_probe_text,
    keyword_text: relation_keyword_text,
    importance: relation_importance,
    metadata_score: relation_metadata_score,
};

static TOPIC: KindStrategy = KindStrategy {
    kind: ItemKind::Topic,
    relevant_fields: &["title", "content", "keywords", "metadata"],
    embedding_text: topic_embedding_text,
    probe_text: topic_probe_text,
    keyword_text: topic_keyword_text,
    importance: topic_importance,
    metadata_score: topic_metadata_score,
};

impl ItemKind {
    pub fn strategy(&self) -> &'static KindStrategy {
        match self {
            ItemKind::Entity => &ENTITY,
            ItemKind::Relation => &RELATION,
            ItemKind::Topic => &TOPIC,
        }
    }
}

fn string_values(metadata: &Metadata) -> impl Iterator<Item = &str> {
    metadata.values().filter_map(Value::as_str).filter(|s| !s.is_empty())
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

/// Boost fields present in `metadata`.
pub fn present_boost_fields<'a>(metadata: &Metadata, boost_fields: &'a [String]) -> Vec<&'a str> {
    boost_fields
        .iter()
        .filter(|f| is_present(metadata.get(f.as_str())))
        .map(String::as_str)
        .collect()
}

fn boost_ratio(present: usize, boost_fields: &[String]) -> f64 {
    if boost_fields.is_empty() {
        0.0
    } else {
        present as f64 / boost_fields.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

fn entity_embedding_text(payload: &ItemPayload) -> String {
    let ItemPayload::Entity(e) = payload else {
        return String::new();
    };
    let mut parts = vec![e.name.as_str(); 3];
    parts.extend(e.aliases.iter().map(String::as_str));
    if let Some(t) = e.entity_type.as_deref() {
        parts.push(t);
    }
    parts.extend(
        ENTITY_METADATA_KEYS
            .iter()
            .filter_map(|k| e.metadata.get(*k).and_then(Value::as_str)),
    );
    parts.join(" ")
}

fn entity_probe_text(payload: &ItemPayload) -> String {
    match payload {
        ItemPayload::Entity(e) => e.name.clone(),
        _ => String::new(),
    }
}

fn entity_keyword_text(payload: &ItemPayload) -> String {
    let ItemPayload::Entity(e) = payload else {
        return String::new();
    };
    let mut parts = vec![e.name.as_str()];
    parts.extend(e.aliases.iter().map(String::as_str));
    parts.extend(e.entity_type.as_deref());
    parts.extend(string_values(&e.metadata));
    parts.join(" ")
}

fn entity_metadata_score(payload: &ItemPayload, boost_fields: &[String]) -> f64 {
    let ItemPayload::Entity(e) = payload else {
        return 0.0;
    };
    let present = present_boost_fields(&e.metadata, boost_fields);
    let mut score: f64 = present
        .iter()
        .map(|f| match e.metadata.get(*f).and_then(Value::as_str) {
            Some(s) if s.chars().count() > 10 => 0.1,
            _ => 0.05,
        })
        .sum();
    score += boost_ratio(present.len(), boost_fields) * 0.5;
    score += (e.metadata.len() as f64 / 10.0).min(0.3);
    score += (e.aliases.len() as f64 / 5.0).min(0.1);
    score.min(1.0)
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

fn relation_embedding_text(payload: &ItemPayload) -> String {
    let ItemPayload::Relation(r) = payload else {
        return String::new();
    };
    let mut parts = vec![r.relation_type.as_str(); 3];
    parts.extend(r.description.as_deref());
    parts.extend(string_values(&r.metadata));
    parts.join(" ")
}

fn relation_probe_text(payload: &ItemPayload) -> String {
    match payload {
        ItemPayload::Relation(r) => r
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| r.relation_type.clone()),
        _ => String::new(),
    }
}

fn relation_keyword_text(payload: &ItemPayload) -> String {
    let ItemPayload::Relation(r) = payload else {
        return String::new();
    };
    let mut parts = vec![r.relation_type.as_str()];
    parts.extend(r.description.as_deref());
    parts.extend(string_values(&r.metadata));
    parts.join(" ")
}

fn relation_importance(payload: &ItemPayload) -> f64 {
    match payload {
        ItemPayload::Relation(r) => r.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn relation_metadata_score(payload: &ItemPayload, boost_fields: &[String]) -> f64 {
    let ItemPayload::Relation(r) = payload else {
        return 0.0;
    };
    let present = present_boost_fields(&r.metadata, boost_fields);
    let mut score: f64 = present
        .iter()
        .map(|f| match *f {
            "date" | "amount" | "percentage" => 0.15,
            _ => 0.05,
        })
        .sum();
    score += boost_ratio(present.len(), boost_fields) * 0.5;
    score += match r.description.as_deref().map(|d| d.chars().count()) {
        Some(n) if n > 200 => 0.2,
        Some(n) if n > 100 => 0.1,
        Some(n) if n > 0 => 0.05,
        _ => 0.0,
    };
    score += r.confidence.unwrap_or(0.0).clamp(0.0, 1.0) * 0.2;
    score.min(1.0)
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

fn topic_embedding_text(payload: &ItemPayload) -> String {
    let ItemPayload::Topic(t) = payload else {
        return String::new();
    };
    let content: String = t.content.chars().take(TOPIC_CONTENT_CAP).collect();
    let mut parts = vec![t.title.as_str()];
    parts.extend(t.keywords.iter().map(String::as_str));
    parts.extend(t.summary.as_deref());
    parts.push(&content);
    parts.join(" ")
}

fn topic_probe_text(payload: &ItemPayload) -> String {
    match payload {
        ItemPayload::Topic(t) => t.title.clone(),
        _ => String::new(),
    }
}

fn topic_keyword_text(payload: &ItemPayload) -> String {
    let ItemPayload::Topic(t) = payload else {
        return String::new();
    };
    let mut parts = vec![t.title.as_str()];
    parts.extend(t.keywords.iter().map(String::as_str));
    parts.extend(t.semantic_category.as_deref());
    parts.extend(t.summary.as_deref());
    parts.push(&t.content);
    parts.join(" ")
}

fn topic_importance(payload: &ItemPayload) -> f64 {
    match payload {
        ItemPayload::Topic(t) => match t.importance.as_deref() {
            Some("high") => 1.0,
            Some("medium") => 0.6,
            Some("low") => 0.3,
            _ => 0.5,
        },
        _ => 0.0,
    }
}

fn topic_metadata_score(payload: &ItemPayload, boost_fields: &[String]) -> f64 {
    let ItemPayload::Topic(t) = payload else {
        return 0.0;
    };
    let present = present_boost_fields(&t.metadata, boost_fields);
    let mut score = present.len() as f64 * 0.05;
    score += boost_ratio(present.len(), boost_fields) * 0.5;
    score += (t.keywords.len() as f64 / 10.0).min(0.2);
    if t.summary.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 0.1;
    }
    score += (t.metadata.len() as f64 / 10.0).min(0.2);
    score.min(1.0)
}

// ---------------------------------------------------------------------------
// Shared scoring
// ---------------------------------------------------------------------------

/// Recency in 0.0 - 1.0 from the age of `timestamp`. Missing timestamps score 0.
pub fn recency_score(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(ts) = timestamp else {
        return 0.0;
    };
    let days = (now - ts).num_seconds().max(0) as f64 / 86_400.0;
    if days < 30.0 {
        1.0
    } else if days < 90.0 {
        0.8
    } else if days < 180.0 {
        0.6
    } else if days < 365.0 {
        0.4
    } else {
        (0.2 - (days - 365.0) / 730.0).max(0.0)
    }
}

/// Whether an update touched any field that feeds the item's embedding.
///
/// With neither `previous` nor `updated_fields` every call counts as a change.
/// With only `updated_fields`, naming a relevant field counts. With
/// `previous`, the relevant fields (restricted to `updated_fields` when
/// given) are compared by value.
pub fn has_relevant_changes(
    previous: Option<&KnowledgeItem>,
    current: &KnowledgeItem,
    updated_fields: Option<&[String]>,
) -> bool {
    if previous.is_none() && updated_fields.is_none() {
        return true;
    }

    let fields: Vec<&str> = current
        .strategy()
        .relevant_fields
        .iter()
        .copied()
        .filter(|f| updated_fields.map_or(true, |u| u.iter().any(|n| n.as_str() == *f)))
        .collect();

    let Some(previous) = previous else {
        return !fields.is_empty();
    };
    if previous.kind() != current.kind() {
        return true;
    }

    let (Ok(before), Ok(after)) = (
        serde_json::to_value(&previous.payload),
        serde_json::to_value(&current.payload),
    ) else {
        return true;
    };

    fields.iter().any(|f| {
        before.get(*f).unwrap_or(&Value::Null) != after.get(*f).unwrap_or(&Value::Null)
    })
}
