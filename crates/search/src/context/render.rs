//! Rendering selected results into the context text
//!
//! Output is grouped into entity, relation and topic sections. Relation
//! endpoints are shown by entity name, looked up in batches.

use futures::stream::{self, StreamExt};
use kgrag_common::models::{ItemKind, ItemPayload, KnowledgeItem, SearchResult};
use kgrag_common::store::Conditions;
use kgrag_common::PrimaryStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

use super::CONTEXT_HEADER;

const TOPIC_SUMMARY_CAP: usize = 800;
const LOOKUP_BATCH: usize = 10;

/// One item the rendered context draws on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSource {
    pub kind: ItemKind,
    pub id: String,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedContext {
    pub text: String,
    pub sources: Vec<ContextSource>,
}

pub struct ContextRenderer {
    primary: Arc<dyn PrimaryStore>,
    concurrency: usize,
}

impl ContextRenderer {
    pub fn new(primary: Arc<dyn PrimaryStore>, concurrency: usize) -> Self {
        Self {
            primary,
            concurrency: concurrency.max(1),
        }
    }

    /// Results without a loaded record are skipped.
    pub async fn render(&self, results: &[SearchResult]) -> RenderedContext {
        let of_kind = |kind: ItemKind| {
            results
                .iter()
                .filter(|r| r.kind == kind)
                .filter_map(|r| r.item.as_ref().map(|item| (r, item)))
                .collect::<Vec<_>>()
        };
        let entities = of_kind(ItemKind::Entity);
        let relations = of_kind(ItemKind::Relation);
        let topics = of_kind(ItemKind::Topic);

        let mut sections: Vec<String> = Vec::new();
        let mut sources = Vec::new();

        if !entities.is_empty() {
            let mut out = String::from("## 関連エンティティ\n");
            for (result, item) in entities {
                let ItemPayload::Entity(entity) = &item.payload else {
                    continue;
                };
                let entity_type = entity.entity_type.as_deref().unwrap_or("unknown");
                let _ = writeln!(
                    out,
                    "- **{}** ({}){}",
                    entity.name,
                    entity_type,
                    score_text(result)
                );
                if !entity.aliases.is_empty() {
                    let _ = writeln!(out, "  エイリアス: {}", entity.aliases.join(", "));
                }
                for (field, label) in [
                    ("description", "説明"),
                    ("industry", "業界"),
                    ("role", "役割"),
                    ("department", "部署"),
                ] {
                    if let Some(value) = entity.metadata.get(field).and_then(|v| v.as_str()) {
                        let _ = writeln!(out, "  {}: {}", label, value);
                    }
                }
                sources.push(source(result, entity.name.clone()));
            }
            sections.push(out);
        }

        if !relations.is_empty() {
            let names = self.endpoint_names(&relations).await;
            let name_of = |id: &Option<String>| id.as_ref().and_then(|id| names.get(id)).cloned();

            let mut out = String::from("## 関連リレーション\n");
            for (result, item) in relations {
                let ItemPayload::Relation(relation) = &item.payload else {
                    continue;
                };
                let _ = writeln!(out, "- **{}**{}", relation.relation_type, score_text(result));

                let source_name = name_of(&relation.source_entity_id);
                let target_name = name_of(&relation.target_entity_id);
                match (&source_name, &target_name) {
                    (Some(s), Some(t)) => {
                        let _ = writeln!(out, "  {} → {}", s, t);
                    }
                    (Some(s), None) => {
                        let _ = writeln!(out, "  起点: {}", s);
                    }
                    (None, Some(t)) => {
                        let _ = writeln!(out, "  終点: {}", t);
                    }
                    (None, None) => {}
                }
                if let Some(description) = &relation.description {
                    let _ = writeln!(out, "  説明: {}", description);
                }
                if let Some(confidence) = relation.confidence {
                    let _ = writeln!(out, "  信頼度: {:.1}%", confidence * 100.0);
                }

                let label = format!(
                    "{}: {} → {}",
                    relation.relation_type,
                    source_name.as_deref().unwrap_or("起点エンティティ"),
                    target_name.as_deref().unwrap_or("終点エンティティ")
                );
                sources.push(source(result, label));
            }
            sections.push(out);
        }

        if !topics.is_empty() {
            let mut out = String::from("## 関連トピック\n");
            for (result, item) in topics {
                let ItemPayload::Topic(topic) = &item.payload else {
                    continue;
                };
                let _ = writeln!(out, "- **{}**{}", topic.title, score_text(result));
                let summary = topic.summary.as_deref().unwrap_or(&topic.content);
                if !summary.is_empty() {
                    let _ = writeln!(out, "  内容: {}", cap(summary, TOPIC_SUMMARY_CAP));
                }
                if let Some(category) = &topic.semantic_category {
                    let _ = writeln!(out, "  カテゴリ: {}", category);
                }
                if !topic.keywords.is_empty() {
                    let _ = writeln!(out, "  キーワード: {}", topic.keywords.join(", "));
                }
                sources.push(source(result, topic.title.clone()));
            }
            sections.push(out);
        }

        if sections.is_empty() {
            return RenderedContext::default();
        }
        RenderedContext {
            text: format!("{}{}", CONTEXT_HEADER, sections.join("\n")),
            sources,
        }
    }

    /// Entity id to name for every relation endpoint. Failed batches are
    /// logged and left out.
    async fn endpoint_names(
        &self,
        relations: &[(&SearchResult, &KnowledgeItem)],
    ) -> HashMap<String, String> {
        let ids: BTreeSet<String> = relations
            .iter()
            .filter_map(|(_, item)| match &item.payload {
                ItemPayload::Relation(r) => {
                    Some([r.source_entity_id.clone(), r.target_entity_id.clone()])
                }
                _ => None,
            })
            .flatten()
            .flatten()
            .collect();
        if ids.is_empty() {
            return HashMap::new();
        }

        let ids: Vec<String> = ids.into_iter().collect();
        let lookups: Vec<_> = ids
            .chunks(LOOKUP_BATCH)
            .map(<[String]>::to_vec)
            .map(|chunk| {
                let primary = Arc::clone(&self.primary);
                async move {
                    let conditions = Conditions {
                        ids: Some(chunk),
                        ..Default::default()
                    };
                    primary.query_by_conditions(ItemKind::Entity, &conditions).await
                }
            })
            .collect();
        let batches: Vec<_> = stream::iter(lookups)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut names = HashMap::new();
        for batch in batches {
            match batch {
                Ok(entities) => names.extend(
                    entities
                        .into_iter()
                        .map(|e| (e.id.clone(), e.display_name().to_string())),
                ),
                Err(e) => warn!(error = %e, "Relation endpoint lookup failed"),
            }
        }
        names
    }
}

fn score_text(result: &SearchResult) -> String {
    if result.composite_score.is_finite() {
        format!(" (関連度: {:.1}%)", result.composite_score * 100.0)
    } else {
        String::new()
    }
}

fn source(result: &SearchResult, name: String) -> ContextSource {
    ContextSource {
        kind: result.kind,
        id: result.id.clone(),
        name,
        score: if result.composite_score.is_finite() {
            result.composite_score
        } else {
            0.0
        },
    }
}

fn cap(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
