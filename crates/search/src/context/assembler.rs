//! Token-budgeted context selection
//!
//! Picks results greedily by priority until the next one would overflow
//! the token budget. Items are never cut in half; the rest are dropped.

use chrono::{DateTime, Utc};
use kgrag_common::config::ContextConfig;
use kgrag_common::models::{recency_score, ItemPayload, SearchResult};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Header every assembled context starts with
pub const CONTEXT_HEADER: &str = "## 関連情報\n\n";

const SECTION_SEPARATOR: &str = "\n## ";

/// Last section is only cut short when at least this much of it fits
const MIN_TRUNCATED_SECTION: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizedContext {
    /// Selected results, highest priority first
    pub items: Vec<SearchResult>,
    pub text: String,
    pub estimated_tokens: usize,
    /// Results left out after scoring and de-duplication
    pub dropped: usize,
}

pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        (text.chars().count() as f64 * self.config.tokens_per_char).ceil() as usize
    }

    fn max_chars(&self, max_tokens: usize) -> usize {
        if self.config.tokens_per_char <= 0.0 {
            return usize::MAX;
        }
        (max_tokens as f64 / self.config.tokens_per_char).floor() as usize
    }

    pub fn optimize(
        &self,
        results: &[SearchResult],
        max_tokens: usize,
        now: DateTime<Utc>,
    ) -> OptimizedContext {
        let mut seen = HashSet::new();
        let mut ranked: Vec<(f64, &SearchResult)> = results
            .iter()
            .filter(|r| r.item.is_some() && r.composite_score >= self.config.min_score)
            .filter(|r| seen.insert(dedupe_key(r)))
            .map(|r| (priority(r, now), r))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut context = OptimizedContext::default();
        let mut tokens = self.estimate_tokens(CONTEXT_HEADER);
        if tokens > max_tokens {
            context.dropped = ranked.len();
            return context;
        }

        let mut text = String::from(CONTEXT_HEADER);
        for (index, (_, result)) in ranked.iter().enumerate() {
            let line = format!("{}\n", self.render_line(result));
            let cost = self.estimate_tokens(&line);
            if tokens + cost > max_tokens {
                context.dropped = ranked.len() - index;
                break;
            }
            tokens += cost;
            text.push_str(&line);
            context.items.push((*result).clone());
        }

        debug!(
            selected = context.items.len(),
            dropped = context.dropped,
            tokens,
            max_tokens,
            "Context optimized"
        );
        context.text = text;
        context.estimated_tokens = tokens;
        context
    }

    /// Fit an already rendered `## `-sectioned text into the budget.
    ///
    /// Earlier sections are kept whole; only the section that would
    /// overflow is cut, and only if a meaningful part of it fits.
    pub fn optimize_str(&self, text: &str, max_tokens: usize) -> String {
        let max_chars = self.max_chars(max_tokens);
        if text.chars().count() <= max_chars {
            return text.to_string();
        }

        let body = text.strip_prefix("## ").unwrap_or(text);
        let mut kept: Vec<String> = Vec::new();
        let mut used = "## ".len();

        for section in body.split(SECTION_SEPARATOR) {
            let separator = if kept.is_empty() { 0 } else { SECTION_SEPARATOR.chars().count() };
            let len = section.chars().count();
            if used + separator + len <= max_chars {
                used += separator + len;
                kept.push(section.to_string());
                continue;
            }

            let room = max_chars.saturating_sub(used + separator);
            if room > MIN_TRUNCATED_SECTION {
                let cut: String = section.chars().take(room - 3).collect();
                kept.push(format!("{}...", cut));
            }
            break;
        }

        if kept.is_empty() {
            return String::new();
        }
        format!("## {}", kept.join(SECTION_SEPARATOR))
    }

    fn render_line(&self, result: &SearchResult) -> String {
        let Some(item) = &result.item else {
            return String::new();
        };
        let body = (item.strategy().keyword_text)(&item.payload);
        let line = format!(
            "[{}] {}: {} (関連度: {:.1}%)",
            result.kind,
            item.display_name(),
            body,
            result.composite_score * 100.0
        );
        if line.chars().count() <= self.config.item_char_cap {
            return line;
        }
        line.chars().take(self.config.item_char_cap).collect()
    }
}

/// Natural key: lower-cased name for entities, id otherwise.
fn dedupe_key(result: &SearchResult) -> String {
    match result.item.as_ref().map(|i| &i.payload) {
        Some(ItemPayload::Entity(e)) => format!("entity:{}", e.name.to_lowercase()),
        _ => format!("{}:{}", result.kind, result.id),
    }
}

fn priority(result: &SearchResult, now: DateTime<Utc>) -> f64 {
    let Some(item) = &result.item else {
        return 0.0;
    };
    let importance = (item.strategy().importance)(&item.payload);
    let richness = (item.payload.metadata().len() as f64 / 10.0).min(1.0);
    0.5 * result.composite_score
        + 0.2 * recency_score(item.last_touched(), now)
        + 0.2 * importance
        + 0.1 * richness
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgrag_common::models::{EntityPayload, ItemKind, KnowledgeItem, TopicPayload};

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(ContextConfig::default())
    }

    fn entity(id: &str, name: &str, score: f64) -> SearchResult {
        SearchResult {
            kind: ItemKind::Entity,
            id: id.into(),
            similarity_score: score,
            composite_score: score,
            item: Some(KnowledgeItem::new(
                id,
                "org-1",
                ItemPayload::Entity(EntityPayload {
                    name: name.into(),
                    ..Default::default()
                }),
            )),
        }
    }

    fn topic(id: &str, content: &str, score: f64) -> SearchResult {
        SearchResult {
            kind: ItemKind::Topic,
            id: id.into(),
            similarity_score: score,
            composite_score: score,
            item: Some(KnowledgeItem::new(
                id,
                "org-1",
                ItemPayload::Topic(TopicPayload {
                    title: format!("Topic {}", id),
                    content: content.into(),
                    ..Default::default()
                }),
            )),
        }
    }

    fn sample() -> Vec<SearchResult> {
        (0..20)
            .map(|i| {
                let body = "roadmap detail ".repeat(10 + i);
                topic(&format!("t{}", i), &body, 0.4 + i as f64 / 50.0)
            })
            .collect()
    }

    #[test]
    fn test_budget_is_never_exceeded() {
        let a = assembler();
        for budget in [0, 5, 50, 120, 400, 4000] {
            let out = a.optimize(&sample(), budget, Utc::now());
            assert!(out.estimated_tokens <= budget);
            assert!(a.estimate_tokens(&out.text) <= budget);
        }
    }

    #[test]
    fn test_smaller_budget_never_selects_more() {
        let a = assembler();
        let now = Utc::now();
        let mut previous = usize::MAX;
        for budget in [4000, 1000, 400, 200, 80, 10] {
            let count = a.optimize(&sample(), budget, now).items.len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn test_dedupes_and_drops_low_scores() {
        let results = vec![
            entity("e1", "Acme", 0.9),
            entity("e2", "ACME", 0.8),
            entity("e3", "Globex", 0.1),
            entity("e4", "Initech", 0.5),
        ];
        let out = assembler().optimize(&results, 4000, Utc::now());
        let ids: Vec<&str> = out.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e4"]);
        assert!(out.text.starts_with(CONTEXT_HEADER));
        assert!(out.text.contains("(関連度: 90.0%)"));
    }

    #[test]
    fn test_lines_are_capped() {
        let long = vec![topic("t1", &"x".repeat(5000), 0.9)];
        let out = assembler().optimize(&long, 4000, Utc::now());
        let line = out.text.trim_start_matches(CONTEXT_HEADER).trim_end();
        assert_eq!(line.chars().count(), 500);
    }

    #[test]
    fn test_optimize_str_keeps_whole_sections() {
        let a = assembler();
        let text = format!(
            "## 関連エンティティ\n{}\n## 関連リレーション\n{}\n## 関連トピック\n{}",
            "a".repeat(100),
            "b".repeat(300),
            "c".repeat(300)
        );
        assert_eq!(a.optimize_str(&text, 4000), text);

        // 200 chars: first section whole, second too short to be worth cutting
        let out = a.optimize_str(&text, 50);
        assert!(out.starts_with("## 関連エンティティ"));
        assert!(!out.contains("関連リレーション"));
        assert!(out.chars().count() <= 200);

        // 400 chars: second section truncated with an ellipsis
        let out = a.optimize_str(&text, 100);
        assert!(out.contains("## 関連リレーション"));
        assert!(out.ends_with("..."));
        assert!(!out.contains("関連トピック"));
        assert!(out.chars().count() <= 400);
    }
}
