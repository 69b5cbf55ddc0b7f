//! Query processor - normalizes, classifies, rewrites and expands queries
//!
//! Provides:
//! - Normalization (full-width folding, whitespace, boundary punctuation)
//! - Rule-based intent classification
//! - Intent-specific rewriting
//! - Synonym expansion

use kgrag_common::errors::{AppError, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Synonym table, in lookup order.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("会社", &["企業", "法人", "コーポレーション", "corporation", "company"]),
    ("企業", &["会社", "法人", "コーポレーション", "corporation", "company"]),
    ("組織", &["団体", "機関", "organization", "org"]),
    ("ベルシステム24", &["BS24", "ベルシステム", "Bell System 24", "bell system"]),
    ("BS24", &["ベルシステム24", "ベルシステム", "Bell System 24"]),
    ("トヨタ", &["トヨタ自動車", "Toyota", "toyota"]),
    ("トヨタ自動車", &["トヨタ", "Toyota", "toyota"]),
    ("部長", &["マネージャー", "manager", "マネージャ"]),
    ("課長", &["リーダー", "leader", "チームリーダー"]),
    ("社長", &["CEO", "代表取締役", "president"]),
    ("担当者", &["責任者", "オーナー", "owner", "responsible"]),
    ("プロジェクト", &["施策", "計画", "project", "initiative"]),
    ("施策", &["プロジェクト", "計画", "initiative", "project"]),
    ("計画", &["プロジェクト", "施策", "plan", "project"]),
    ("AI施策", &["AIプロジェクト", "AI計画", "AI活用", "AI導入", "artificial intelligence"]),
    ("AI活用", &["AI施策", "AI導入", "AI利用", "AI応用"]),
    ("システム", &["アプリケーション", "アプリ", "application", "app"]),
    ("ツール", &["ソフトウェア", "アプリケーション", "software", "tool"]),
    ("技術", &["テクノロジー", "technology", "tech"]),
    ("関連", &["関係", "つながり", "related", "relation", "connection"]),
    ("関係", &["関連", "つながり", "relation", "related", "connection"]),
    ("提携", &["パートナーシップ", "協力", "partnership", "collaboration"]),
    ("出資", &["投資", "investment", "invest"]),
    ("子会社", &["サブシディアリー", "subsidiary"]),
    ("最新", &["最近", "新しく", "recent", "latest", "new"]),
    ("最近", &["最新", "新しく", "recent", "latest"]),
    ("重要", &["優先", "緊急", "important", "priority", "critical"]),
    ("優先", &["重要", "緊急", "priority", "important"]),
];

const DOC_CUES: &[&str] = &[
    "システム設計",
    "アーキテクチャ",
    "architecture",
    "設計",
    "実装",
    "tauri",
    "chromadb",
    "データベース",
];
const RELATION_CUES: &[&str] = &[
    "関係",
    "関連",
    "つながり",
    "提携",
    "出資",
    "子会社",
    "relation",
    "related",
    "partnership",
];
const TOPIC_CUES: &[&str] = &["議事録", "会議", "トピック", "meeting", "topic", "議題"];
const ENTITY_CUES: &[&str] = &["会社", "企業", "人", "担当者", "部長", "課長"];

/// Word characters: ASCII word chars, hiragana, katakana and common kanji.
const BOUNDARY_PATTERN: &str = r"^[^\w\x{3040}-\x{309F}\x{30A0}-\x{30FF}\x{4E00}-\x{9FAF}]+|[^\w\x{3040}-\x{309F}\x{30A0}-\x{30FF}\x{4E00}-\x{9FAF}]+$";
const ASCII_ONLY_PATTERN: &str = r"^[A-Za-z0-9\s]+$";

/// Detected search intent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    EntitySearch,
    RelationSearch,
    TopicSearch,
    /// Design or architecture documents
    StructuredDocSearch,
    GeneralSearch,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::EntitySearch => "entity_search",
            QueryIntent::RelationSearch => "relation_search",
            QueryIntent::TopicSearch => "topic_search",
            QueryIntent::StructuredDocSearch => "structured_doc_search",
            QueryIntent::GeneralSearch => "general_search",
        }
    }
}

/// Query processing result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedQuery {
    pub original: String,
    pub normalized: String,
    /// Primary search text
    pub rewritten: String,
    /// Original first, then synonym variants
    pub expanded: Vec<String>,
    pub intent: QueryIntent,
}

impl ProcessedQuery {
    /// The rewritten text followed by the distinct expansion variants.
    pub fn variants(&self) -> Vec<&str> {
        let mut variants = vec![self.rewritten.as_str()];
        for variant in &self.expanded {
            if !variants.contains(&variant.as_str()) {
                variants.push(variant);
            }
        }
        variants
    }
}

#[derive(Debug, Clone)]
pub struct QueryProcessorConfig {
    pub enable_expansion: bool,
    /// Upper bound on variants added to the original query
    pub max_expansions: usize,
}

impl Default for QueryProcessorConfig {
    fn default() -> Self {
        Self {
            enable_expansion: true,
            max_expansions: 3,
        }
    }
}

pub struct QueryProcessor {
    config: QueryProcessorConfig,
    boundary: Regex,
    ascii_only: Regex,
}

impl QueryProcessor {
    pub fn new(config: QueryProcessorConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Internal {
                message: format!("invalid query pattern: {}", e),
            })
        };
        Ok(Self {
            config,
            boundary: compile(BOUNDARY_PATTERN)?,
            ascii_only: compile(ASCII_ONLY_PATTERN)?,
        })
    }

    pub fn process(&self, text: &str) -> ProcessedQuery {
        let normalized = self.normalize(text);
        let intent = self.detect_intent(&normalized);
        let rewritten = self.rewrite(&normalized, intent);
        let expanded = if self.config.enable_expansion {
            self.expand(&normalized, self.config.max_expansions)
        } else {
            vec![normalized.clone()]
        };
        ProcessedQuery {
            original: text.to_string(),
            normalized,
            rewritten,
            expanded,
            intent,
        }
    }

    pub fn normalize(&self, text: &str) -> String {
        let folded: String = text.trim().chars().map(fold_full_width).collect();
        let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
        self.boundary.replace_all(&collapsed, "").into_owned()
    }

    /// Precedence: doc cues, relation cues, topic cues, entity heuristics.
    pub fn detect_intent(&self, text: &str) -> QueryIntent {
        let lower = text.to_lowercase();
        let has_any = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));

        if has_any(DOC_CUES) {
            QueryIntent::StructuredDocSearch
        } else if has_any(RELATION_CUES) {
            QueryIntent::RelationSearch
        } else if has_any(TOPIC_CUES) {
            QueryIntent::TopicSearch
        } else if self.ascii_only.is_match(&lower) || has_any(ENTITY_CUES) {
            QueryIntent::EntitySearch
        } else {
            QueryIntent::GeneralSearch
        }
    }

    /// Idempotent: rewriting a rewritten query changes nothing.
    pub fn rewrite(&self, text: &str, intent: QueryIntent) -> String {
        let text = text.trim();
        let append_unless = |present: [&str; 2], extra: &str| {
            if present.iter().any(|p| text.contains(p)) {
                text.to_string()
            } else {
                format!("{} {}", text, extra)
            }
        };

        match intent {
            QueryIntent::EntitySearch => {
                let words: Vec<&str> = text.split_whitespace().collect();
                match (words.as_slice(), words.first().and_then(|w| synonyms_of(w))) {
                    ([word], Some(synonyms)) => {
                        let mut parts = vec![*word];
                        parts.extend(synonyms.iter().take(2));
                        parts.join(" ")
                    }
                    _ => text.to_string(),
                }
            }
            QueryIntent::RelationSearch => append_unless(["関係", "関連"], "関係 関連"),
            QueryIntent::TopicSearch => append_unless(["議事録", "会議"], "議事録 会議"),
            QueryIntent::StructuredDocSearch => append_unless(["システム", "設計"], "システム 設計"),
            QueryIntent::GeneralSearch => text.to_string(),
        }
    }

    /// The original text followed by at most `max_expansions` distinct
    /// synonym-appended and synonym-substituted variants.
    pub fn expand(&self, text: &str, max_expansions: usize) -> Vec<String> {
        let lowered = text.trim().to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        let mut synonyms: Vec<&'static str> = Vec::new();
        for word in &words {
            for (key, values) in SYNONYMS {
                let key = key.to_lowercase();
                if *word == key || word.contains(key.as_str()) || key.contains(word) {
                    for value in values.iter().take(max_expansions) {
                        if !synonyms.contains(value) && !lowered.contains(&value.to_lowercase()) {
                            synonyms.push(*value);
                        }
                    }
                }
            }
        }

        let mut variants = vec![text.to_string()];
        for synonym in synonyms.iter().take(max_expansions) {
            variants.push(format!("{} {}", text, synonym));

            let mut replaced = false;
            let substituted: Vec<&str> = words
                .iter()
                .map(|word| match synonyms_of(word) {
                    Some(values) if values.contains(synonym) => {
                        replaced = true;
                        *synonym
                    }
                    _ => *word,
                })
                .collect();
            if replaced {
                variants.push(substituted.join(" "));
            }
        }

        let mut unique: Vec<String> = Vec::with_capacity(variants.len());
        for variant in variants {
            if !unique.contains(&variant) {
                unique.push(variant);
            }
        }
        unique.truncate(max_expansions + 1);
        unique
    }
}

fn synonyms_of(word: &str) -> Option<&'static [&'static str]> {
    SYNONYMS
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(word))
        .map(|(_, values)| *values)
}

/// Full-width ASCII letters and digits to their half-width forms.
fn fold_full_width(c: char) -> char {
    match c {
        'Ａ'..='Ｚ' | 'ａ'..='ｚ' | '０'..='９' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> QueryProcessor {
        QueryProcessor::new(QueryProcessorConfig::default()).unwrap()
    }

    #[test]
    fn test_normalize_folds_and_trims() {
        let p = processor();
        assert_eq!(p.normalize("  ＡＢＣ１２３\u{3000}\u{3000}トヨタ！"), "ABC123 トヨタ");
        assert_eq!(p.normalize("「会議」"), "会議");
        assert_eq!(p.normalize("   "), "");
    }

    #[test]
    fn test_intent_precedence() {
        let p = processor();
        assert_eq!(p.detect_intent("設計の関係"), QueryIntent::StructuredDocSearch);
        assert_eq!(p.detect_intent("A社との提携"), QueryIntent::RelationSearch);
        assert_eq!(p.detect_intent("先週の会議"), QueryIntent::TopicSearch);
        assert_eq!(p.detect_intent("Acme Corp"), QueryIntent::EntitySearch);
        assert_eq!(p.detect_intent("営業部の担当者"), QueryIntent::EntitySearch);
        assert_eq!(p.detect_intent("売上の推移"), QueryIntent::GeneralSearch);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let p = processor();
        for (text, intent) in [
            ("A社との提携", QueryIntent::RelationSearch),
            ("先週の打ち合わせ", QueryIntent::TopicSearch),
            ("認証", QueryIntent::StructuredDocSearch),
            ("トヨタ", QueryIntent::EntitySearch),
            ("売上", QueryIntent::GeneralSearch),
        ] {
            let once = p.rewrite(text, intent);
            assert_eq!(p.rewrite(&once, intent), once, "not idempotent for {}", text);
        }
        assert_eq!(p.rewrite("トヨタ", QueryIntent::EntitySearch), "トヨタ トヨタ自動車 Toyota");
        assert_eq!(p.rewrite("A社との関係", QueryIntent::RelationSearch), "A社との関係");
        assert_eq!(p.rewrite("A社との提携", QueryIntent::RelationSearch), "A社との提携 関係 関連");
    }

    #[test]
    fn test_expand_is_bounded_and_unique() {
        let p = processor();
        let expanded = p.expand("部長 会社", 3);
        assert_eq!(expanded[0], "部長 会社");
        assert!(expanded.len() <= 4);
        let mut deduped = expanded.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), expanded.len());
        assert!(expanded.contains(&"部長 会社 マネージャー".to_string()));
        assert!(expanded.contains(&"マネージャー 会社".to_string()));

        assert_eq!(p.expand("zzz", 3), vec!["zzz".to_string()]);
    }

    #[test]
    fn test_process_pipeline() {
        let p = processor();
        let q = p.process("  A社との提携！ ");
        assert_eq!(q.normalized, "A社との提携");
        assert_eq!(q.intent, QueryIntent::RelationSearch);
        assert_eq!(q.rewritten, "A社との提携 関係 関連");
        assert_eq!(q.expanded[0], "A社との提携");

        let variants = q.variants();
        assert_eq!(variants[0], q.rewritten);
        assert!(variants.contains(&"A社との提携"));
        assert!(variants.contains(&"A社との提携 パートナーシップ"));
    }
}
