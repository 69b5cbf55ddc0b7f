//! Consistency audit records

use super::ItemKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyType {
    /// Present in the primary store, absent from the vector index
    MissingInIndex,
    /// Present in the vector index, absent from the primary store
    OrphanInIndex,
    /// Index presence disagrees with the item's sync flag
    FlagMismatch,
}

/// A detected divergence between the two stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inconsistency {
    #[serde(rename = "type")]
    pub issue: InconsistencyType,
    pub kind: ItemKind,
    pub item_id: String,
    pub scope_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemError {
    pub kind: ItemKind,
    pub item_id: String,
    pub error: String,
}

/// Outcome of a repair or bulk pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepairReport {
    pub repaired: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl RepairReport {
    pub fn record_failure(&mut self, kind: ItemKind, item_id: &str, error: impl ToString) {
        self.failed += 1;
        self.errors.push(ItemError {
            kind,
            item_id: item_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: RepairReport) {
        self.repaired += other.repaired;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}
