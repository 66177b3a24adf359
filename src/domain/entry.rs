//! Core value types: the memory entry and the read models derived from it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lower bound of the importance range.
pub const IMPORTANCE_MIN: f64 = 0.0;
/// Upper bound of the importance range.
pub const IMPORTANCE_MAX: f64 = 10.0;

/// One stored memory record.
///
/// `id` is assigned at creation and never reused, including after pruning.
/// `embedding` always has the store-wide configured dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub content: String,
    pub embedding: Vec<f32>,
    /// Clamped to `[IMPORTANCE_MIN, IMPORTANCE_MAX]` on every write.
    pub importance: f64,
    pub tags: BTreeSet<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Increments on every durable write of this logical record.
    pub version: u64,
    /// When the decay pass last aged this entry. Incremental decay measures
    /// elapsed time from `max(last_accessed_at, decayed_at)` so repeated
    /// passes compose to the closed-form exponential since last access.
    #[serde(default)]
    pub decayed_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Clamp an importance score into the valid range.
    pub fn clamp_importance(value: f64) -> f64 {
        value.clamp(IMPORTANCE_MIN, IMPORTANCE_MAX)
    }

    /// Baseline instant the next decay step measures elapsed time from.
    pub fn decay_baseline(&self) -> DateTime<Utc> {
        match self.decayed_at {
            Some(decayed) => decayed.max(self.last_accessed_at),
            None => self.last_accessed_at,
        }
    }
}

/// Lifecycle state of a logical entry in the versioned store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Live: indexed and retrievable.
    Active,
    /// Replaced by a consolidation representative; kept for history.
    Superseded,
    /// Pruned or explicitly deleted; kept for history.
    Deleted,
}

/// Kind of durable write, recorded in every commit for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Merge,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Merge => "merge",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A retrieval result: the entry plus how it scored against the query.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    /// Raw cosine similarity against the query vector, in [-1, 1].
    pub similarity: f32,
    /// Importance-weighted rank score used for the final ordering.
    pub score: f32,
}

/// Outcome of one consolidation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationSummary {
    /// Entries superseded into cluster representatives this cycle.
    pub merged: usize,
    /// Entries whose importance fell below the floor and were deleted.
    pub pruned: usize,
}

/// Aggregate statistics over the live entries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub average_importance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_clamps_to_range() {
        assert_eq!(MemoryEntry::clamp_importance(-1.0), IMPORTANCE_MIN);
        assert_eq!(MemoryEntry::clamp_importance(15.0), IMPORTANCE_MAX);
        assert_eq!(MemoryEntry::clamp_importance(5.5), 5.5);
    }

    #[test]
    fn decay_baseline_prefers_latest_instant() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(10);

        let mut entry = MemoryEntry {
            id: Uuid::new_v4(),
            content: "x".to_string(),
            embedding: vec![1.0],
            importance: 1.0,
            tags: BTreeSet::new(),
            source: "test".to_string(),
            created_at: earlier,
            last_accessed_at: earlier,
            access_count: 0,
            version: 1,
            decayed_at: None,
        };
        assert_eq!(entry.decay_baseline(), earlier);

        entry.decayed_at = Some(later);
        assert_eq!(entry.decay_baseline(), later);

        entry.last_accessed_at = later + chrono::Duration::seconds(5);
        assert_eq!(entry.decay_baseline(), entry.last_accessed_at);
    }
}
