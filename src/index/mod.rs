//! In-memory similarity index over entry embeddings.
//!
//! A derived cache of the versioned store, never the system of record:
//! rebuilt from `replay_latest` at startup and kept in sync by the same
//! code paths that commit, strictly after each commit succeeds.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::domain::MemoryEntry;

/// Cosine similarity between two vectors, in [-1, 1].
///
/// Zero-norm inputs score 0.0 against everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Cosine distance, the clustering metric: `1 - cosine_similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Top-k cosine-similarity index with importance filtering.
#[derive(Debug, Default)]
pub struct SimilarityIndex {
    entries: RwLock<HashMap<Uuid, MemoryEntry>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn upsert(&self, entry: MemoryEntry) {
        self.entries
            .write()
            .expect("index lock poisoned")
            .insert(entry.id, entry);
    }

    /// Drop an entry from the index (pruned, superseded, or deleted).
    pub fn remove(&self, id: Uuid) {
        self.entries.write().expect("index lock poisoned").remove(&id);
    }

    /// Look up one indexed entry by id.
    pub fn get(&self, id: Uuid) -> Option<MemoryEntry> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all indexed entries, in no particular order.
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Replace the whole index, e.g. after a startup replay.
    pub fn rebuild(&self, entries: impl IntoIterator<Item = MemoryEntry>) {
        let mut map = self.entries.write().expect("index lock poisoned");
        map.clear();
        for entry in entries {
            map.insert(entry.id, entry);
        }
    }

    /// Top-`k` entries by cosine similarity against `vector`, restricted to
    /// `importance >= min_importance`. Ties break by descending importance,
    /// then by most recent access.
    pub fn query(&self, vector: &[f32], k: usize, min_importance: f64) -> Vec<(MemoryEntry, f32)> {
        if k == 0 {
            return Vec::new();
        }

        let guard = self.entries.read().expect("index lock poisoned");
        let mut scored: Vec<(MemoryEntry, f32)> = guard
            .values()
            .filter(|entry| entry.importance >= min_importance)
            .map(|entry| {
                let score = cosine_similarity(vector, &entry.embedding);
                (entry.clone(), score)
            })
            .collect();
        drop(guard);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.0.importance
                        .partial_cmp(&a.0.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.0.last_accessed_at.cmp(&a.0.last_accessed_at))
        });
        scored.truncate(k);
        scored
    }
}

// =============================================================================
// Tests
// =============================================================================
