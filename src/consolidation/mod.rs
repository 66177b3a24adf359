//! Decay & consolidation engine.
//!
//! One cycle runs two passes over the live index:
//!
//! 1. **Decay** ages every entry's importance by a half-life exponential of
//!    the time elapsed since it was last accessed (or last decayed), and
//!    prunes entries that sink below the relevance floor.
//! 2. **Consolidation** clusters the remainder by embedding density and
//!    replaces each qualifying cluster with one synthesized representative.
//!
//! Every mutation goes through the versioned store's ordinary commit path,
//! so foreground calls are never blocked for longer than a single commit.

pub mod dbscan;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ConsolidationSummary, MemoryEntry};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::index::SimilarityIndex;
use crate::store::{VersionedRecord, VersionedStore};

pub use dbscan::{ClusterOutcome, DbscanClusterer, DbscanConfig};

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Importance half-life in seconds.
    pub half_life_secs: u64,
    /// Entries decaying below this importance are pruned.
    pub prune_floor: f64,
    /// Clustering parameters.
    pub dbscan: DbscanConfig,
}

/// Background aging and merging over the memory store.
pub struct ConsolidationEngine {
    store: Arc<VersionedStore>,
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
}

impl std::fmt::Debug for ConsolidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationEngine")
            .field("config", &self.config)
            .finish()
    }
}

/// Exponential decay factor for `elapsed_secs` against a half-life.
fn decay_factor(elapsed_secs: f64, half_life_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 || half_life_secs <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(elapsed_secs / half_life_secs)
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<VersionedStore>,
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            config,
        }
    }

    /// Run one decay + consolidation cycle.
    ///
    /// `cancel` is checked between work units, never mid-commit; a cancelled
    /// cycle returns what it accomplished so far.
    pub async fn run_cycle(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<ConsolidationSummary> {
        let pruned = self.decay_pass(cancel).await?;
        if is_cancelled(cancel) {
            return Ok(ConsolidationSummary { merged: 0, pruned });
        }
        let merged = self.consolidation_pass(cancel).await?;

        let summary = ConsolidationSummary { merged, pruned };
        info!(
            merged = summary.merged,
            pruned = summary.pruned,
            "consolidation cycle complete"
        );
        Ok(summary)
    }

    // =========================================================================
    // Decay pass
    // =========================================================================

    /// Age importance scores and prune entries below the floor.
    ///
    /// `importance' = importance * 0.5^(elapsed / half_life)` with elapsed
    /// measured from the decay baseline, so consecutive passes compose to
    /// the closed-form decay since last access.
    async fn decay_pass(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<usize> {
        let now = Utc::now();
        let half_life = self.config.half_life_secs as f64;
        let mut pruned = 0;

        for entry in self.index.snapshot() {
            if is_cancelled(cancel) {
                break;
            }

            let elapsed =
                (now - entry.decay_baseline()).num_milliseconds().max(0) as f64 / 1000.0;
            let decayed = entry.importance * decay_factor(elapsed, half_life);

            if decayed < self.config.prune_floor {
                self.store.mark_deleted(entry.id).await?;
                self.index.remove(entry.id);
                pruned += 1;
                debug!(entry_id = %entry.id, importance = decayed, "entry pruned");
            } else if entry.importance - decayed > 1e-6 {
                // Sub-microscopic decay is skipped without touching
                // `decayed_at`, so the next pass still measures from the
                // same baseline and nothing is lost to rounding.
                let mut aged = entry;
                aged.importance = decayed;
                aged.decayed_at = Some(now);
                let committed = self.store.append(VersionedRecord::update(aged)).await?;
                self.index.upsert(committed.entry);
            }
        }

        Ok(pruned)
    }

    // =========================================================================
    // Consolidation pass
    // =========================================================================

    /// Cluster remaining entries and merge each cluster into one
    /// representative. Returns the number of entries superseded.
    async fn consolidation_pass(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<usize> {
        let entries = self.index.snapshot();
        if entries.len() < self.config.dbscan.min_cluster_size {
            return Ok(0);
        }

        let points: Vec<Vec<f32>> = entries.iter().map(|e| e.embedding.clone()).collect();
        let clusterer = DbscanClusterer::with_config(self.config.dbscan.clone());
        let outcome = clusterer.cluster(&points);
        debug!(
            clusters = outcome.clusters.len(),
            noise = outcome.noise.len(),
            "clustering complete"
        );

        let mut merged = 0;
        for member_indices in outcome.clusters {
            if is_cancelled(cancel) {
                break;
            }
            match self.merge_cluster(&entries, &member_indices).await {
                Ok(count) => merged += count,
                Err(e) => {
                    // This cluster keeps its originals; retry next cycle.
                    warn!(error = %e, "cluster merge failed; members left intact");
                }
            }
        }

        Ok(merged)
    }

    /// Merge one cluster into a synthesized representative.
    ///
    /// Ordering matters for crash safety: the representative is durably
    /// committed and indexed *before* any member is marked superseded, so a
    /// failure mid-merge leaves the originals intact and only costs this
    /// cycle's merge opportunity.
    async fn merge_cluster(&self, entries: &[MemoryEntry], member_indices: &[usize]) -> Result<usize> {
        let mut members: Vec<&MemoryEntry> =
            member_indices.iter().map(|&i| &entries[i]).collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let content = members
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let tags = members
            .iter()
            .flat_map(|m| m.tags.iter().cloned())
            .collect();
        let importance = members
            .iter()
            .map(|m| m.importance)
            .fold(f64::MIN, f64::max);
        let access_count = members.iter().map(|m| m.access_count).sum();
        let member_ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
        let source = format!(
            "merge of {} entries: {}",
            members.len(),
            member_ids
                .iter()
                .map(|id| id.to_string()[..8].to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Recompute the embedding before any commit; a failure here aborts
        // the merge with nothing persisted.
        let embedding = self.embedder.embed(&content).await?;

        let now = Utc::now();
        let representative = MemoryEntry {
            id: Uuid::new_v4(),
            content,
            embedding: embedding.vector,
            importance,
            tags,
            source,
            created_at: now,
            last_accessed_at: now,
            access_count,
            version: 0,
            decayed_at: None,
        };

        let committed = self
            .store
            .append(VersionedRecord::merge(representative, embedding.fallback))
            .await?;
        let successor = committed.entry.id;
        self.index.upsert(committed.entry);

        for member in &member_ids {
            self.store.mark_superseded(*member, successor).await?;
            self.index.remove(*member);
        }

        debug!(
            representative = %successor,
            members = member_ids.len(),
            "cluster merged"
        );
        Ok(member_ids.len())
    }
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.is_some_and(|rx| *rx.borrow())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_factor_matches_closed_form() {
        let half_life = 3600.0;
        assert!((decay_factor(0.0, half_life) - 1.0).abs() < 1e-12);
        assert!((decay_factor(half_life, half_life) - 0.5).abs() < 1e-12);
        assert!((decay_factor(2.0 * half_life, half_life) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn decay_factor_is_monotonically_decreasing() {
        let half_life = 1000.0;
        let mut previous = 1.0;
        for elapsed in [1.0, 10.0, 100.0, 1000.0, 10_000.0] {
            let factor = decay_factor(elapsed, half_life);
            assert!(factor < previous);
            previous = factor;
        }
    }

    #[test]
    fn zero_half_life_never_decays() {
        assert_eq!(decay_factor(100.0, 0.0), 1.0);
    }
}
