//! Public-facing memory manager.
//!
//! Owns the embedding provider, the versioned store, the similarity index,
//! and the lifecycle of the background consolidation task. Foreground and
//! background callers alike mutate state only through the store's commit
//! contract; the index is updated strictly after each commit succeeds.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationEngine, DbscanConfig, EngineConfig};
use crate::domain::{
    ConsolidationSummary, EntryStatus, MemoryEntry, MemoryStats, ScoredEntry, IMPORTANCE_MAX,
    IMPORTANCE_MIN,
};
use crate::embedding::{Embedder, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::index::SimilarityIndex;
use crate::store::{VersionedRecord, VersionedStore};

/// How many index candidates to pull per requested result before the
/// importance-weighted rerank.
const RERANK_OVERSAMPLE: usize = 4;

struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Versioned, semantically-searchable memory store.
pub struct MemoryManager {
    config: MemoryConfig,
    store: Arc<VersionedStore>,
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    engine: Arc<ConsolidationEngine>,
    background: Mutex<Option<BackgroundTask>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("store_path", &self.config.store_path)
            .field("indexed_entries", &self.index.len())
            .finish()
    }
}

impl MemoryManager {
    /// Open the store at the configured path and rebuild the index from the
    /// durable state (latest non-deleted version of every entry).
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        let store = Arc::new(
            VersionedStore::open(
                config.store_path.clone(),
                config.compression_threshold_bytes,
                config.max_store_bytes,
            )
            .await?,
        );

        let records = store.replay_latest().await?;
        let index = Arc::new(SimilarityIndex::new());
        index.rebuild(
            records
                .into_iter()
                .filter(|r| r.status == EntryStatus::Active)
                .map(|r| r.entry),
        );
        info!(
            entries = index.len(),
            path = %config.store_path.display(),
            "memory store opened"
        );

        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingProvider::new(&config));
        let engine = Arc::new(ConsolidationEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&embedder),
            EngineConfig {
                half_life_secs: config.decay_half_life_secs,
                prune_floor: config.prune_floor,
                dbscan: DbscanConfig {
                    eps: config.cluster_eps,
                    min_cluster_size: config.cluster_min_size,
                },
            },
        ));

        Ok(Self {
            config,
            store,
            index,
            embedder,
            engine,
            background: Mutex::new(None),
        })
    }

    // =========================================================================
    // Public surface
    // =========================================================================

    /// Store a new memory. Rejects empty or oversized content; out-of-range
    /// importance is clamped with a warning rather than rejected.
    pub async fn add(
        &self,
        content: &str,
        importance: f64,
        tags: Vec<String>,
        source: &str,
    ) -> Result<MemoryEntry> {
        if content.trim().is_empty() {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }
        if content.len() > self.config.max_content_bytes {
            return Err(MemoryError::Validation(format!(
                "content of {} bytes exceeds the maximum of {}",
                content.len(),
                self.config.max_content_bytes
            )));
        }
        for tag in &tags {
            if tag.trim().is_empty() || tag.chars().any(char::is_control) {
                return Err(MemoryError::Validation(format!("malformed tag: {tag:?}")));
            }
        }

        let importance = if (IMPORTANCE_MIN..=IMPORTANCE_MAX).contains(&importance) {
            importance
        } else {
            let clamped = MemoryEntry::clamp_importance(importance);
            warn!(
                requested = importance,
                clamped, "importance out of range; clamped"
            );
            clamped
        };

        let embedding = self.embedder.embed(content).await?;
        if embedding.fallback {
            debug!("entry embedded via deterministic fallback");
        }

        let now = Utc::now();
        let entry = MemoryEntry {
            id: Uuid::new_v4(),
            content: content.to_string(),
            embedding: embedding.vector,
            importance,
            tags: tags.into_iter().collect(),
            source: source.to_string(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            version: 0,
            decayed_at: None,
        };

        let committed = self
            .store
            .append(VersionedRecord::create(entry, embedding.fallback))
            .await?;
        self.index.upsert(committed.entry.clone());

        debug!(
            entry_id = %committed.entry.id,
            importance = committed.entry.importance,
            "memory added"
        );
        Ok(committed.entry)
    }

    /// Retrieve the `top_k` memories most relevant to `query`.
    ///
    /// Candidates come from the similarity index and are reranked by
    /// `similarity * (1 + ln(1 + importance))` before truncation. Access
    /// tracking is committed best-effort: a storage fault downgrades to a
    /// warning rather than failing the read.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_importance: f64,
    ) -> Result<Vec<ScoredEntry>> {
        if top_k == 0 {
            return Err(MemoryError::Validation("top_k must be positive".into()));
        }
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query must not be empty".into()));
        }

        let embedding = self.embedder.embed(query).await?;
        let candidates =
            self.index
                .query(&embedding.vector, top_k * RERANK_OVERSAMPLE, min_importance);

        let mut scored: Vec<ScoredEntry> = candidates
            .into_iter()
            .map(|(entry, similarity)| {
                let weight = 1.0 + (1.0 + entry.importance).ln();
                ScoredEntry {
                    score: similarity * weight as f32,
                    similarity,
                    entry,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);

        self.track_access(&scored).await;

        Ok(scored)
    }

    /// Bump access statistics for retrieved entries. Best-effort: failures
    /// are logged and never fail the retrieval that triggered them.
    async fn track_access(&self, results: &[ScoredEntry]) {
        let now = Utc::now();
        for result in results {
            // Re-read the index so a concurrent update is not clobbered.
            let Some(mut entry) = self.index.get(result.entry.id) else {
                continue;
            };
            entry.access_count += 1;
            entry.last_accessed_at = now;

            match self.store.append(VersionedRecord::update(entry)).await {
                Ok(committed) => self.index.upsert(committed.entry),
                Err(e) => {
                    warn!(entry_id = %result.entry.id, error = %e, "access tracking failed");
                    break;
                }
            }
        }
    }

    /// Run one decay + consolidation cycle now.
    pub async fn consolidate(&self) -> Result<ConsolidationSummary> {
        self.engine.run_cycle(None).await
    }

    /// Aggregate statistics over the live entries.
    pub fn stats(&self) -> MemoryStats {
        let entries = self.index.snapshot();
        if entries.is_empty() {
            return MemoryStats::default();
        }
        let total_size_bytes = entries.iter().map(|e| e.content.len() as u64).sum();
        let average_importance =
            entries.iter().map(|e| e.importance).sum::<f64>() / entries.len() as f64;
        MemoryStats {
            total_entries: entries.len(),
            total_size_bytes,
            average_importance,
        }
    }

    /// Full version history of one entry, oldest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<VersionedRecord>> {
        self.store.history(id).await
    }

    /// Whether the store currently refuses writes after a storage fault.
    pub fn is_write_faulted(&self) -> bool {
        self.store.is_faulted()
    }

    /// Re-admit writes once the underlying storage fault has been resolved.
    pub fn clear_storage_fault(&self) {
        self.store.clear_fault();
    }

    // =========================================================================
    // Background lifecycle
    // =========================================================================

    /// Start the periodic consolidation task. Calling twice is a no-op.
    pub async fn start_background_tasks(&self) {
        let mut slot = self.background.lock().await;
        if slot.is_some() {
            debug!("background tasks already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(&self.engine);
        let interval = self.config.consolidation_interval();

        let handle = tokio::spawn(async move {
            let cancel = shutdown_rx.clone();
            info!(interval = ?interval, "consolidation scheduler started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        match engine.run_cycle(Some(&cancel)).await {
                            Ok(summary) => debug!(
                                merged = summary.merged,
                                pruned = summary.pruned,
                                "scheduled consolidation finished"
                            ),
                            // One bad cycle must not kill the scheduler.
                            Err(e) => warn!(error = %e, "scheduled consolidation failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("consolidation scheduler stopped");
        });

        *slot = Some(BackgroundTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop background tasks, waiting for any in-flight cycle to finish.
    /// Calling without a running task is a no-op.
    pub async fn stop_background_tasks(&self) {
        let task = self.background.lock().await.take();
        let Some(task) = task else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "background task join failed");
        }
    }
}
