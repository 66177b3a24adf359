//! Configuration surface for the memory store.
//!
//! Every knob has a default; the environment loader overlays `MNEMON_`
//! prefixed variables on top (e.g. `MNEMON_PRUNE_FLOOR=0.2`).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

/// Default embedding model identifier (fastembed BGE-small).
pub const DEFAULT_EMBEDDING_MODEL: &str = "bge-small-en-v1.5";
/// Output dimensionality of the default model; the deterministic fallback
/// produces vectors of the same length.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
/// Content larger than this many bytes is gzip-compressed before commit.
pub const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1024;
/// Importance decay half-life: 30 days.
pub const DEFAULT_DECAY_HALF_LIFE_SECS: u64 = 30 * 24 * 3600;
/// Entries decaying below this importance are pruned.
pub const DEFAULT_PRUNE_FLOOR: f64 = 0.1;
/// DBSCAN neighborhood radius in cosine distance.
pub const DEFAULT_CLUSTER_EPS: f32 = 0.3;
/// Minimum cluster size for a merge.
pub const DEFAULT_CLUSTER_MIN_SIZE: usize = 2;
/// Background consolidation interval: one hour.
pub const DEFAULT_CONSOLIDATION_INTERVAL_SECS: u64 = 3600;

/// Configuration for a [`MemoryManager`](crate::manager::MemoryManager).
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Root directory of the versioned repository.
    pub store_path: PathBuf,
    /// Embedding model identifier handed to the primary provider.
    pub embedding_model: String,
    /// Store-wide embedding dimensionality.
    pub embedding_dimension: usize,
    /// When false the primary model is never consulted and every embedding
    /// uses the deterministic fallback. Useful for tests and air-gapped runs.
    pub model_enabled: bool,
    /// Bound on a single primary-model embedding before falling back.
    pub embed_timeout_secs: u64,
    /// Maximum concurrent embedding computations; 0 means one per CPU.
    pub max_embed_concurrency: usize,
    /// Content above this many bytes is compressed before commit.
    pub compression_threshold_bytes: usize,
    /// `add` rejects content longer than this many bytes.
    pub max_content_bytes: usize,
    /// Soft capacity of the durable store in bytes.
    pub max_store_bytes: u64,
    /// Importance decay half-life in seconds.
    pub decay_half_life_secs: u64,
    /// Entries decaying below this importance are pruned.
    pub prune_floor: f64,
    /// DBSCAN neighborhood radius in cosine distance.
    pub cluster_eps: f32,
    /// Minimum members for a cluster merge.
    pub cluster_min_size: usize,
    /// Seconds between background consolidation cycles.
    pub consolidation_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("memory"),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            model_enabled: true,
            embed_timeout_secs: 5,
            max_embed_concurrency: 0,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            max_content_bytes: 256 * 1024,
            max_store_bytes: 1000 * 1024 * 1024,
            decay_half_life_secs: DEFAULT_DECAY_HALF_LIFE_SECS,
            prune_floor: DEFAULT_PRUNE_FLOOR,
            cluster_eps: DEFAULT_CLUSTER_EPS,
            cluster_min_size: DEFAULT_CLUSTER_MIN_SIZE,
            consolidation_interval_secs: DEFAULT_CONSOLIDATION_INTERVAL_SECS,
        }
    }
}

impl MemoryConfig {
    /// Load defaults overlaid with `MNEMON_` environment variables.
    pub fn load_from_env() -> Result<Self, config::ConfigError> {
        let builder = Config::builder()
            .set_default("store_path", "memory")?
            .set_default("embedding_model", DEFAULT_EMBEDDING_MODEL)?
            .set_default("embedding_dimension", DEFAULT_EMBEDDING_DIMENSION as i64)?
            .set_default("model_enabled", true)?
            .set_default("embed_timeout_secs", 5_i64)?
            .set_default("max_embed_concurrency", 0_i64)?
            .set_default(
                "compression_threshold_bytes",
                DEFAULT_COMPRESSION_THRESHOLD_BYTES as i64,
            )?
            .set_default("max_content_bytes", 256_i64 * 1024)?
            .set_default("max_store_bytes", 1000_i64 * 1024 * 1024)?
            .set_default("decay_half_life_secs", DEFAULT_DECAY_HALF_LIFE_SECS as i64)?
            .set_default("prune_floor", DEFAULT_PRUNE_FLOOR)?
            .set_default("cluster_eps", f64::from(DEFAULT_CLUSTER_EPS))?
            .set_default("cluster_min_size", DEFAULT_CLUSTER_MIN_SIZE as i64)?
            .set_default(
                "consolidation_interval_secs",
                DEFAULT_CONSOLIDATION_INTERVAL_SECS as i64,
            )?
            .add_source(
                Environment::with_prefix("MNEMON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Embedding timeout as a [`Duration`].
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    /// Consolidation interval as a [`Duration`].
    pub fn consolidation_interval(&self) -> Duration {
        Duration::from_secs(self.consolidation_interval_secs)
    }

    /// Effective embedding concurrency bound.
    pub fn embed_concurrency(&self) -> usize {
        if self.max_embed_concurrency == 0 {
            num_cpus::get()
        } else {
            self.max_embed_concurrency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.embedding_dimension, DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(cfg.decay_half_life_secs, 30 * 24 * 3600);
        assert_eq!(cfg.prune_floor, 0.1);
        assert_eq!(cfg.cluster_eps, 0.3);
        assert_eq!(cfg.cluster_min_size, 2);
        assert_eq!(cfg.consolidation_interval_secs, 3600);
    }

    #[test]
    fn embed_concurrency_auto_detects() {
        let mut cfg = MemoryConfig::default();
        cfg.max_embed_concurrency = 0;
        assert!(cfg.embed_concurrency() >= 1);
        cfg.max_embed_concurrency = 3;
        assert_eq!(cfg.embed_concurrency(), 3);
    }
}
