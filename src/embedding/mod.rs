//! Text embedding with a primary model and a deterministic fallback.
//!
//! The primary path runs a fastembed `TextEmbedding` under `spawn_blocking`
//! with a bounded timeout. Whenever the model is unavailable, errors out, or
//! exceeds the timeout, the provider degrades to a hash-derived
//! pseudo-embedding of the same dimensionality, so downstream components
//! never see the difference beyond an observability flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
#[cfg(feature = "model")]
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};

/// An embedding vector plus the path that produced it.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// True when the deterministic fallback produced the vector. Recorded
    /// for observability only; retrieval behavior is identical.
    pub fallback: bool,
}

/// Contract every embedding strategy satisfies.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a vector of [`Embedder::dimension`] length.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Store-wide embedding dimensionality.
    fn dimension(&self) -> usize;
}

/// Two-variant embedding strategy: primary model or deterministic fallback.
///
/// Concurrency through the provider is bounded by a semaphore; callers
/// queue on permit acquisition rather than spawning unbounded blocking work.
pub struct EmbeddingProvider {
    dimension: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
    /// Latched false once the primary model proves unusable.
    primary_available: AtomicBool,
    fallback_count: AtomicU64,
    #[cfg(feature = "model")]
    model_name: String,
    /// `None` while uninitialized or while an inference call owns the model.
    #[cfg(feature = "model")]
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    #[cfg(feature = "model")]
    model_initialized: AtomicBool,
}

impl std::fmt::Debug for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider")
            .field("dimension", &self.dimension)
            .field(
                "primary_available",
                &self.primary_available.load(Ordering::Relaxed),
            )
            .field(
                "fallback_count",
                &self.fallback_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl EmbeddingProvider {
    /// Build a provider from the store configuration.
    pub fn new(config: &MemoryConfig) -> Self {
        let primary = config.model_enabled && cfg!(feature = "model");
        if config.model_enabled && !cfg!(feature = "model") {
            warn!("model feature disabled at build time; embeddings use the deterministic fallback");
        }
        Self {
            dimension: config.embedding_dimension,
            timeout: config.embed_timeout(),
            permits: Arc::new(Semaphore::new(config.embed_concurrency())),
            primary_available: AtomicBool::new(primary),
            fallback_count: AtomicU64::new(0),
            #[cfg(feature = "model")]
            model_name: config.embedding_model.clone(),
            #[cfg(feature = "model")]
            model: Arc::new(Mutex::new(None)),
            #[cfg(feature = "model")]
            model_initialized: AtomicBool::new(false),
        }
    }

    /// How many embeddings have been served by the fallback path.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// Attempt the primary model; `None` means "fall back for this call".
    #[cfg(feature = "model")]
    async fn embed_primary(&self, text: &str) -> Option<Vec<f32>> {
        let mut guard = self.model.lock().await;

        if guard.is_none() {
            if self.model_initialized.load(Ordering::Relaxed) {
                // Model is out with a timed-out inference call; don't pile up.
                return None;
            }
            match self.initialize_model().await {
                Some(model) => {
                    self.model_initialized.store(true, Ordering::Relaxed);
                    *guard = Some(model);
                }
                None => {
                    self.primary_available.store(false, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let owned = guard.take()?;
        let text_owned = text.to_string();
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut model = owned;
            let result = model.embed(vec![text_owned], None);
            (result, model)
        });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok((result, model))) => {
                *guard = Some(model);
                match result {
                    Ok(mut vectors) if !vectors.is_empty() => {
                        let vector = vectors.swap_remove(0);
                        if vector.len() == self.dimension {
                            Some(vector)
                        } else {
                            warn!(
                                got = vector.len(),
                                want = self.dimension,
                                "model dimensionality does not match configuration; falling back"
                            );
                            self.primary_available.store(false, Ordering::Relaxed);
                            None
                        }
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "primary embedding failed");
                        None
                    }
                }
            }
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "embedding task panicked; disabling primary model");
                self.primary_available.store(false, Ordering::Relaxed);
                None
            }
            Err(_) => {
                // The blocking call cannot be cancelled; restore the model
                // into the slot once it eventually finishes. Until then the
                // slot stays empty and calls use the fallback.
                warn!(timeout = ?self.timeout, "primary embedding timed out");
                drop(guard);
                let slot = Arc::clone(&self.model);
                tokio::spawn(async move {
                    if let Ok((_result, model)) = handle.await {
                        *slot.lock().await = Some(model);
                    }
                });
                None
            }
        }
    }

    #[cfg(not(feature = "model"))]
    async fn embed_primary(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }

    /// Load the fastembed model off the async runtime.
    #[cfg(feature = "model")]
    async fn initialize_model(&self) -> Option<fastembed::TextEmbedding> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model_kind = match self.model_name.as_str() {
            "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            other => {
                warn!(model = %other, "unknown embedding model id; using bge-small-en-v1.5");
                EmbeddingModel::BGESmallENV15
            }
        };

        let handle = tokio::task::spawn_blocking(move || {
            let options = InitOptions::new(model_kind);
            TextEmbedding::try_new(options)
        });

        match handle.await {
            Ok(Ok(model)) => {
                debug!(model = %self.model_name, "primary embedding model loaded");
                Some(model)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to load embedding model; using deterministic fallback");
                None
            }
            Err(join_err) => {
                warn!(error = %join_err, "embedding model load panicked; using deterministic fallback");
                None
            }
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    /// Embed `text` into a vector of the configured dimensionality.
    ///
    /// Never fails for non-empty input: primary-model trouble degrades to
    /// the deterministic fallback. Empty input is the caller's problem and
    /// is rejected by the manager before reaching this point.
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| MemoryError::Embedding(format!("provider shut down: {e}")))?;

        if self.primary_available.load(Ordering::Relaxed) {
            match self.embed_primary(text).await {
                Some(vector) => {
                    return Ok(Embedding {
                        vector,
                        fallback: false,
                    });
                }
                None => debug!("primary embedding unavailable, using fallback"),
            }
        }

        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        Ok(Embedding {
            vector: deterministic_embedding(text, self.dimension),
            fallback: true,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Derive a unit-norm pseudo-embedding from a SHA-256 expansion of the text.
///
/// Identical input always yields the identical vector, so self-similarity
/// stays at 1.0 even on the fallback path.
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dimension);
    let mut counter: u32 = 0;

    while out.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        for byte in hasher.finalize() {
            if out.len() == dimension {
                break;
            }
            out.push(f32::from(byte) / 255.0 - 0.5);
        }
        counter += 1;
    }

    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}
