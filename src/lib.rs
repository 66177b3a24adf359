//! Versioned, semantically-searchable memory store.
//!
//! Persists discrete memory records in an append-only versioned repository,
//! indexes them by embedding for cosine-similarity retrieval, and
//! periodically consolidates near-duplicates while decaying the importance
//! of stale entries.
//!
//! # Architecture
//!
//! - **Embedding**: fastembed primary model with a deterministic hash-based
//!   fallback of identical dimensionality
//! - **Store**: commit-per-write durable repository, single write lock,
//!   transparent compression of large content
//! - **Index**: in-memory cosine-similarity cache, rebuilt from the store
//!   at startup
//! - **Consolidation**: half-life importance decay, DBSCAN clustering, and
//!   cluster merges on a background interval
//!
//! # Modules
//!
//! - [`manager`]: the public [`MemoryManager`] surface
//! - [`store`]: durable versioned repository
//! - [`index`]: similarity search
//! - [`embedding`]: embedding provider and fallback
//! - [`consolidation`]: decay + clustering engine

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod consolidation;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod index;
pub mod manager;
pub mod store;

pub use config::MemoryConfig;
pub use domain::{
    ConsolidationSummary, EntryStatus, MemoryEntry, MemoryStats, Operation, ScoredEntry,
};
pub use embedding::{Embedder, EmbeddingProvider};
pub use error::{MemoryError, Result};
pub use manager::MemoryManager;
