//! Error types for the memory store.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Crate error type.
///
/// The taxonomy separates caller mistakes (`Validation`), expected misses
/// (`NotFound`), and storage failures (`Storage`/`FailClosed`). Embedding
/// failures are handled internally by falling back to the deterministic
/// embedder and never reach callers of the manager.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Input rejected before any side effect. Never retried internally.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Read of an unknown or deleted entry id. Not a fault.
    #[error("entry not found: {0}")]
    NotFound(Uuid),

    /// A durable commit failed. The store stays at its last consistent
    /// version and refuses further writes until the fault is cleared.
    #[error("storage fault at {path}: {source}")]
    Storage {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A write arrived after an earlier storage fault latched the store
    /// closed. Reads continue to be served.
    #[error("store is fail-closed after an earlier storage fault; writes are refused")]
    FailClosed,

    /// The configured maximum store size would be exceeded by this write.
    #[error("store size limit exceeded: {used} of {limit} bytes in use")]
    StoreFull {
        /// Bytes currently used by the store.
        used: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// A persisted record could not be decoded.
    #[error("corrupt record at {path}: {reason}")]
    Corrupt {
        /// Path of the unreadable record.
        path: PathBuf,
        /// Decode failure description.
        reason: String,
    },

    /// Embedding machinery failed in a way the fallback cannot absorb
    /// (e.g. the provider was torn down). Internal; recorded for
    /// observability.
    #[error("embedding unavailable: {0}")]
    Embedding(String),
}

/// Result type alias for memory store operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
