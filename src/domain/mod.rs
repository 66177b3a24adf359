pub mod entry;

pub use entry::{
    ConsolidationSummary, EntryStatus, MemoryEntry, MemoryStats, Operation, ScoredEntry,
    IMPORTANCE_MAX, IMPORTANCE_MIN,
};
