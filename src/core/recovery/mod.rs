//! Restart recovery for the engine's sorted collections.
//!
//! Provides:
//! - Batch-write rollback of half-committed element operations
//! - Crash-consistent repair of the doubly-linked on-media lists
//! - Parallel skiplist and hash-index reconstruction, list or segment based
//! - Reclamation of records unreachable after repair

pub mod batch_log;
pub mod sorted_rebuilder;

pub use batch_log::{BatchWriteLog, SortedLogEntry};
pub use sorted_rebuilder::{RebuildResult, SortedCollectionRebuilder};
