//! # Ember DB
//!
//! An embedded persistent-memory sorted key-value engine core written in
//! Rust. Collections live in a byte-addressable mapped arena as circular
//! doubly-linked record lists, indexed in DRAM by probabilistic skiplists
//! and a shared lock-striped hash index.
//!
//! ## Features
//!
//! - **Persistent records**: fixed-header checksummed records with fenced
//!   linkage updates, multi-versioned through backward version chains
//! - **Crash recovery**: torn linkage repair, batch-write rollback, and
//!   checkpoint-targeted version resolution on restart
//! - **Parallel rebuild**: per-collection workers, or segment-partitioned
//!   workers when a single large collection dominates
//! - **Pluggable ordering**: named user comparators persisted with each
//!   collection
//! - **Space reclamation**: unreachable records are destroyed and their
//!   extents returned to the allocator
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ember_db::core::index::{HashIndex, LockTable};
//! use ember_db::{
//!     Checkpoint, ComparatorRegistry, EmberDbConfig, PmemAllocator, SortedCollectionRebuilder,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> ember_db::Result<()> {
//! let config = EmberDbConfig::default();
//! let allocator = Arc::new(PmemAllocator::create(
//!     "./ember.arena".as_ref(),
//!     config.pmem_file_size,
//! )?);
//! let hash_index = Arc::new(HashIndex::new(config.hash_index_stripes));
//! let lock_table = Arc::new(LockTable::new(config.lock_table_stripes));
//! let comparators = Arc::new(ComparatorRegistry::new());
//!
//! let rebuilder = SortedCollectionRebuilder::new(
//!     allocator,
//!     hash_index,
//!     lock_table,
//!     comparators,
//!     Checkpoint::default(),
//!     &config,
//! );
//! // Feed scanned records through add_header / add_element, then:
//! let result = rebuilder.rebuild()?;
//! for (id, list) in &result.rebuild_skiplists {
//!     println!("collection {} recovered with {} elements", id, list.len());
//! }
//! # Ok(())
//! # }
//! ```

// Core engine functionality
pub mod core {
    pub mod error;
    pub mod index;
    pub mod pmem;
    pub mod recovery;
    pub mod skiplist;
}

// Utilities and helpers
pub mod utils;

// Re-export core types and functionality
pub use crate::core::error::{Error, Result};
pub use crate::core::pmem::{
    DlRecord, PmemAllocator, PmemOffset, RecordSpec, RecordStatus, RecordType, SpaceEntry,
    NEVER_EXPIRE, NULL_PMEM_OFFSET,
};
pub use crate::core::recovery::{
    BatchWriteLog, RebuildResult, SortedCollectionRebuilder, SortedLogEntry,
};
pub use crate::core::skiplist::{
    CollectionId, Skiplist, SkiplistNode, SortedCollectionConfig, MAX_HEIGHT,
};
pub use crate::utils::comparator::{Comparator, ComparatorRegistry, DEFAULT_COMPARATOR_NAME};

use serde::{Deserialize, Serialize};

/// Recovery checkpoint handed to the rebuilder.
///
/// When valid, every record version younger than `ts` is rolled back on
/// restart; when not, records recover as found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Timestamp of the persisted consistent snapshot.
    pub ts: u64,
    /// Whether recovery should target the checkpoint at all.
    pub enabled: bool,
}

impl Checkpoint {
    pub fn new(ts: u64) -> Self {
        Self { ts, enabled: true }
    }

    pub fn valid(&self) -> bool {
        self.enabled && self.ts > 0
    }
}

/// Configuration options for Ember DB.
///
/// Use [`Default::default()`] for sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmberDbConfig {
    /// Size of the persistent-memory arena file in bytes.
    /// Default: 256MB.
    pub pmem_file_size: u64,

    /// Upper bound on concurrently active engine threads.
    /// Recovery worker counts are capped by this value. Default: 64.
    pub max_access_threads: u64,

    /// Worker threads per recovery phase, capped by `max_access_threads`.
    /// Default: 8.
    pub num_rebuild_threads: u64,

    /// Partition collections into segments rebuilt by independent workers.
    /// Scales recovery when one large collection dominates; the default
    /// one-worker-per-collection mode wins when collections are many and
    /// small. Default: false.
    pub segment_based_rebuild: bool,

    /// Every n-th scanned element of a collection is nominated as a
    /// recovery segment start. Default: 10000.
    pub restore_skiplist_stride: u64,

    /// Stripe count of the shared hash index. Rounded up to a power of two.
    /// Default: 512.
    pub hash_index_stripes: usize,

    /// Stripe count of the linkage lock table. Rounded up to a power of
    /// two. Default: 1024.
    pub lock_table_stripes: usize,
}

impl Default for EmberDbConfig {
    fn default() -> Self {
        Self {
            pmem_file_size: 256 * 1024 * 1024,
            max_access_threads: 64,
            num_rebuild_threads: 8,
            segment_based_rebuild: false,
            restore_skiplist_stride: 10_000,
            hash_index_stripes: 512,
            lock_table_stripes: 1024,
        }
    }
}
