//! Shared fixtures for recovery tests.
//!
//! The write path is out of scope for this crate, so tests lay out
//! collections, version chains and torn linkage directly against the pmem
//! layer, the same shapes the engine's writer would leave behind.

#![allow(dead_code)]

use ember_db::core::index::{HashIndex, LockTable};
use ember_db::core::pmem::RECORD_HEADER_SIZE;
use ember_db::core::skiplist::{encode_collection_value, encode_internal_key};
use ember_db::{
    Checkpoint, ComparatorRegistry, DlRecord, EmberDbConfig, PmemAllocator, PmemOffset,
    RecordSpec, RecordStatus, RecordType, Skiplist, SortedCollectionConfig,
    SortedCollectionRebuilder, NEVER_EXPIRE, NULL_PMEM_OFFSET,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestEnv {
    pub allocator: Arc<PmemAllocator>,
    pub hash_index: Arc<HashIndex>,
    pub lock_table: Arc<LockTable>,
    pub comparators: Arc<ComparatorRegistry>,
    /// Record offsets in creation order, the order a media scan would
    /// surface them.
    pub scanned: Vec<PmemOffset>,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(
            PmemAllocator::create(&dir.path().join("pmem.arena"), 64 * 1024 * 1024).unwrap(),
        );
        Self {
            allocator,
            hash_index: Arc::new(HashIndex::new(64)),
            lock_table: Arc::new(LockTable::new(64)),
            comparators: Arc::new(ComparatorRegistry::new()),
            scanned: Vec::new(),
            _dir: dir,
        }
    }

    pub fn rebuilder(
        &self,
        checkpoint: Checkpoint,
        config: &EmberDbConfig,
    ) -> SortedCollectionRebuilder {
        SortedCollectionRebuilder::new(
            self.allocator.clone(),
            self.hash_index.clone(),
            self.lock_table.clone(),
            self.comparators.clone(),
            checkpoint,
            config,
        )
    }

    pub fn record(&self, offset: PmemOffset) -> &DlRecord {
        self.allocator.offset2addr_checked(offset)
    }

    pub fn create_header(
        &mut self,
        name: &str,
        id: u64,
        ts: u64,
        config: &SortedCollectionConfig,
    ) -> PmemOffset {
        self.create_header_full(name, id, ts, config, RecordStatus::Normal, NEVER_EXPIRE)
    }

    /// Persists a self-linked collection header.
    pub fn create_header_full(
        &mut self,
        name: &str,
        id: u64,
        ts: u64,
        config: &SortedCollectionConfig,
        status: RecordStatus,
        expire_time: i64,
    ) -> PmemOffset {
        let value = encode_collection_value(id, config).unwrap();
        let space = self
            .allocator
            .allocate((RECORD_HEADER_SIZE + name.len() + value.len()) as u64)
            .unwrap();
        self.allocator
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedRecord,
                    status,
                    timestamp: ts,
                    expire_time,
                    old_version: NULL_PMEM_OFFSET,
                    prev: space.offset,
                    next: space.offset,
                    key: name.as_bytes(),
                    value: &value,
                },
            )
            .unwrap();
        self.scanned.push(space.offset);
        space.offset
    }

    pub fn append_element(
        &mut self,
        header: PmemOffset,
        id: u64,
        key: &[u8],
        value: &[u8],
        ts: u64,
    ) -> PmemOffset {
        self.append_element_with_status(header, id, key, value, ts, RecordStatus::Normal)
    }

    /// Appends a fully linked element at the list tail.
    pub fn append_element_with_status(
        &mut self,
        header: PmemOffset,
        id: u64,
        key: &[u8],
        value: &[u8],
        ts: u64,
        status: RecordStatus,
    ) -> PmemOffset {
        let internal_key = encode_internal_key(id, key);
        let space = self
            .allocator
            .allocate((RECORD_HEADER_SIZE + internal_key.len() + value.len()) as u64)
            .unwrap();
        let header_rec = self.record(header);
        let tail = header_rec.prev();
        self.allocator
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status,
                    timestamp: ts,
                    expire_time: NEVER_EXPIRE,
                    old_version: NULL_PMEM_OFFSET,
                    prev: tail,
                    next: header,
                    key: &internal_key,
                    value,
                },
            )
            .unwrap();
        self.record(tail).persist_next(space.offset);
        header_rec.persist_prev(space.offset);
        self.scanned.push(space.offset);
        space.offset
    }

    pub fn update_element(&mut self, old: PmemOffset, value: &[u8], ts: u64) -> PmemOffset {
        self.update_element_with_status(old, value, ts, RecordStatus::Normal)
    }

    /// Writes a newer version of an element and splices it in the way the
    /// write path does, leaving the old version unlinked behind the new
    /// record's version chain.
    pub fn update_element_with_status(
        &mut self,
        old: PmemOffset,
        value: &[u8],
        ts: u64,
        status: RecordStatus,
    ) -> PmemOffset {
        let old_rec = self.record(old);
        let internal_key = old_rec.key().to_vec();
        let prev = old_rec.prev();
        let next = old_rec.next();
        let space = self
            .allocator
            .allocate((RECORD_HEADER_SIZE + internal_key.len() + value.len()) as u64)
            .unwrap();
        self.allocator
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status,
                    timestamp: ts,
                    expire_time: NEVER_EXPIRE,
                    old_version: old,
                    prev,
                    next,
                    key: &internal_key,
                    value,
                },
            )
            .unwrap();
        self.record(prev).persist_next(space.offset);
        self.record(next).persist_prev(space.offset);
        self.scanned.push(space.offset);
        space.offset
    }

    /// Persists an element between `after` and its successor with the insert
    /// torn mid-commit. With `commit_prev_side` the predecessor already
    /// points at the new record; the successor never does.
    pub fn insert_element_after_torn(
        &mut self,
        after: PmemOffset,
        id: u64,
        key: &[u8],
        value: &[u8],
        ts: u64,
        commit_prev_side: bool,
    ) -> PmemOffset {
        let internal_key = encode_internal_key(id, key);
        let space = self
            .allocator
            .allocate((RECORD_HEADER_SIZE + internal_key.len() + value.len()) as u64)
            .unwrap();
        let after_rec = self.record(after);
        let next = after_rec.next();
        self.allocator
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status: RecordStatus::Normal,
                    timestamp: ts,
                    expire_time: NEVER_EXPIRE,
                    old_version: NULL_PMEM_OFFSET,
                    prev: after,
                    next,
                    key: &internal_key,
                    value,
                },
            )
            .unwrap();
        if commit_prev_side {
            after_rec.persist_next(space.offset);
        }
        self.scanned.push(space.offset);
        space.offset
    }

    /// Feeds every scanned record of a matching type into the rebuilder, the
    /// way the engine's restore scan does.
    pub fn scan(&self, rebuilder: &SortedCollectionRebuilder) {
        for &offset in &self.scanned {
            let record = self.record(offset);
            match record.record_type() {
                RecordType::SortedRecord => rebuilder.add_header(record).unwrap(),
                RecordType::SortedElem => rebuilder.add_element(record).unwrap(),
                _ => {}
            }
        }
    }

    /// Partitioned parallel scan.
    pub fn scan_parallel(&self, rebuilder: &SortedCollectionRebuilder, threads: usize) {
        let chunk = self.scanned.len().div_ceil(threads).max(1);
        std::thread::scope(|scope| {
            for part in self.scanned.chunks(chunk) {
                scope.spawn(move || {
                    for &offset in part {
                        let record = self.record(offset);
                        match record.record_type() {
                            RecordType::SortedRecord => rebuilder.add_header(record).unwrap(),
                            RecordType::SortedElem => rebuilder.add_element(record).unwrap(),
                            _ => {}
                        }
                    }
                });
            }
        });
    }

    /// Level-1 on-media record offsets of a rebuilt list, header excluded.
    pub fn list_offsets(&self, list: &Skiplist) -> Vec<PmemOffset> {
        list.iter_records()
            .map(|r| self.allocator.addr2offset(r).unwrap())
            .collect()
    }

    /// DRAM node record offsets along level 1.
    pub fn node_offsets(&self, list: &Skiplist) -> Vec<PmemOffset> {
        list.iter_nodes().map(|n| n.record_offset()).collect()
    }

    /// Asserts prev/next agreement for every record in the cycle.
    pub fn assert_linkage(&self, list: &Skiplist) {
        let header_offset = list.header_offset();
        let mut curr = header_offset;
        loop {
            let record = self.record(curr);
            assert_eq!(
                self.record(record.next()).prev(),
                curr,
                "successor does not point back at {:#x}",
                curr
            );
            assert_eq!(
                self.record(record.prev()).next(),
                curr,
                "predecessor does not point at {:#x}",
                curr
            );
            curr = record.next();
            if curr == header_offset {
                break;
            }
        }
    }

    pub fn freed_offsets(&self) -> HashSet<PmemOffset> {
        self.allocator
            .freed_spaces()
            .into_iter()
            .map(|s| s.offset)
            .collect()
    }
}

/// Asserts `sub` appears in `full` in order.
pub fn assert_subsequence(sub: &[PmemOffset], full: &[PmemOffset]) {
    let mut it = full.iter();
    for wanted in sub {
        assert!(
            it.any(|o| o == wanted),
            "offset {:#x} missing or out of order in level-1 chain",
            wanted
        );
    }
}

/// List-mode and segment-mode configs sharing every other knob.
pub fn list_mode_config(threads: u64) -> EmberDbConfig {
    EmberDbConfig {
        num_rebuild_threads: threads,
        segment_based_rebuild: false,
        ..EmberDbConfig::default()
    }
}

pub fn segment_mode_config(threads: u64, stride: u64) -> EmberDbConfig {
    EmberDbConfig {
        num_rebuild_threads: threads,
        segment_based_rebuild: true,
        restore_skiplist_stride: stride,
        ..EmberDbConfig::default()
    }
}
