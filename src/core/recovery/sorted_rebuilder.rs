//! Sorted collection rebuild after a restart.
//!
//! The engine's scan feeds every candidate sorted record into the intake
//! here; the rebuilder repairs linkage, resolves record versions against the
//! recovery checkpoint, reconstructs the DRAM skiplists and hash entries,
//! and reclaims records that no longer belong to any collection.
//!
//! Phases are barriered: intake (parallel, driven by the scan) -> header
//! resolution (serial) -> index rebuild (parallel, list or segment based)
//! -> reclamation (serial). Batch-write rollback runs before intake.

use crate::core::error::{Error, Result};
use crate::core::index::{HashEntry, HashIndex, IndexPtr, InsertOutcome, LockTable, StripeGuard};
use crate::core::pmem::{
    DlRecord, PmemAllocator, PmemOffset, RecordStatus, RecordType, SpaceEntry, NULL_PMEM_OFFSET,
};
use crate::core::recovery::batch_log::SortedLogEntry;
use crate::core::skiplist::{
    self, CollectionId, DlListRecoveryUtils, Skiplist, SkiplistNode, Splice, MAX_HEIGHT,
};
use crate::utils::comparator::ComparatorRegistry;
use crate::{Checkpoint, EmberDbConfig};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

thread_local! {
    /// Recovery worker id of the current thread. Ids come from an atomic
    /// counter, not from OS thread ids, so a recycled thread can never
    /// collide with a live worker's caches.
    static RECOVERY_TID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Output of a completed rebuild, handed back to the engine.
pub struct RebuildResult {
    pub max_recovered_id: CollectionId,
    pub rebuild_skiplists: HashMap<CollectionId, Arc<Skiplist>>,
}

#[derive(Default)]
struct ThreadCache {
    /// Per-collection intake counters driving segment nomination.
    visited_skiplists: HashMap<CollectionId, u64>,
    /// Records found unlinked; they may still be referenced through an
    /// old-version chain, so destruction waits for reclamation.
    unlinked_records: Vec<PmemOffset>,
}

struct SegmentStart {
    visited: AtomicBool,
    node: NonNull<SkiplistNode>,
}

// SAFETY: segment start nodes are created by the rebuilder and either linked
// into exactly one list or freed by the rebuilder itself.
unsafe impl Send for SegmentStart {}
unsafe impl Sync for SegmentStart {}

/// Rebuilds every sorted collection from scanned records.
pub struct SortedCollectionRebuilder {
    allocator: Arc<PmemAllocator>,
    hash_index: Arc<HashIndex>,
    lock_table: Arc<LockTable>,
    comparators: Arc<ComparatorRegistry>,
    recovery_utils: DlListRecoveryUtils,
    checkpoint: Checkpoint,
    segment_based_rebuild: bool,
    num_rebuild_threads: usize,
    restore_skiplist_stride: u64,
    thread_caches: Vec<Mutex<ThreadCache>>,
    linked_headers: Mutex<Vec<PmemOffset>>,
    recovery_segments: Mutex<HashMap<PmemOffset, SegmentStart>>,
    rebuild_skiplists: Mutex<HashMap<CollectionId, Arc<Skiplist>>>,
    invalid_skiplists: Mutex<HashMap<CollectionId, Arc<Skiplist>>>,
    max_recovered_id: AtomicU64,
    next_tid: AtomicU64,
}

impl SortedCollectionRebuilder {
    pub fn new(
        allocator: Arc<PmemAllocator>,
        hash_index: Arc<HashIndex>,
        lock_table: Arc<LockTable>,
        comparators: Arc<ComparatorRegistry>,
        checkpoint: Checkpoint,
        config: &EmberDbConfig,
    ) -> Self {
        let num_rebuild_threads = config
            .num_rebuild_threads
            .min(config.max_access_threads)
            .max(1) as usize;
        let thread_caches = (0..num_rebuild_threads)
            .map(|_| Mutex::new(ThreadCache::default()))
            .collect();
        Self {
            recovery_utils: DlListRecoveryUtils::new(allocator.clone()),
            allocator,
            hash_index,
            lock_table,
            comparators,
            checkpoint,
            segment_based_rebuild: config.segment_based_rebuild,
            num_rebuild_threads,
            restore_skiplist_stride: config.restore_skiplist_stride.max(1),
            thread_caches,
            linked_headers: Mutex::new(Vec::new()),
            recovery_segments: Mutex::new(HashMap::new()),
            rebuild_skiplists: Mutex::new(HashMap::new()),
            invalid_skiplists: Mutex::new(HashMap::new()),
            max_recovered_id: AtomicU64::new(0),
            next_tid: AtomicU64::new(0),
        }
    }

    fn recover_to_checkpoint(&self) -> bool {
        self.checkpoint.valid()
    }

    /// Assigns this thread a fresh recovery worker id.
    fn claim_worker_id(&self) {
        let id = self.next_tid.fetch_add(1, Ordering::Relaxed) as usize;
        RECOVERY_TID.with(|tid| tid.set(Some(id)));
    }

    fn worker_slot(&self) -> usize {
        let id = RECOVERY_TID.with(|tid| match tid.get() {
            Some(id) => id,
            None => {
                let id = self.next_tid.fetch_add(1, Ordering::Relaxed) as usize;
                tid.set(Some(id));
                id
            }
        });
        id % self.thread_caches.len()
    }

    fn add_unlinked_record(&self, offset: PmemOffset) {
        self.thread_caches[self.worker_slot()]
            .lock()
            .unlinked_records
            .push(offset);
    }

    /// Intake for a scanned collection header.
    pub fn add_header(&self, header_record: &DlRecord) -> Result<()> {
        debug_assert_eq!(header_record.record_type(), RecordType::SortedRecord);
        if !self.recovery_utils.check_and_repair_linkage(header_record) {
            if self.recover_to_checkpoint() {
                // May still be a checkpoint version of a live header, so it
                // cannot be freed yet.
                self.add_unlinked_record(self.allocator.addr2offset_checked(header_record));
            } else {
                self.allocator.purge_and_free(header_record);
            }
            return Ok(());
        }
        self.linked_headers
            .lock()
            .push(self.allocator.addr2offset_checked(header_record));
        Ok(())
    }

    /// Intake for a scanned collection element.
    pub fn add_element(&self, record: &DlRecord) -> Result<()> {
        debug_assert_eq!(record.record_type(), RecordType::SortedElem);
        if !self.recovery_utils.check_and_repair_linkage(record) {
            if self.recover_to_checkpoint() {
                // May still be a checkpoint version, cannot be freed yet.
                self.add_unlinked_record(self.allocator.addr2offset_checked(record));
            } else {
                self.allocator.purge_and_free(record);
            }
            return Ok(());
        }
        if self.segment_based_rebuild {
            let id = skiplist::fetch_id(record);
            let visits = {
                let mut cache = self.thread_caches[self.worker_slot()].lock();
                let counter = cache.visited_skiplists.entry(id).or_insert(0);
                *counter += 1;
                *counter
            };
            if visits % self.restore_skiplist_stride == 0
                && self
                    .find_checkpoint_version(record)
                    .is_some_and(|v| ptr::eq(v, record))
                && record.record_type() == RecordType::SortedElem
            {
                let offset = self.allocator.addr2offset_checked(record);
                // A segment start must have a DRAM node; retry until the
                // height draw produces one.
                let start_node = loop {
                    if let Some(node) = skiplist::new_node_build(offset) {
                        break node;
                    }
                };
                self.add_recovery_segment(start_node);
            }
        }
        Ok(())
    }

    fn add_recovery_segment(&self, start_node: NonNull<SkiplistNode>) {
        if self.segment_based_rebuild {
            // SAFETY: the node was just built and is not yet shared.
            let record_offset = unsafe { start_node.as_ref() }.record_offset();
            let mut segments = self.recovery_segments.lock();
            match segments.entry(record_offset) {
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(SegmentStart {
                        visited: AtomicBool::new(false),
                        node: start_node,
                    });
                }
                std::collections::hash_map::Entry::Occupied(_) => {
                    // SAFETY: the duplicate node was never published.
                    unsafe { skiplist::dealloc_node(start_node) };
                }
            }
        }
    }

    /// Undoes one possibly half-committed element of a crashed batch write.
    ///
    /// A valid prev linkage means the record's own pointers are trustworthy,
    /// so remove/replace can proceed; the record is marked dead either way.
    pub fn rollback(&self, log: &SortedLogEntry) -> Result<()> {
        let elem: &DlRecord = self.allocator.offset2addr(log.offset).ok_or_else(|| {
            Error::Internal(format!("batch log offset {:#x} out of bounds", log.offset))
        })?;
        if elem.validate() && self.recovery_utils.check_prev_linkage(elem) {
            if elem.old_version() != NULL_PMEM_OFFSET {
                let old: &DlRecord = self.allocator.offset2addr_checked(elem.old_version());
                if !Skiplist::replace(elem, old, &self.allocator, &self.lock_table) {
                    return Err(Error::LinkageCorruption(log.offset));
                }
            } else if !Skiplist::remove(elem, &self.allocator, &self.lock_table) {
                return Err(Error::LinkageCorruption(log.offset));
            }
        }
        elem.destroy();
        Ok(())
    }

    /// Runs header resolution, index rebuild and reclamation over everything
    /// the intake accepted.
    pub fn rebuild(&self) -> Result<RebuildResult> {
        self.init_rebuild_lists()?;
        if !self.rebuild_skiplists.lock().is_empty() {
            if self.segment_based_rebuild {
                self.segment_based_index_rebuild()?;
            } else {
                self.list_based_index_rebuild()?;
            }
        }
        let max_recovered_id = self.max_recovered_id.load(Ordering::Relaxed);
        let rebuild_skiplists = std::mem::take(&mut *self.rebuild_skiplists.lock());
        self.clean_invalid_records();
        Ok(RebuildResult {
            max_recovered_id,
            rebuild_skiplists,
        })
    }

    /// Deduplicates headers and classifies each collection for rebuild.
    fn init_rebuild_lists(&self) -> Result<()> {
        let mut headers = std::mem::take(&mut *self.linked_headers.lock());
        // Headers with the same id sort together so outdated duplicates are
        // recognized; the youngest of a run survives.
        headers.sort_by_key(|&offset| {
            let record: &DlRecord = self.allocator.offset2addr_checked(offset);
            (skiplist::fetch_id(record), record.timestamp())
        });

        for i in 0..headers.len() {
            let header_offset = headers[i];
            let header: &DlRecord = self.allocator.offset2addr_checked(header_offset);
            let id = skiplist::fetch_id(header);

            if i + 1 < headers.len() {
                let newer: &DlRecord = self.allocator.offset2addr_checked(headers[i + 1]);
                if skiplist::fetch_id(newer) == id {
                    // A newer version of this header exists: the previous run
                    // crashed while updating the header of an empty
                    // collection, before breaking the old header's linkage.
                    debug_assert!(
                        header.prev() == header.next() && header.prev() == header_offset,
                        "outdated header with valid linkage must be self-linked"
                    );
                    // Break the linkage in place. The successor's offset can
                    // never equal a live back-pointer of this record.
                    header.persist_prev(headers[i + 1]);
                    debug_assert!(
                        !self.recovery_utils.check_prev_linkage(header)
                            && !self.recovery_utils.check_next_linkage(header)
                    );
                    self.add_unlinked_record(header_offset);
                    continue;
                }
            }

            let collection_name = header.key().to_vec();
            let name = String::from_utf8_lossy(&collection_name).into_owned();
            let (decoded_id, s_configs) =
                skiplist::decode_collection_value(header.value()).map_err(|e| {
                    error!(collection = %name, "failed to decode sorted collection header");
                    e
                })?;
            debug_assert_eq!(decoded_id, id);

            let comparator = self
                .comparators
                .get(&s_configs.comparator_name)
                .ok_or_else(|| {
                    error!(
                        comparator = %s_configs.comparator_name,
                        collection = %name,
                        "comparator of restoring sorted collection is not registered"
                    );
                    Error::MissingComparator(s_configs.comparator_name.clone())
                })?;

            self.max_recovered_id.fetch_max(id, Ordering::Relaxed);

            let visible = self
                .find_checkpoint_version(header)
                .filter(|v| skiplist::fetch_id(v) == id);
            match visible {
                None => {
                    // No checkpoint version, or the version chain leads into
                    // another collection reusing this name. The hash index is
                    // skipped for a collection that is about to be destroyed.
                    let list = Arc::new(Skiplist::new(
                        header,
                        name,
                        id,
                        comparator,
                        self.allocator.clone(),
                        self.hash_index.clone(),
                        self.lock_table.clone(),
                        false,
                    ));
                    self.invalid_skiplists.lock().insert(id, list);
                }
                Some(visible) => {
                    let mut guard = self.hash_index.acquire_lock(&collection_name);

                    if !ptr::eq(visible, header) {
                        if !Skiplist::replace(header, visible, &self.allocator, &self.lock_table) {
                            return Err(Error::LinkageCorruption(header_offset));
                        }
                        self.add_unlinked_record(header_offset);
                    }

                    let outdated = visible.status() == RecordStatus::Outdated
                        || visible.has_expired();
                    if outdated {
                        let list = Arc::new(Skiplist::new(
                            visible,
                            name,
                            id,
                            comparator,
                            self.allocator.clone(),
                            self.hash_index.clone(),
                            self.lock_table.clone(),
                            false,
                        ));
                        self.invalid_skiplists.lock().insert(id, list);
                    } else {
                        let list = Arc::new(Skiplist::new(
                            visible,
                            name,
                            id,
                            comparator,
                            self.allocator.clone(),
                            self.hash_index.clone(),
                            self.lock_table.clone(),
                            s_configs.index_with_hashtable,
                        ));
                        self.rebuild_skiplists.lock().insert(id, list.clone());
                        if self.segment_based_rebuild {
                            // The header is always a recovery segment.
                            self.add_recovery_segment(list.header_node_ptr());
                        }
                        // The collection is committed to this version; sever
                        // its backward chain.
                        visible.persist_old_version(NULL_PMEM_OFFSET);
                        self.insert_hash_index(
                            &mut guard,
                            &collection_name,
                            IndexPtr::Skiplist(NonNull::from(list.as_ref())),
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Youngest version of `record` visible at the recovery checkpoint, or
    /// None if the record did not exist then.
    fn find_checkpoint_version<'a>(&'a self, record: &'a DlRecord) -> Option<&'a DlRecord> {
        if !self.recover_to_checkpoint() {
            return Some(record);
        }
        let id = skiplist::fetch_id(record);
        let checkpoint_ts = self.checkpoint.ts;
        let mut curr = Some(record);
        while let Some(c) = curr {
            if c.timestamp() <= checkpoint_ts {
                break;
            }
            curr = self.allocator.offset2addr::<DlRecord>(c.old_version());
            if let Some(older) = curr {
                if !older.validate() {
                    error!(
                        offset = c.old_version(),
                        "broken checkpoint: older version record fails validation"
                    );
                    return None;
                }
                if older.key() != record.key() {
                    error!(
                        offset = c.old_version(),
                        "broken checkpoint: older version key differs from new version"
                    );
                    return None;
                }
                if skiplist::fetch_id(older) != id {
                    // The chain ran into an unrelated record; the offset was
                    // reused after a free.
                    warn!(offset = c.old_version(), "version chain left the collection");
                    curr = None;
                }
            }
        }
        curr
    }

    fn insert_hash_index(
        &self,
        guard: &mut StripeGuard<'_>,
        key: &[u8],
        index: IndexPtr,
    ) -> Result<()> {
        let (record_type, record_status) = match index {
            IndexPtr::DlRecord(offset) => {
                let record: &DlRecord = self.allocator.offset2addr_checked(offset);
                debug_assert_eq!(record.record_type(), RecordType::SortedElem);
                (RecordType::SortedElem, record.status())
            }
            IndexPtr::SkiplistNode(node) => {
                // SAFETY: the node was built by this rebuild and is alive.
                let offset = unsafe { node.as_ref() }.record_offset();
                let record: &DlRecord = self.allocator.offset2addr_checked(offset);
                debug_assert_eq!(record.record_type(), RecordType::SortedElem);
                (RecordType::SortedElem, record.status())
            }
            IndexPtr::Skiplist(list) => {
                // SAFETY: the list was created by this rebuild and is alive.
                let record = unsafe { list.as_ref() }.header_record();
                debug_assert_eq!(record.record_type(), RecordType::SortedRecord);
                (RecordType::SortedRecord, record.status())
            }
        };
        match guard.insert(
            key,
            HashEntry {
                record_type,
                record_status,
                index,
            },
        ) {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Occupied => {
                error!("hash entry of a sorted key inserted before rebuild");
                Err(Error::HashIndexOccupied)
            }
        }
    }

    /// One worker per collection, batched by the worker cap.
    fn list_based_index_rebuild(&self) -> Result<()> {
        let lists: Vec<Arc<Skiplist>> = self.rebuild_skiplists.lock().values().cloned().collect();
        for batch in lists.chunks(self.num_rebuild_threads) {
            std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(batch.len());
                for list in batch {
                    handles.push(scope.spawn(move || {
                        self.claim_worker_id();
                        self.rebuild_skiplist_index(list)
                    }));
                }
                for handle in handles {
                    handle.join().map_err(|_| Error::WorkerPanicked)??;
                }
                Ok::<(), Error>(())
            })?;
        }
        Ok(())
    }

    /// Walks one collection's on-media list, repairing versions and building
    /// the full DRAM tower as it goes.
    fn rebuild_skiplist_index(&self, list: &Skiplist) -> Result<()> {
        let mut num_elems = 0u64;
        let mut splice = Splice::for_list(list);

        loop {
            let prev_record: &DlRecord = self.allocator.offset2addr_checked(splice.prev_record);
            let next_offset = prev_record.next();
            if next_offset == list.header_offset() {
                break;
            }
            let next_record: &DlRecord = self.allocator.offset2addr_checked(next_offset);
            let internal_key = next_record.key();
            let mut guard = self.hash_index.acquire_lock(internal_key);

            match self
                .find_checkpoint_version(next_record)
                .filter(|v| v.status() != RecordStatus::Outdated)
            {
                None => {
                    if !Skiplist::remove(next_record, &self.allocator, &self.lock_table) {
                        return Err(Error::LinkageCorruption(next_offset));
                    }
                    self.add_unlinked_record(next_offset);
                }
                Some(visible) => {
                    if !ptr::eq(visible, next_record) {
                        // Put the checkpoint version back into the list.
                        if !Skiplist::replace(next_record, visible, &self.allocator, &self.lock_table)
                        {
                            return Err(Error::LinkageCorruption(next_offset));
                        }
                        self.add_unlinked_record(next_offset);
                    }
                    num_elems += 1;

                    let visible_offset = self.allocator.addr2offset_checked(visible);
                    let dram_node = skiplist::new_node_build(visible_offset);
                    if let Some(node) = dram_node {
                        // SAFETY: splice cursors only hold nodes of this list.
                        unsafe {
                            let node_ref = node.as_ref();
                            for level in 1..=node_ref.height() {
                                (*splice.prevs[level as usize]).set_next(level, node.as_ptr());
                                node_ref.set_next(level, ptr::null_mut());
                                splice.prevs[level as usize] = node.as_ptr();
                            }
                        }
                    }

                    if list.index_with_hashtable() {
                        let index = match dram_node {
                            Some(node) => IndexPtr::SkiplistNode(node),
                            None => IndexPtr::DlRecord(visible_offset),
                        };
                        self.insert_hash_index(&mut guard, internal_key, index)?;
                    }

                    visible.persist_old_version(NULL_PMEM_OFFSET);
                    splice.prev_record = visible_offset;
                }
            }
        }
        list.update_size(num_elems);
        Ok(())
    }

    /// Segment phase A then tower phase B.
    fn segment_based_index_rebuild(&self) -> Result<()> {
        info!("segment based rebuild start");
        let segments = std::mem::take(&mut *self.recovery_segments.lock());
        let rebuild_lists: HashMap<CollectionId, Arc<Skiplist>> =
            self.rebuild_skiplists.lock().clone();

        info!("build segment index");
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.num_rebuild_threads);
            for _ in 0..self.num_rebuild_threads {
                handles.push(scope.spawn(|| {
                    self.claim_worker_id();
                    self.rebuild_segments_worker(&segments, &rebuild_lists)
                }));
            }
            for handle in handles {
                handle.join().map_err(|_| Error::WorkerPanicked)??;
            }
            Ok::<(), Error>(())
        })?;

        info!("link dram nodes");
        let lists: Vec<Arc<Skiplist>> = rebuild_lists.values().cloned().collect();
        for batch in lists.chunks(self.num_rebuild_threads) {
            std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(batch.len());
                for list in batch {
                    handles.push(scope.spawn(move || {
                        self.claim_worker_id();
                        self.link_high_dram_nodes(list);
                    }));
                }
                for handle in handles {
                    handle.join().map_err(|_| Error::WorkerPanicked)?;
                }
                Ok::<(), Error>(())
            })?;
        }

        // Segment starts nominated for collections that turned out invalid
        // were never linked into a tower; release them.
        for segment in segments.values() {
            // SAFETY: unvisited or skipped nodes are owned solely by the map.
            let node = unsafe { segment.node.as_ref() };
            let record: &DlRecord = self.allocator.offset2addr_checked(node.record_offset());
            if !rebuild_lists.contains_key(&skiplist::fetch_id(record)) {
                unsafe { skiplist::dealloc_node(segment.node) };
            }
        }
        info!("segment based rebuild done");
        Ok(())
    }

    fn rebuild_segments_worker(
        &self,
        segments: &HashMap<PmemOffset, SegmentStart>,
        rebuild_lists: &HashMap<CollectionId, Arc<Skiplist>>,
    ) -> Result<()> {
        for segment in segments.values() {
            if segment
                .visited
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // SAFETY: the claim above makes this worker the only user.
            let node = unsafe { segment.node.as_ref() };
            let record: &DlRecord = self.allocator.offset2addr_checked(node.record_offset());
            let id = skiplist::fetch_id(record);
            match rebuild_lists.get(&id) {
                Some(owner) => self.rebuild_segment_index(segment.node, owner, segments)?,
                None => {
                    debug_assert!(
                        self.invalid_skiplists.lock().contains_key(&id),
                        "segment start must belong to a known skiplist"
                    );
                }
            }
        }
        Ok(())
    }

    /// Rebuilds one segment's level-1 chain, stopping at the header or at a
    /// neighboring segment's start.
    fn rebuild_segment_index(
        &self,
        start_node: NonNull<SkiplistNode>,
        owner: &Skiplist,
        segments: &HashMap<PmemOffset, SegmentStart>,
    ) -> Result<()> {
        let build_hash_index = owner.index_with_hashtable();
        let mut num_elems = 0u64;

        // SAFETY: this worker claimed the segment; the start node is shared
        // only through level-1 links set below.
        let start = unsafe { start_node.as_ref() };
        let start_record: &DlRecord = self.allocator.offset2addr_checked(start.record_offset());
        if start.record_offset() != owner.header_offset() {
            debug_assert_eq!(start_record.record_type(), RecordType::SortedElem);
            num_elems += 1;
            if build_hash_index {
                let key = start_record.key();
                let mut guard = self.hash_index.acquire_lock(key);
                self.insert_hash_index(&mut guard, key, IndexPtr::SkiplistNode(start_node))?;
            }
        }
        debug_assert!(
            self.find_checkpoint_version(start_record)
                .is_some_and(|v| ptr::eq(v, start_record)),
            "segment start must be its own checkpoint version"
        );
        start_record.persist_old_version(NULL_PMEM_OFFSET);

        let mut cur_node = start_node.as_ptr();
        let mut cur_record = start_record;
        loop {
            let next_offset = cur_record.next();
            if next_offset == owner.header_offset() {
                // SAFETY: cur_node belongs to this segment's chain.
                unsafe { (*cur_node).set_next(1, ptr::null_mut()) };
                break;
            }

            if let Some(neighbor) = segments.get(&next_offset) {
                // Hand the level-1 chain over to the adjacent segment.
                // SAFETY: neighbor nodes are immutable at level 0 here; only
                // their identity is read.
                let neighbor_node = unsafe { neighbor.node.as_ref() };
                let neighbor_record: &DlRecord =
                    self.allocator.offset2addr_checked(neighbor_node.record_offset());
                unsafe {
                    if neighbor_record.record_type() == RecordType::SortedElem {
                        (*cur_node).set_next(1, neighbor.node.as_ptr());
                    } else {
                        (*cur_node).set_next(1, ptr::null_mut());
                    }
                }
                break;
            }

            let next_record: &DlRecord = self.allocator.offset2addr_checked(next_offset);
            let internal_key = next_record.key();
            let mut guard = self.hash_index.acquire_lock(internal_key);
            match self
                .find_checkpoint_version(next_record)
                .filter(|v| v.status() != RecordStatus::Outdated)
            {
                None => {
                    if !Skiplist::remove(next_record, &self.allocator, &self.lock_table) {
                        return Err(Error::LinkageCorruption(next_offset));
                    }
                    self.add_unlinked_record(next_offset);
                }
                Some(visible) => {
                    if !ptr::eq(visible, next_record) {
                        if !Skiplist::replace(next_record, visible, &self.allocator, &self.lock_table)
                        {
                            return Err(Error::LinkageCorruption(next_offset));
                        }
                        self.add_unlinked_record(next_offset);
                    }
                    num_elems += 1;

                    let visible_offset = self.allocator.addr2offset_checked(visible);
                    let dram_node = skiplist::new_node_build(visible_offset);
                    if let Some(node) = dram_node {
                        // SAFETY: the new node is not yet shared; cur_node is
                        // owned by this segment walk.
                        unsafe {
                            (*cur_node).set_next(1, node.as_ptr());
                            node.as_ref().set_next(1, ptr::null_mut());
                            cur_node = node.as_ptr();
                        }
                    }

                    if build_hash_index {
                        let index = match dram_node {
                            Some(node) => IndexPtr::SkiplistNode(node),
                            None => IndexPtr::DlRecord(visible_offset),
                        };
                        self.insert_hash_index(&mut guard, internal_key, index)?;
                    }
                    visible.persist_old_version(NULL_PMEM_OFFSET);
                    cur_record = visible;
                }
            }
        }
        owner.update_size(num_elems);
        Ok(())
    }

    /// Phase B: one pass over level 1 splicing every taller node into its
    /// higher levels, then terminating every level's chain.
    fn link_high_dram_nodes(&self, list: &Skiplist) {
        let header = list.header_node_ptr().as_ptr();
        let mut prevs = [header; MAX_HEIGHT as usize + 1];
        // SAFETY: phase A finished, so the level-1 chain is complete and no
        // other worker touches this list's tower.
        unsafe {
            let mut next = (*header).next(1);
            while !next.is_null() {
                let node = &*next;
                prevs[1] = next;
                for level in 2..=node.height() {
                    (*prevs[level as usize]).set_next(level, next);
                    prevs[level as usize] = next;
                }
                next = node.next(1);
            }
            for level in 1..=MAX_HEIGHT {
                (*prevs[level as usize]).set_next(level, ptr::null_mut());
            }
        }
    }

    /// Destroys queued records that are still unreachable and every invalid
    /// skiplist. A queued record that became reachable again (for example as
    /// a checkpoint version spliced back in) survives both checks.
    fn clean_invalid_records(&self) {
        for cache in &self.thread_caches {
            let mut cache = cache.lock();
            let mut to_free: Vec<SpaceEntry> = Vec::new();
            for &offset in &cache.unlinked_records {
                let record: &DlRecord = self.allocator.offset2addr_checked(offset);
                if !skiplist::match_type(record) || !self.recovery_utils.check_linkage(record) {
                    record.destroy();
                    to_free.push(SpaceEntry {
                        offset,
                        size: record.record_size(),
                    });
                }
            }
            self.allocator.batch_free(to_free);
            cache.unlinked_records.clear();
        }

        let invalid = std::mem::take(&mut *self.invalid_skiplists.lock());
        for (id, list) in invalid {
            info!(collection = id, "destroying invalid skiplist");
            list.destroy();
        }
    }
}
