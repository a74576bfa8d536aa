//! In-memory skiplist companion to the persistent doubly-linked lists.
//!
//! Each sorted collection is a circular on-media list rooted at its header
//! record plus a probabilistic DRAM tower index. Level 1 of the tower
//! mirrors the on-media next linkage; higher levels are shortcuts only.

pub mod recovery_utils;

pub use recovery_utils::DlListRecoveryUtils;

use crate::core::error::{Error, Result};
use crate::core::index::{HashIndex, IndexPtr, LockTable};
use crate::core::pmem::{DlRecord, PmemAllocator, PmemOffset, RecordStatus, RecordType};
use crate::utils::comparator::Comparator;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Tower height cap. Headers are always built at full height.
pub const MAX_HEIGHT: u8 = 32;

pub type CollectionId = u64;

const ID_SIZE: usize = std::mem::size_of::<CollectionId>();

/// Per-collection options persisted inside the header payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedCollectionConfig {
    pub comparator_name: String,
    pub index_with_hashtable: bool,
}

impl Default for SortedCollectionConfig {
    fn default() -> Self {
        Self {
            comparator_name: crate::utils::comparator::DEFAULT_COMPARATOR_NAME.to_string(),
            index_with_hashtable: true,
        }
    }
}

/// Header payload layout: raw little-endian collection id, then the encoded
/// config. The id prefix lets [`fetch_id`] avoid a full decode.
pub fn encode_collection_value(
    id: CollectionId,
    config: &SortedCollectionConfig,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ID_SIZE + 16);
    out.extend_from_slice(&id.to_le_bytes());
    let encoded = bincode::serialize(config)
        .map_err(|e| Error::Internal(format!("failed to encode collection config: {}", e)))?;
    out.extend_from_slice(&encoded);
    Ok(out)
}

pub fn decode_collection_value(value: &[u8]) -> Result<(CollectionId, SortedCollectionConfig)> {
    if value.len() < ID_SIZE {
        return Err(Error::Decode(format!(
            "header payload of {} bytes is shorter than a collection id",
            value.len()
        )));
    }
    let mut id_bytes = [0u8; ID_SIZE];
    id_bytes.copy_from_slice(&value[..ID_SIZE]);
    let id = CollectionId::from_le_bytes(id_bytes);
    let config = bincode::deserialize(&value[ID_SIZE..])
        .map_err(|e| Error::Decode(format!("bad collection config: {}", e)))?;
    Ok((id, config))
}

/// Internal element keys carry the owning collection id ahead of the user key.
pub fn encode_internal_key(id: CollectionId, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ID_SIZE + user_key.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(user_key);
    out
}

pub fn extract_id(internal_key: &[u8]) -> CollectionId {
    debug_assert!(internal_key.len() >= ID_SIZE);
    let mut id_bytes = [0u8; ID_SIZE];
    id_bytes.copy_from_slice(&internal_key[..ID_SIZE]);
    CollectionId::from_le_bytes(id_bytes)
}

pub fn user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= ID_SIZE);
    &internal_key[ID_SIZE..]
}

/// Collection id of any sorted record: headers embed it in the payload,
/// elements in the internal key.
pub fn fetch_id(record: &DlRecord) -> CollectionId {
    match record.record_type() {
        RecordType::SortedRecord => {
            let value = record.value();
            debug_assert!(value.len() >= ID_SIZE);
            let mut id_bytes = [0u8; ID_SIZE];
            id_bytes.copy_from_slice(&value[..ID_SIZE]);
            CollectionId::from_le_bytes(id_bytes)
        }
        _ => extract_id(record.key()),
    }
}

pub fn match_type(record: &DlRecord) -> bool {
    matches!(
        record.record_type(),
        RecordType::SortedRecord | RecordType::SortedElem
    )
}

/// DRAM tower node. `record` is the pmem offset of the backing record and is
/// atomic so a replace can retarget a node in place.
pub struct SkiplistNode {
    record: AtomicU64,
    height: u8,
    tower: Box<[AtomicPtr<SkiplistNode>]>,
}

impl SkiplistNode {
    fn alloc(record_offset: PmemOffset, height: u8) -> NonNull<SkiplistNode> {
        debug_assert!(height >= 1 && height <= MAX_HEIGHT);
        let tower = (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        let node = Box::new(SkiplistNode {
            record: AtomicU64::new(record_offset),
            height,
            tower,
        });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn record_offset(&self) -> PmemOffset {
        self.record.load(Ordering::Acquire)
    }

    pub(crate) fn set_record_offset(&self, offset: PmemOffset) {
        self.record.store(offset, Ordering::Release);
    }

    /// Successor at a 1-based level.
    pub fn next(&self, level: u8) -> *mut SkiplistNode {
        debug_assert!(level >= 1 && level <= self.height);
        self.tower[level as usize - 1].load(Ordering::Acquire)
    }

    pub fn set_next(&self, level: u8, node: *mut SkiplistNode) {
        debug_assert!(level >= 1 && level <= self.height);
        self.tower[level as usize - 1].store(node, Ordering::Release);
    }
}

/// Builds a DRAM node for `record_offset` with a probabilistic height.
///
/// Roughly half of all elements draw height zero and get no node at all;
/// their hash entries target the persistent record directly. Callers that
/// must have a node (segment starts) retry until one is produced.
pub fn new_node_build(record_offset: PmemOffset) -> Option<NonNull<SkiplistNode>> {
    let height = random_height();
    if height == 0 {
        return None;
    }
    Some(SkiplistNode::alloc(record_offset, height))
}

fn random_height() -> u8 {
    let mut rng = rand::thread_rng();
    let mut height = 0u8;
    while height < MAX_HEIGHT && rng.gen::<bool>() {
        height += 1;
    }
    height
}

/// Frees a node that is not linked into any tower.
///
/// # Safety
///
/// `node` must have been produced by [`new_node_build`] (or the header
/// allocation) and must not be reachable from any other node.
pub(crate) unsafe fn dealloc_node(node: NonNull<SkiplistNode>) {
    drop(Box::from_raw(node.as_ptr()));
}

/// Per-level previous-node cursor for splicing during an ordered walk.
pub struct Splice {
    pub prevs: [*mut SkiplistNode; MAX_HEIGHT as usize + 1],
    pub prev_record: PmemOffset,
}

impl Splice {
    pub fn for_list(list: &Skiplist) -> Self {
        Self {
            prevs: [list.header_node_ptr().as_ptr(); MAX_HEIGHT as usize + 1],
            prev_record: list.header_offset(),
        }
    }
}

/// Handle over one sorted collection: the persistent header plus the DRAM
/// tower index.
pub struct Skiplist {
    name: String,
    id: CollectionId,
    header_offset: PmemOffset,
    header_node: NonNull<SkiplistNode>,
    comparator: Comparator,
    allocator: Arc<PmemAllocator>,
    hash_index: Arc<HashIndex>,
    lock_table: Arc<LockTable>,
    index_with_hashtable: bool,
    len: AtomicU64,
}

// SAFETY: all interior mutation goes through atomics; raw node pointers are
// owned by this list and freed exactly once in Drop.
unsafe impl Send for Skiplist {}
unsafe impl Sync for Skiplist {}

impl Skiplist {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        header_record: &DlRecord,
        name: String,
        id: CollectionId,
        comparator: Comparator,
        allocator: Arc<PmemAllocator>,
        hash_index: Arc<HashIndex>,
        lock_table: Arc<LockTable>,
        index_with_hashtable: bool,
    ) -> Self {
        let header_offset = allocator.addr2offset_checked(header_record);
        let header_node = SkiplistNode::alloc(header_offset, MAX_HEIGHT);
        Self {
            name,
            id,
            header_offset,
            header_node,
            comparator,
            allocator,
            hash_index,
            lock_table,
            index_with_hashtable,
            len: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn index_with_hashtable(&self) -> bool {
        self.index_with_hashtable
    }

    pub fn header_offset(&self) -> PmemOffset {
        self.header_offset
    }

    pub fn header_record(&self) -> &DlRecord {
        self.allocator.offset2addr_checked(self.header_offset)
    }

    pub fn header_node(&self) -> &SkiplistNode {
        // SAFETY: the header node lives until Drop.
        unsafe { self.header_node.as_ref() }
    }

    pub(crate) fn header_node_ptr(&self) -> NonNull<SkiplistNode> {
        self.header_node
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes a worker's element count.
    pub fn update_size(&self, delta: u64) {
        self.len.fetch_add(delta, Ordering::Relaxed);
    }

    /// Point lookup. Uses the shared hash index when this collection is
    /// indexed there, otherwise descends the tower.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        if self.index_with_hashtable {
            let internal_key = encode_internal_key(self.id, key);
            let entry = self.hash_index.lookup(&internal_key)?;
            let record: &DlRecord = match entry.index {
                IndexPtr::SkiplistNode(node) => {
                    // SAFETY: nodes indexed for this list live until Drop.
                    let offset = unsafe { node.as_ref() }.record_offset();
                    self.allocator.offset2addr_checked(offset)
                }
                IndexPtr::DlRecord(offset) => self.allocator.offset2addr_checked(offset),
                IndexPtr::Skiplist(_) => return None,
            };
            return (record.status() == RecordStatus::Normal).then(|| record.value());
        }

        let mut prev = self.header_node.as_ptr();
        // SAFETY: tower pointers only target live nodes of this list.
        unsafe {
            for level in (1..=MAX_HEIGHT).rev() {
                loop {
                    let next = (*prev).next(level);
                    if next.is_null() {
                        break;
                    }
                    let rec: &DlRecord =
                        self.allocator.offset2addr_checked((*next).record_offset());
                    if (*self.comparator)(user_key(rec.key()), key) == std::cmp::Ordering::Less {
                        prev = next;
                    } else {
                        break;
                    }
                }
            }
            let prev_rec: &DlRecord = self.allocator.offset2addr_checked((*prev).record_offset());
            let mut curr_offset = prev_rec.next();
            while curr_offset != self.header_offset {
                let rec: &DlRecord = self.allocator.offset2addr_checked(curr_offset);
                match (*self.comparator)(user_key(rec.key()), key) {
                    std::cmp::Ordering::Less => curr_offset = rec.next(),
                    std::cmp::Ordering::Equal => {
                        return (rec.status() == RecordStatus::Normal).then(|| rec.value());
                    }
                    std::cmp::Ordering::Greater => return None,
                }
            }
        }
        None
    }

    /// Iterates the on-media records between header and header.
    pub fn iter_records(&self) -> RecordIter<'_> {
        RecordIter {
            allocator: &self.allocator,
            header_offset: self.header_offset,
            curr: self.header_record().next(),
        }
    }

    /// Iterates the DRAM level-1 chain, header excluded.
    pub fn iter_nodes(&self) -> NodeIter<'_> {
        NodeIter {
            curr: self.header_node().next(1),
            _list: PhantomData,
        }
    }

    /// Frees every on-media record of this collection, header included.
    /// Used for collections that did not survive recovery.
    pub fn destroy(&self) {
        let header = self.header_record();
        let mut curr_offset = header.next();
        while curr_offset != self.header_offset {
            let record: &DlRecord = self.allocator.offset2addr_checked(curr_offset);
            let next = record.next();
            self.allocator.purge_and_free(record);
            curr_offset = next;
        }
        self.allocator.purge_and_free(header);
    }

    /// Unlinks `record` from the on-media list.
    ///
    /// Requires a committed prev side; a torn next side is tolerated so a
    /// half-inserted record can still be taken out. Returns false when the
    /// record is not linked.
    pub fn remove(record: &DlRecord, allocator: &PmemAllocator, lock_table: &LockTable) -> bool {
        let offset = allocator.addr2offset_checked(record);
        let prev_offset = record.prev();
        let next_offset = record.next();
        let _guard = lock_table.multi_guard(&[prev_offset, offset, next_offset]);
        if record.prev() != prev_offset || record.next() != next_offset {
            return false;
        }
        let prev: &DlRecord = match allocator.offset2addr(prev_offset) {
            Some(p) => p,
            None => return false,
        };
        let next: &DlRecord = match allocator.offset2addr(next_offset) {
            Some(n) => n,
            None => return false,
        };
        if prev.next() != offset {
            return false;
        }
        prev.persist_next(next_offset);
        if next.prev() == offset {
            next.persist_prev(prev_offset);
        }
        true
    }

    /// Splices `new_record` into the list in place of `old_record`.
    ///
    /// The replacement inherits the old record's neighbors; a self-linked
    /// header (empty collection) is replaced by self-linking the new record.
    pub fn replace(
        old_record: &DlRecord,
        new_record: &DlRecord,
        allocator: &PmemAllocator,
        lock_table: &LockTable,
    ) -> bool {
        let old_offset = allocator.addr2offset_checked(old_record);
        let new_offset = allocator.addr2offset_checked(new_record);
        let prev_offset = old_record.prev();
        let next_offset = old_record.next();
        let _guard = lock_table.multi_guard(&[prev_offset, old_offset, next_offset]);
        if old_record.prev() != prev_offset || old_record.next() != next_offset {
            return false;
        }
        if prev_offset == old_offset {
            debug_assert_eq!(next_offset, old_offset);
            new_record.persist_prev(new_offset);
            new_record.persist_next(new_offset);
            return true;
        }
        let prev: &DlRecord = match allocator.offset2addr(prev_offset) {
            Some(p) => p,
            None => return false,
        };
        let next: &DlRecord = match allocator.offset2addr(next_offset) {
            Some(n) => n,
            None => return false,
        };
        if prev.next() != old_offset {
            return false;
        }
        new_record.persist_prev(prev_offset);
        new_record.persist_next(next_offset);
        prev.persist_next(new_offset);
        if next.prev() == old_offset {
            next.persist_prev(new_offset);
        }
        true
    }
}

impl Drop for Skiplist {
    fn drop(&mut self) {
        // SAFETY: every node of this list is reachable through level 1 from
        // the header and owned exclusively by this list.
        unsafe {
            let mut curr = self.header_node.as_ptr();
            while !curr.is_null() {
                let next = (*curr).next(1);
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

pub struct RecordIter<'a> {
    allocator: &'a PmemAllocator,
    header_offset: PmemOffset,
    curr: PmemOffset,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a DlRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr == self.header_offset {
            return None;
        }
        let record: &'a DlRecord = self.allocator.offset2addr_checked(self.curr);
        self.curr = record.next();
        Some(record)
    }
}

pub struct NodeIter<'a> {
    curr: *mut SkiplistNode,
    _list: PhantomData<&'a Skiplist>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = &'a SkiplistNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr.is_null() {
            return None;
        }
        // SAFETY: nodes live as long as the list borrowed by this iterator.
        let node: &'a SkiplistNode = unsafe { &*self.curr };
        self.curr = node.next(1);
        Some(node)
    }
}
