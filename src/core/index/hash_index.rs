use crate::core::pmem::{PmemOffset, RecordStatus, RecordType};
use crate::core::skiplist::{Skiplist, SkiplistNode};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::Hasher;
use std::ptr::NonNull;

/// Tagged pointer stored beside each hash entry.
///
/// The index addresses three kinds of targets; the tag travels with the
/// pointer so lookups dispatch without a vtable.
#[derive(Debug, Clone, Copy)]
pub enum IndexPtr {
    Skiplist(NonNull<Skiplist>),
    SkiplistNode(NonNull<SkiplistNode>),
    DlRecord(PmemOffset),
}

// SAFETY: the pointers target engine-owned structures that outlive their
// index entries; all mutation behind them is atomic.
unsafe impl Send for IndexPtr {}
unsafe impl Sync for IndexPtr {}

impl IndexPtr {
    /// Offset of the persistent record this entry ultimately refers to.
    pub fn record_offset(&self) -> PmemOffset {
        match self {
            // SAFETY: entries are only resolved while the owning engine keeps
            // the pointed-to structures alive.
            IndexPtr::Skiplist(list) => unsafe { list.as_ref() }.header_offset(),
            IndexPtr::SkiplistNode(node) => unsafe { node.as_ref() }.record_offset(),
            IndexPtr::DlRecord(offset) => *offset,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HashEntry {
    pub record_type: RecordType,
    pub record_status: RecordStatus,
    pub index: IndexPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Occupied,
}

/// Shared hash index over user and internal keys, lock striped.
///
/// All access to a stripe's entries goes through the guard returned by
/// [`acquire_lock`](HashIndex::acquire_lock), so holding the stripe lock
/// across a lookup-then-insert sequence is visible in the types.
pub struct HashIndex {
    stripes: Box<[Mutex<HashMap<Vec<u8>, HashEntry>>]>,
}

pub struct StripeGuard<'a> {
    map: MutexGuard<'a, HashMap<Vec<u8>, HashEntry>>,
    #[cfg(debug_assertions)]
    stripe: usize,
    #[cfg(debug_assertions)]
    owner: &'a HashIndex,
}

impl HashIndex {
    pub fn new(num_stripes: usize) -> Self {
        let num_stripes = num_stripes.max(1).next_power_of_two();
        let stripes = (0..num_stripes).map(|_| Mutex::new(HashMap::new())).collect();
        Self { stripes }
    }

    fn stripe_of(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        hasher.finish() as usize & (self.stripes.len() - 1)
    }

    /// Locks the stripe covering `key` and returns a guard for entry access.
    pub fn acquire_lock(&self, key: &[u8]) -> StripeGuard<'_> {
        let stripe = self.stripe_of(key);
        StripeGuard {
            map: self.stripes[stripe].lock(),
            #[cfg(debug_assertions)]
            stripe,
            #[cfg(debug_assertions)]
            owner: self,
        }
    }

    /// Convenience point lookup copying the entry out.
    pub fn lookup(&self, key: &[u8]) -> Option<HashEntry> {
        self.acquire_lock(key).get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StripeGuard<'_> {
    #[cfg(debug_assertions)]
    fn check_key(&self, key: &[u8]) {
        debug_assert_eq!(
            self.owner.stripe_of(key),
            self.stripe,
            "key accessed through a guard for a different stripe"
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_key(&self, _key: &[u8]) {}

    pub fn get(&self, key: &[u8]) -> Option<&HashEntry> {
        self.check_key(key);
        self.map.get(key)
    }

    /// Inserts only into an empty slot; an occupied slot is reported, never
    /// overwritten.
    pub fn insert(&mut self, key: &[u8], entry: HashEntry) -> InsertOutcome {
        self.check_key(key);
        match self.map.entry(key.to_vec()) {
            Entry::Vacant(v) => {
                v.insert(entry);
                InsertOutcome::Inserted
            }
            Entry::Occupied(_) => InsertOutcome::Occupied,
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<HashEntry> {
        self.check_key(key);
        self.map.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: PmemOffset) -> HashEntry {
        HashEntry {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            index: IndexPtr::DlRecord(offset),
        }
    }

    #[test]
    fn insert_reports_occupied_slot() {
        let index = HashIndex::new(64);
        let mut guard = index.acquire_lock(b"key");
        assert_eq!(guard.insert(b"key", entry(8)), InsertOutcome::Inserted);
        assert_eq!(guard.insert(b"key", entry(16)), InsertOutcome::Occupied);
        assert_eq!(guard.get(b"key").unwrap().index.record_offset(), 8);
        drop(guard);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn lookup_roundtrip() {
        let index = HashIndex::new(4);
        {
            let mut guard = index.acquire_lock(b"a");
            guard.insert(b"a", entry(24));
        }
        assert_eq!(index.lookup(b"a").unwrap().index.record_offset(), 24);
        assert!(index.lookup(b"b").is_none());
    }
}
