//! Persistent-memory arena and record layer.
//!
//! The arena is a memory-mapped file addressed by byte offsets. Records are
//! written in place and published with store-release plus a full fence, so a
//! linkage mutation is durable before any other worker can observe it.

pub mod record;

pub use record::{DlRecord, RecordSpec, RecordStatus, RecordType, NEVER_EXPIRE, RECORD_HEADER_SIZE};

use crate::core::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};

pub type PmemOffset = u64;

/// Null linkage value. Offset 0 is a valid arena address, so the null
/// sentinel lives at the top of the offset space.
pub const NULL_PMEM_OFFSET: PmemOffset = u64::MAX;

const ALLOC_ALIGN: u64 = 8;

/// Ordering barrier after a persistent store.
#[inline]
pub fn persist_fence() {
    fence(Ordering::SeqCst);
}

/// A contiguous extent of arena space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    pub offset: PmemOffset,
    pub size: u64,
}

/// Byte-addressable persistent-memory allocator over a mapped file.
///
/// Allocation is a bump pointer; freed extents are accumulated for reuse by
/// the engine's space manager and exposed for reclamation accounting.
pub struct PmemAllocator {
    _file: std::fs::File,
    _mmap: MmapMut,
    base: *mut u8,
    capacity: u64,
    tail: AtomicU64,
    freed: Mutex<Vec<SpaceEntry>>,
}

// SAFETY: the base pointer targets the mapping owned by this struct; all
// mutation of mapped bytes goes through atomics or exclusive raw writes to
// freshly allocated extents.
unsafe impl Send for PmemAllocator {}
unsafe impl Sync for PmemAllocator {}

impl PmemAllocator {
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Io(format!("failed to create pmem file: {}", e)))?;
        file.set_len(capacity)
            .map_err(|e| Error::Io(format!("failed to size pmem file: {}", e)))?;

        // SAFETY: the file is open read/write and sized; the map is held for
        // the allocator's lifetime.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| Error::Io(format!("failed to map pmem file: {}", e)))?;
        let base = mmap.as_mut_ptr();

        Ok(Self {
            _file: file,
            _mmap: mmap,
            base,
            capacity,
            // Offset 0 stays unallocated so freshly zeroed linkage fields
            // never alias a live record.
            tail: AtomicU64::new(ALLOC_ALIGN),
            freed: Mutex::new(Vec::new()),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocates an 8-byte aligned extent.
    pub fn allocate(&self, size: u64) -> Result<SpaceEntry> {
        let aligned = (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1);
        let offset = self.tail.fetch_add(aligned, Ordering::Relaxed);
        if offset.saturating_add(aligned) > self.capacity {
            self.tail.fetch_sub(aligned, Ordering::Relaxed);
            return Err(Error::PmemOverflow {
                requested: size,
                available: self.capacity.saturating_sub(offset),
            });
        }
        Ok(SpaceEntry {
            offset,
            size: aligned,
        })
    }

    pub fn offset2addr<T>(&self, offset: PmemOffset) -> Option<&T> {
        if offset == NULL_PMEM_OFFSET
            || offset.saturating_add(std::mem::size_of::<T>() as u64) > self.capacity
        {
            return None;
        }
        debug_assert_eq!(offset % ALLOC_ALIGN, 0);
        // SAFETY: the offset is in bounds and aligned; mapped memory outlives
        // the returned borrow.
        Some(unsafe { &*(self.base.add(offset as usize) as *const T) })
    }

    /// Like [`offset2addr`](Self::offset2addr) for offsets known to be valid.
    pub fn offset2addr_checked<T>(&self, offset: PmemOffset) -> &T {
        debug_assert!(offset != NULL_PMEM_OFFSET && offset < self.capacity);
        debug_assert_eq!(offset % ALLOC_ALIGN, 0);
        // SAFETY: as in offset2addr; the caller guarantees validity.
        unsafe { &*(self.base.add(offset as usize) as *const T) }
    }

    pub fn addr2offset<T>(&self, ptr: &T) -> Option<PmemOffset> {
        let addr = ptr as *const T as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.capacity as usize {
            return None;
        }
        Some((addr - base) as PmemOffset)
    }

    pub fn addr2offset_checked<T>(&self, ptr: &T) -> PmemOffset {
        let addr = ptr as *const T as usize;
        let base = self.base as usize;
        debug_assert!(addr >= base && addr < base + self.capacity as usize);
        (addr - base) as PmemOffset
    }

    /// Persists a new record into `space`.
    pub fn persist_record(&self, space: &SpaceEntry, spec: &RecordSpec<'_>) -> Result<&DlRecord> {
        let needed = RECORD_HEADER_SIZE as u64 + spec.key.len() as u64 + spec.value.len() as u64;
        if needed > space.size {
            return Err(Error::Internal(format!(
                "record of {} bytes does not fit extent of {} bytes",
                needed, space.size
            )));
        }
        debug_assert!(space.offset + space.size <= self.capacity);
        // SAFETY: the extent was handed out by allocate() and is not yet
        // published, so we hold the only access to it.
        Ok(unsafe { DlRecord::persist_at(self.base.add(space.offset as usize), spec) })
    }

    /// Marks the record dead and returns its extent to the free pool.
    pub fn purge_and_free(&self, record: &DlRecord) {
        record.destroy();
        let entry = SpaceEntry {
            offset: self.addr2offset_checked(record),
            size: record.record_size(),
        };
        self.freed.lock().push(entry);
    }

    pub fn batch_free(&self, spaces: Vec<SpaceEntry>) {
        if !spaces.is_empty() {
            self.freed.lock().extend(spaces);
        }
    }

    /// Snapshot of every extent freed so far.
    pub fn freed_spaces(&self) -> Vec<SpaceEntry> {
        self.freed.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator(capacity: u64) -> (tempfile::TempDir, PmemAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let alloc = PmemAllocator::create(&dir.path().join("pmem.arena"), capacity).unwrap();
        (dir, alloc)
    }

    #[test]
    fn allocate_aligns_and_overflows() {
        let (_dir, alloc) = test_allocator(4096);
        let a = alloc.allocate(13).unwrap();
        assert_eq!(a.size, 16);
        assert_eq!(a.offset % 8, 0);
        let b = alloc.allocate(8).unwrap();
        assert_eq!(b.offset, a.offset + a.size);
        assert!(matches!(
            alloc.allocate(1 << 20),
            Err(Error::PmemOverflow { .. })
        ));
    }

    #[test]
    fn record_roundtrip_and_validate() {
        let (_dir, alloc) = test_allocator(1 << 16);
        let space = alloc.allocate(256).unwrap();
        let rec = alloc
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status: RecordStatus::Normal,
                    timestamp: 42,
                    expire_time: NEVER_EXPIRE,
                    old_version: NULL_PMEM_OFFSET,
                    prev: 8,
                    next: 16,
                    key: b"internal-key",
                    value: b"value-bytes",
                },
            )
            .unwrap();
        assert_eq!(rec.key(), b"internal-key");
        assert_eq!(rec.value(), b"value-bytes");
        assert_eq!(rec.timestamp(), 42);
        assert_eq!(rec.prev(), 8);
        assert_eq!(rec.next(), 16);
        assert!(rec.validate());
        assert!(!rec.has_expired());

        rec.persist_prev(64);
        assert_eq!(rec.prev(), 64);
        assert!(rec.validate());

        rec.destroy();
        assert_eq!(rec.record_type(), RecordType::Padding);
    }

    #[test]
    fn freed_spaces_accounting() {
        let (_dir, alloc) = test_allocator(1 << 16);
        let space = alloc.allocate(128).unwrap();
        let rec = alloc
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status: RecordStatus::Normal,
                    timestamp: 1,
                    expire_time: NEVER_EXPIRE,
                    old_version: NULL_PMEM_OFFSET,
                    prev: NULL_PMEM_OFFSET,
                    next: NULL_PMEM_OFFSET,
                    key: b"k",
                    value: b"v",
                },
            )
            .unwrap();
        alloc.purge_and_free(rec);
        let freed = alloc.freed_spaces();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].offset, space.offset);
    }

    #[test]
    fn expired_record() {
        let (_dir, alloc) = test_allocator(1 << 16);
        let space = alloc.allocate(128).unwrap();
        let rec = alloc
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedRecord,
                    status: RecordStatus::Normal,
                    timestamp: 1,
                    expire_time: 1,
                    old_version: NULL_PMEM_OFFSET,
                    prev: space.offset,
                    next: space.offset,
                    key: b"list",
                    value: b"",
                },
            )
            .unwrap();
        assert!(rec.has_expired());
    }
}
