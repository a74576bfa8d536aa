use super::{persist_fence, PmemOffset};
use crc32fast::Hasher;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Expire time value meaning the record never expires.
pub const NEVER_EXPIRE: i64 = i64::MAX;

/// Fixed header size of a [`DlRecord`]; key and value bytes follow inline.
pub const RECORD_HEADER_SIZE: usize = std::mem::size_of::<DlRecord>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Empty = 0,
    /// Header of a sorted collection. Doubles as the list sentinel.
    SortedRecord = 1,
    /// Element of a sorted collection.
    SortedElem = 2,
    /// Dead record awaiting space reclamation.
    Padding = 3,
}

impl RecordType {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RecordType::Empty,
            1 => RecordType::SortedRecord,
            2 => RecordType::SortedElem,
            _ => RecordType::Padding,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordStatus {
    Normal = 0,
    Outdated = 1,
}

impl RecordStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RecordStatus::Normal,
            _ => RecordStatus::Outdated,
        }
    }
}

/// Construction parameters for a new on-media record.
pub struct RecordSpec<'a> {
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub timestamp: u64,
    pub expire_time: i64,
    pub old_version: PmemOffset,
    pub prev: PmemOffset,
    pub next: PmemOffset,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Doubly-linked persistent record, the on-media unit of sorted collections.
///
/// Lives at a fixed arena offset. `prev` and `next` form a circular list
/// whose header record is the sentinel; `old_version` chains backward in
/// time to prior versions of the same key. The checksum covers the
/// immutable identity fields and the payload; linkage fields, type, status
/// and expire time mutate after persist and are excluded.
#[repr(C)]
pub struct DlRecord {
    crc: u32,
    record_type: AtomicU8,
    record_status: AtomicU8,
    _reserved: [u8; 2],
    key_size: u32,
    value_size: u32,
    timestamp: u64,
    expire_time: AtomicI64,
    prev: AtomicU64,
    next: AtomicU64,
    old_version: AtomicU64,
}

impl DlRecord {
    /// Writes a record into raw arena memory and returns a reference to it.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for `RECORD_HEADER_SIZE + key.len() + value.len()`
    /// bytes, 8-byte aligned, and not aliased by any live reference.
    pub(crate) unsafe fn persist_at<'a>(addr: *mut u8, spec: &RecordSpec<'_>) -> &'a DlRecord {
        let rec = addr as *mut DlRecord;
        ptr::write(
            rec,
            DlRecord {
                crc: 0,
                record_type: AtomicU8::new(spec.record_type as u8),
                record_status: AtomicU8::new(spec.status as u8),
                _reserved: [0; 2],
                key_size: spec.key.len() as u32,
                value_size: spec.value.len() as u32,
                timestamp: spec.timestamp,
                expire_time: AtomicI64::new(spec.expire_time),
                prev: AtomicU64::new(spec.prev),
                next: AtomicU64::new(spec.next),
                old_version: AtomicU64::new(spec.old_version),
            },
        );
        let payload = addr.add(RECORD_HEADER_SIZE);
        ptr::copy_nonoverlapping(spec.key.as_ptr(), payload, spec.key.len());
        ptr::copy_nonoverlapping(spec.value.as_ptr(), payload.add(spec.key.len()), spec.value.len());
        let crc = (*rec).compute_crc();
        ptr::addr_of_mut!((*rec).crc).write(crc);
        persist_fence();
        &*rec
    }

    fn payload(&self) -> *const u8 {
        let base = self as *const DlRecord as *const u8;
        // SAFETY: the payload was written directly after the header at persist.
        unsafe { base.add(RECORD_HEADER_SIZE) }
    }

    pub fn key(&self) -> &[u8] {
        // SAFETY: key_size bytes follow the header, written at persist.
        unsafe { std::slice::from_raw_parts(self.payload(), self.key_size as usize) }
    }

    pub fn value(&self) -> &[u8] {
        // SAFETY: value bytes follow the key, written at persist.
        unsafe {
            std::slice::from_raw_parts(
                self.payload().add(self.key_size as usize),
                self.value_size as usize,
            )
        }
    }

    pub fn record_type(&self) -> RecordType {
        RecordType::from_u8(self.record_type.load(Ordering::Acquire))
    }

    pub fn status(&self) -> RecordStatus {
        RecordStatus::from_u8(self.record_status.load(Ordering::Acquire))
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn prev(&self) -> PmemOffset {
        self.prev.load(Ordering::Acquire)
    }

    pub fn next(&self) -> PmemOffset {
        self.next.load(Ordering::Acquire)
    }

    pub fn old_version(&self) -> PmemOffset {
        self.old_version.load(Ordering::Acquire)
    }

    /// Durably points `prev` at `offset`. Fenced before return.
    pub fn persist_prev(&self, offset: PmemOffset) {
        self.prev.store(offset, Ordering::Release);
        persist_fence();
    }

    /// Durably points `next` at `offset`. Fenced before return.
    pub fn persist_next(&self, offset: PmemOffset) {
        self.next.store(offset, Ordering::Release);
        persist_fence();
    }

    /// Durably rewrites the backward version pointer. Fenced before return.
    pub fn persist_old_version(&self, offset: PmemOffset) {
        self.old_version.store(offset, Ordering::Release);
        persist_fence();
    }

    /// Whether the record's identity and payload survived intact on media.
    pub fn validate(&self) -> bool {
        self.crc == self.compute_crc()
    }

    /// Marks the record dead. Space is reclaimed separately.
    pub fn destroy(&self) {
        self.record_type
            .store(RecordType::Padding as u8, Ordering::Release);
        persist_fence();
    }

    pub fn has_expired(&self) -> bool {
        let expire = self.expire_time.load(Ordering::Relaxed);
        expire != NEVER_EXPIRE && expire <= unix_millis()
    }

    /// Total on-media footprint, 8-byte aligned.
    pub fn record_size(&self) -> u64 {
        let raw = RECORD_HEADER_SIZE as u64 + self.key_size as u64 + self.value_size as u64;
        (raw + 7) & !7
    }

    fn compute_crc(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.key_size.to_le_bytes());
        hasher.update(&self.value_size.to_le_bytes());
        hasher.update(self.key());
        hasher.update(self.value());
        hasher.finalize()
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
