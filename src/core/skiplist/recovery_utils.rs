use crate::core::pmem::{DlRecord, PmemAllocator};
use std::sync::Arc;

/// Linkage checks and repair for doubly-linked persistent records.
///
/// List inserts persist the new record first, then the predecessor's `next`,
/// then the successor's `prev`. A record whose prev side is linked but whose
/// next side is torn therefore had a committed insert and is rolled forward
/// by repairing the successor. A record whose prev side is broken never
/// committed (or its remove already did) and must not be resurrected.
pub struct DlListRecoveryUtils {
    allocator: Arc<PmemAllocator>,
}

impl DlListRecoveryUtils {
    pub fn new(allocator: Arc<PmemAllocator>) -> Self {
        Self { allocator }
    }

    /// Whether the predecessor points back at `record`.
    pub fn check_prev_linkage(&self, record: &DlRecord) -> bool {
        let offset = self.allocator.addr2offset_checked(record);
        match self.allocator.offset2addr::<DlRecord>(record.prev()) {
            Some(prev) => prev.next() == offset,
            None => false,
        }
    }

    /// Whether the successor points back at `record`.
    pub fn check_next_linkage(&self, record: &DlRecord) -> bool {
        let offset = self.allocator.addr2offset_checked(record);
        match self.allocator.offset2addr::<DlRecord>(record.next()) {
            Some(next) => next.prev() == offset,
            None => false,
        }
    }

    pub fn check_linkage(&self, record: &DlRecord) -> bool {
        self.check_prev_linkage(record) && self.check_next_linkage(record)
    }

    /// Repairs at most the torn next side; returns true iff both sides point
    /// back at `record` afterwards.
    pub fn check_and_repair_linkage(&self, record: &DlRecord) -> bool {
        if !self.check_prev_linkage(record) {
            return false;
        }
        if !self.check_next_linkage(record) {
            let offset = self.allocator.addr2offset_checked(record);
            let next: &DlRecord = self.allocator.offset2addr_checked(record.next());
            next.persist_prev(offset);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pmem::{RecordSpec, RecordStatus, RecordType, NEVER_EXPIRE, NULL_PMEM_OFFSET};

    fn write(alloc: &PmemAllocator, key: &[u8], prev: u64, next: u64) -> u64 {
        let space = alloc.allocate(128).unwrap();
        alloc
            .persist_record(
                &space,
                &RecordSpec {
                    record_type: RecordType::SortedElem,
                    status: RecordStatus::Normal,
                    timestamp: 1,
                    expire_time: NEVER_EXPIRE,
                    old_version: NULL_PMEM_OFFSET,
                    prev,
                    next,
                    key,
                    value: b"",
                },
            )
            .unwrap();
        space.offset
    }

    #[test]
    fn torn_next_side_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = Arc::new(PmemAllocator::create(&dir.path().join("arena"), 1 << 16).unwrap());
        let utils = DlListRecoveryUtils::new(alloc.clone());

        // Header h and element a fully linked, then b's insert torn before
        // the successor (h) learned about it.
        let h = write(&alloc, b"h", NULL_PMEM_OFFSET, NULL_PMEM_OFFSET);
        let a = write(&alloc, b"a", h, h);
        let hr: &DlRecord = alloc.offset2addr_checked(h);
        hr.persist_prev(a);
        hr.persist_next(a);
        let b = write(&alloc, b"b", a, h);
        let ar: &DlRecord = alloc.offset2addr_checked(a);
        ar.persist_next(b);
        // h.prev still points at a: the torn side.
        let br: &DlRecord = alloc.offset2addr_checked(b);
        assert!(!utils.check_next_linkage(br));
        assert!(utils.check_and_repair_linkage(br));
        assert!(utils.check_linkage(br));
        assert_eq!(hr.prev(), b);
    }

    #[test]
    fn broken_prev_side_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = Arc::new(PmemAllocator::create(&dir.path().join("arena"), 1 << 16).unwrap());
        let utils = DlListRecoveryUtils::new(alloc.clone());

        let h = write(&alloc, b"h", NULL_PMEM_OFFSET, NULL_PMEM_OFFSET);
        let hr: &DlRecord = alloc.offset2addr_checked(h);
        hr.persist_prev(h);
        hr.persist_next(h);
        // Record persisted but never linked by its neighbors.
        let b = write(&alloc, b"b", h, h);
        let br: &DlRecord = alloc.offset2addr_checked(b);
        assert!(!utils.check_and_repair_linkage(br));
        // The header was left untouched.
        assert_eq!(hr.prev(), h);
        assert_eq!(hr.next(), h);
    }
}
