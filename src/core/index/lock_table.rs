use crate::core::pmem::PmemOffset;
use parking_lot::{Mutex, MutexGuard};

/// Striped lock table keyed by persistent-memory offsets.
///
/// Linkage mutations lock every record they touch through one
/// [`multi_guard`](LockTable::multi_guard) call; stripe indices are sorted
/// and deduplicated before locking so two workers can never deadlock on an
/// overlapping record set.
pub struct LockTable {
    stripes: Box<[Mutex<()>]>,
}

pub struct MultiGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl LockTable {
    pub fn new(num_stripes: usize) -> Self {
        let num_stripes = num_stripes.max(1).next_power_of_two();
        let stripes = (0..num_stripes).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    fn stripe_of(&self, offset: PmemOffset) -> usize {
        let mixed = offset.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        mixed as usize & (self.stripes.len() - 1)
    }

    pub fn multi_guard(&self, offsets: &[PmemOffset]) -> MultiGuard<'_> {
        let mut slots: Vec<usize> = offsets.iter().map(|&o| self.stripe_of(o)).collect();
        slots.sort_unstable();
        slots.dedup();
        let guards = slots.into_iter().map(|i| self.stripes[i].lock()).collect();
        MultiGuard { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_guards_do_not_deadlock() {
        let table = std::sync::Arc::new(LockTable::new(16));
        let offsets: Vec<u64> = (0..64u64).map(|i| i * 8).collect();
        let mut handles = Vec::new();
        for t in 0..4 {
            let table = table.clone();
            let offsets = offsets.clone();
            handles.push(std::thread::spawn(move || {
                for w in offsets.windows(3) {
                    let set = if t % 2 == 0 {
                        [w[0], w[1], w[2]]
                    } else {
                        [w[2], w[1], w[0]]
                    };
                    let _g = table.multi_guard(&set);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn duplicate_offsets_collapse() {
        let table = LockTable::new(8);
        let _g = table.multi_guard(&[8, 8, 8]);
    }
}
