//! Striped point locks

use parking_lot::{Mutex, MutexGuard};

/// Fixed set of locks guarding point read-modify-writes.
///
/// A point maps to a stripe by its global ordinal, so neighbouring points of
/// one record land on different stripes.
pub(crate) struct Stripes {
    locks: Box<[Mutex<()>]>,
    record_size: usize,
}

impl Stripes {
    pub(crate) fn new(count: usize, record_size: usize) -> Self {
        Self {
            locks: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
            record_size,
        }
    }

    /// Lock the stripe owning point `point` of record `record`
    pub(crate) fn lock(&self, record: usize, point: usize) -> MutexGuard<'_, ()> {
        let ordinal = record.wrapping_mul(self.record_size).wrapping_add(point);
        self.locks[ordinal % self.locks.len()].lock()
    }

    /// Lock every stripe, in ascending order
    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.locks.iter().map(|lock| lock.lock()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbouring_points_use_different_stripes() {
        let stripes = Stripes::new(4, 3);
        let _a = stripes.lock(0, 0);
        // Would deadlock if both mapped to the same stripe
        let _b = stripes.lock(0, 1);
        let _c = stripes.lock(1, 0);
    }

    #[test]
    fn test_lock_all_excludes_point_locks() {
        let stripes = Stripes::new(8, 2);
        let guards = stripes.lock_all();
        assert_eq!(guards.len(), 8);
        assert!(stripes.locks[3].try_lock().is_none());
        drop(guards);
        assert!(stripes.locks[3].try_lock().is_some());
    }
}
