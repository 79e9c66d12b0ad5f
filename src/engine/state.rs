//! Per-database counters. Increments and decrements are relaxed: the block
//! is monotone bookkeeping, not linearized with the operations it measures,
//! and decrements are wrapping subtractions exactly as they appear on the
//! wire.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::wire::DbState;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) lock_count: AtomicU64,
    pub(crate) unlock_count: AtomicU64,
    pub(crate) locked_count: AtomicU32,
    pub(crate) wait_count: AtomicU32,
    pub(crate) timeouted_count: AtomicU32,
    pub(crate) expried_count: AtomicU32,
    pub(crate) unlock_error_count: AtomicU32,
    pub(crate) key_count: AtomicU32,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> DbState {
        DbState {
            lock_count: self.lock_count.load(Ordering::Relaxed),
            unlock_count: self.unlock_count.load(Ordering::Relaxed),
            locked_count: self.locked_count.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            timeouted_count: self.timeouted_count.load(Ordering::Relaxed),
            expried_count: self.expried_count.load(Ordering::Relaxed),
            unlock_error_count: self.unlock_error_count.load(Ordering::Relaxed),
            key_count: self.key_count.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.lock_count.store(0, Ordering::Relaxed);
        self.unlock_count.store(0, Ordering::Relaxed);
        self.locked_count.store(0, Ordering::Relaxed);
        self.wait_count.store(0, Ordering::Relaxed);
        self.timeouted_count.store(0, Ordering::Relaxed);
        self.expried_count.store(0, Ordering::Relaxed);
        self.unlock_error_count.store(0, Ordering::Relaxed);
        self.key_count.store(0, Ordering::Relaxed);
    }
}
