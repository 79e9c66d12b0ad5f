//! Per-shard state: the arenas holding lock records and key-manager state,
//! the per-shard free lists, and the timer-wheel slot queues.
//!
//! Every key manager is bound to exactly one shard for life and every lock
//! record lives in its manager's shard, so one shard mutex guards a
//! manager's holders, waiters, wheel entries and the records they point at.
//! Records are addressed by slab slot, never by pointer; a slot is not
//! reused while any wheel or queue still references it (the record's
//! reference count reaches zero first).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::base::{LockId, LockKey};
use crate::wire::LockCommand;

use super::queue::LockQueue;
use super::{ResultSink, WHEEL_LENGTH};

/// Slot of a lock record within its shard's arena.
pub(crate) type LockSlot = u32;

/// The shared identity of a key manager: which shard owns it, which arena
/// slot its state occupies, and the unified reference count that keeps it
/// alive. References come from live lock records bound to the manager and
/// from fast-index colliders shadowed behind it; the manager is reclaimed
/// when the count reaches zero. `freed` flips once, under the index mutex,
/// when the manager is unwired; stale handles observe it and retry.
#[derive(Debug)]
pub(crate) struct ManagerHandle {
    pub(crate) shard_index: u8,
    pub(crate) slot: u32,
    pub(crate) ref_count: AtomicU32,
    pub(crate) freed: AtomicBool,
}

impl ManagerHandle {
    pub(crate) fn new(shard_index: u8, slot: u32) -> Self {
        Self {
            shard_index,
            slot,
            ref_count: AtomicU32::new(0),
            freed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }
}

/// One holder or waiter on a key.
pub(crate) struct Lock {
    pub(crate) command: LockCommand,
    pub(crate) sink: Arc<dyn ResultSink>,
    pub(crate) manager: Arc<ManagerHandle>,
    pub(crate) start_time: i64,
    pub(crate) timeout_time: i64,
    pub(crate) expried_time: i64,
    /// Reentry depth held by this record: 0 for a waiter, >= 1 for a holder.
    pub(crate) locked: u8,
    /// Live references: one for holder/waiter membership plus one per wheel
    /// slot the record is enrolled in.
    pub(crate) ref_count: u8,
    pub(crate) timeout_checked_count: u16,
    pub(crate) expried_checked_count: u16,
    pub(crate) timeouted: bool,
    pub(crate) expried: bool,
    pub(crate) is_aof: bool,
}

impl Lock {
    pub(crate) fn new(
        command: LockCommand,
        sink: Arc<dyn ResultSink>,
        manager: Arc<ManagerHandle>,
        now: i64,
    ) -> Self {
        Self {
            sink,
            manager,
            start_time: now,
            timeout_time: now + command.timeout as i64,
            expried_time: now + command.expried as i64,
            locked: 0,
            ref_count: 1,
            timeout_checked_count: 0,
            expried_checked_count: 0,
            timeouted: false,
            expried: false,
            is_aof: command.is_aof,
            command,
        }
    }
}

/// Shard-guarded state of one key manager.
pub(crate) struct ManagerState {
    pub(crate) lock_key: LockKey,
    pub(crate) db_id: u8,
    /// Sum of `locked` over all holders.
    pub(crate) locked: u16,
    /// While true, a wake cascade owns the grant order and fresh requests
    /// must queue behind it.
    pub(crate) waited: bool,
    /// The most recent successful holder, answering show-current queries.
    pub(crate) current_lock: Option<LockSlot>,
    pub(crate) holders: Vec<LockSlot>,
    pub(crate) holder_map: HashMap<LockId, LockSlot>,
    pub(crate) waiters: LockQueue<LockSlot>,
}

impl ManagerState {
    fn new(lock_key: LockKey, db_id: u8) -> Self {
        Self {
            lock_key,
            db_id,
            locked: 0,
            waited: false,
            current_lock: None,
            holders: Vec::with_capacity(4),
            holder_map: HashMap::with_capacity(8),
            waiters: LockQueue::new(16, 4096),
        }
    }

    /// Prepares a pooled state for a new key, keeping its allocations.
    fn rebind(&mut self, lock_key: LockKey, db_id: u8) {
        self.lock_key = lock_key;
        self.db_id = db_id;
        self.locked = 0;
        self.waited = false;
        self.current_lock = None;
        self.holders.clear();
        self.holder_map.clear();
        self.waiters.reset();
    }
}

pub(crate) struct Shard {
    managers: Vec<Option<ManagerState>>,
    free_managers: Vec<u32>,
    manager_pool_ceiling: usize,
    locks: Vec<Option<Lock>>,
    free_locks: Vec<u32>,
    lock_pool_ceiling: usize,
    /// One timeout and one expiry queue per wheel tick, scanned under this
    /// shard's mutex.
    pub(crate) timeout_slots: Vec<LockQueue<LockSlot>>,
    pub(crate) expiry_slots: Vec<LockQueue<LockSlot>>,
}

impl Shard {
    pub(crate) fn new(manager_pool_ceiling: usize, lock_pool_ceiling: usize) -> Self {
        Self {
            managers: Vec::new(),
            free_managers: Vec::new(),
            manager_pool_ceiling,
            locks: Vec::new(),
            free_locks: Vec::new(),
            lock_pool_ceiling,
            timeout_slots: (0..WHEEL_LENGTH).map(|_| LockQueue::new(16, 4096)).collect(),
            expiry_slots: (0..WHEEL_LENGTH).map(|_| LockQueue::new(16, 4096)).collect(),
        }
    }

    // -- manager arena --

    pub(crate) fn alloc_manager(&mut self, lock_key: LockKey, db_id: u8) -> u32 {
        if let Some(slot) = self.free_managers.pop() {
            match &mut self.managers[slot as usize] {
                Some(state) => state.rebind(lock_key, db_id),
                entry @ None => *entry = Some(ManagerState::new(lock_key, db_id)),
            }
            return slot;
        }
        self.managers.push(Some(ManagerState::new(lock_key, db_id)));
        (self.managers.len() - 1) as u32
    }

    /// Returns the state slot to the pool. Beyond the pool ceiling the
    /// state's allocations are dropped rather than retained.
    pub(crate) fn free_manager(&mut self, slot: u32) {
        if self.free_managers.len() >= self.manager_pool_ceiling {
            self.managers[slot as usize] = None;
        } else if let Some(state) = &mut self.managers[slot as usize] {
            state.rebind(LockKey::default(), 0);
        }
        self.free_managers.push(slot);
    }

    /// The manager state behind `handle`, unless the manager has been
    /// reclaimed since the handle was obtained.
    pub(crate) fn state_of(&mut self, handle: &ManagerHandle) -> Option<&mut ManagerState> {
        if handle.is_freed() {
            return None;
        }
        Some(
            self.managers[handle.slot as usize]
                .as_mut()
                .expect("unfreed manager has live state"),
        )
    }

    pub(crate) fn state_ref(&self, handle: &ManagerHandle) -> Option<&ManagerState> {
        if handle.is_freed() {
            return None;
        }
        Some(
            self.managers[handle.slot as usize]
                .as_ref()
                .expect("unfreed manager has live state"),
        )
    }

    // -- lock arena --

    pub(crate) fn alloc_lock(&mut self, lock: Lock) -> LockSlot {
        if let Some(slot) = self.free_locks.pop() {
            self.locks[slot as usize] = Some(lock);
            return slot;
        }
        self.locks.push(Some(lock));
        (self.locks.len() - 1) as u32
    }

    pub(crate) fn free_lock(&mut self, slot: LockSlot) {
        self.locks[slot as usize] = None;
        if self.free_locks.len() < self.lock_pool_ceiling {
            self.free_locks.push(slot);
        }
    }

    pub(crate) fn lock(&self, slot: LockSlot) -> &Lock {
        self.locks[slot as usize].as_ref().expect("live lock record")
    }

    pub(crate) fn lock_mut(&mut self, slot: LockSlot) -> &mut Lock {
        self.locks[slot as usize].as_mut().expect("live lock record")
    }

    // -- per-manager operations (all under this shard's mutex) --

    pub(crate) fn get_locked(&self, mgr: &ManagerState, lock_id: &LockId) -> Option<LockSlot> {
        mgr.holder_map.get(lock_id).copied()
    }

    pub(crate) fn add_lock(&mut self, mgr_slot: u32, lock_slot: LockSlot) {
        let lock_id = self.lock(lock_slot).command.lock_id;
        let mgr = self.managers[mgr_slot as usize]
            .as_mut()
            .expect("live manager state");
        mgr.holders.push(lock_slot);
        mgr.holder_map.insert(lock_id, lock_slot);
        mgr.current_lock = Some(lock_slot);
    }

    /// Drops `lock_slot` from the holder set, promoting any remaining holder
    /// to `current_lock`. Reference counts are the caller's business.
    pub(crate) fn remove_lock(&mut self, mgr_slot: u32, lock_slot: LockSlot) {
        let lock_id = self.lock(lock_slot).command.lock_id;
        let mgr = self.managers[mgr_slot as usize]
            .as_mut()
            .expect("live manager state");
        mgr.holders.retain(|&slot| slot != lock_slot);
        if mgr.holder_map.get(&lock_id) == Some(&lock_slot) {
            mgr.holder_map.remove(&lock_id);
        }
        if mgr.current_lock == Some(lock_slot) {
            mgr.current_lock = mgr.holders.last().copied();
        }
    }

    pub(crate) fn add_wait_lock(&mut self, mgr_slot: u32, lock_slot: LockSlot) {
        let mgr = self.managers[mgr_slot as usize]
            .as_mut()
            .expect("live manager state");
        mgr.waiters.push(lock_slot);
        mgr.waited = true;
    }

    /// Refreshes a holder's timing and counters in place. The record's wheel
    /// enrollment is left alone: the expiry scan re-checks `expried_time`
    /// and re-enrolls records that are not yet due.
    pub(crate) fn update_locked(
        &mut self,
        lock_slot: LockSlot,
        now: i64,
        timeout: u16,
        expried: u16,
        count: u16,
        rcount: u8,
    ) {
        let lock = self.lock_mut(lock_slot);
        lock.command.timeout = timeout;
        lock.command.expried = expried;
        lock.command.count = count;
        lock.command.rcount = rcount;
        lock.expried_time = now + expried as i64;
    }

    /// Test and admin introspection: live record count in the arena.
    #[cfg(test)]
    pub(crate) fn live_locks(&self) -> usize {
        self.locks.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn live_managers(&self) -> Vec<&ManagerState> {
        let free: std::collections::HashSet<u32> = self.free_managers.iter().copied().collect();
        self.managers
            .iter()
            .enumerate()
            .filter(|(slot, _)| !free.contains(&(*slot as u32)))
            .filter_map(|(_, state)| state.as_ref())
            .collect()
    }

    /// Clears every arena, free list and wheel slot. Used by FLUSHDB.
    pub(crate) fn clear(&mut self) {
        self.managers.clear();
        self.free_managers.clear();
        self.locks.clear();
        self.free_locks.clear();
        for queue in &mut self.timeout_slots {
            queue.reset();
        }
        for queue in &mut self.expiry_slots {
            queue.reset();
        }
    }
}
