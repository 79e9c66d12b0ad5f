//! # Lock Engine
//!
//! The in-memory lock database. One [`LockDb`] exists per wire-level db id
//! and holds:
//!
//! - 64 shards, each behind its own mutex, partitioning every key manager
//!   and lock record for life;
//! - a fast key index (see [`index`]) behind the per-db index mutex;
//! - two 16-slot timer wheels, the timeout wheel for waiters and the expiry
//!   wheel for holders, with the slot queues living inside the shards;
//! - the relaxed counter block reported by the STATE command.
//!
//! ## Locking rules
//!
//! A shard mutex is acquired before the index mutex, never the other way
//! around, and no two shard mutexes are held at once. The one exception is
//! the tick barrier: before scanning a published tick, the checker thread
//! acquires and immediately releases every shard mutex in order. That is a
//! publication fence, not a critical section: any request that read the
//! previous tick value has finished enrolling by the time the barrier
//! completes. Results are never delivered while a mutex is held; the state
//! machines stage their responses and deliver after unlocking.
//!
//! ## Background threads
//!
//! Each database runs four: a wall-clock updater (500ms), the timeout
//! checker (1s), the expiry checker (1s) and the fast-index resize watcher
//! (1s).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::aof::{Aof, AofEvent};
use crate::config::DbConfig;
use crate::wire::{
    DbState, LOCK_FLAG_SHOW_WHEN_LOCKED, LOCK_FLAG_UPDATE_WHEN_LOCKED, LockCommand, LockResult,
    ResultCode, UNLOCK_FLAG_UNLOCK_CURRENT,
};

mod index;
mod queue;
mod shard;
mod state;
#[cfg(test)]
mod tests;

use index::{KeyIndex, new_segment};
use shard::{Lock, LockSlot, ManagerHandle, Shard};
use state::Counters;

pub(crate) const SHARD_COUNT: usize = 64;
pub(crate) const WHEEL_LENGTH: usize = 16;
const WHEEL_MASK: usize = WHEEL_LENGTH - 1;
/// Re-enrollment step ceiling: a not-yet-due record is revisited at most
/// this many ticks later, spreading wheel cost over revolutions.
const WHEEL_STEP_MAX: u16 = 5;
/// Slots moved per index-mutex hold while the fast index doubles.
const RESIZE_BATCH: u64 = 4096;

/// The engine's view of whatever transport issued a command. Delivery must
/// not block: the engine calls it between mutex holds, sometimes from a
/// timer thread.
pub trait ResultSink: Send + Sync {
    /// Deliver the single result for a previously submitted command.
    /// `reused_from_caller` hints that the result belongs to the same
    /// connection whose request triggered this delivery, so its write
    /// buffer may be reused.
    fn deliver(&self, result: LockResult, reused_from_caller: bool);

    /// Peer label for log lines.
    fn peer(&self) -> String;
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs() as i64
}

/// One lock database: every key, holder, waiter and wheel entry for a
/// single db id.
pub struct LockDb {
    db_id: u8,
    shards: Vec<Mutex<Shard>>,
    index: Mutex<KeyIndex>,
    counters: Counters,
    current_time: AtomicI64,
    check_timeout_time: AtomicI64,
    check_expried_time: AtomicI64,
    is_stop: AtomicBool,
    next_shard: AtomicUsize,
    aof: Option<Arc<Aof>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    config: DbConfig,
}

impl LockDb {
    pub fn new(db_id: u8, config: DbConfig, aof: Option<Arc<Aof>>) -> Arc<Self> {
        let now = now_unix();
        let manager_pool_per_shard = config.manager_pool_ceiling / SHARD_COUNT + 1;
        let db = Arc::new(Self {
            db_id,
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(Shard::new(manager_pool_per_shard, config.lock_pool_ceiling)))
                .collect(),
            index: Mutex::new(KeyIndex::new(config.fast_seg_shift)),
            counters: Counters::default(),
            current_time: AtomicI64::new(now),
            check_timeout_time: AtomicI64::new(now),
            check_expried_time: AtomicI64::new(now),
            is_stop: AtomicBool::new(false),
            next_shard: AtomicUsize::new(0),
            aof,
            threads: Mutex::new(Vec::new()),
            config,
        });

        let mut threads = db.threads.lock();
        let clock_db = db.clone();
        threads.push(thread::spawn(move || clock_db.run_clock()));
        let timeout_db = db.clone();
        threads.push(thread::spawn(move || timeout_db.run_timeout_checker()));
        let expiry_db = db.clone();
        threads.push(thread::spawn(move || expiry_db.run_expiry_checker()));
        let resize_db = db.clone();
        threads.push(thread::spawn(move || resize_db.run_resize_watcher()));
        drop(threads);
        db
    }

    pub fn db_id(&self) -> u8 {
        self.db_id
    }

    pub fn state(&self) -> DbState {
        self.counters.snapshot()
    }

    fn is_stopped(&self) -> bool {
        self.is_stop.load(Ordering::Relaxed)
    }

    /// Stops the background threads and waits for them to exit.
    pub fn stop(&self) {
        self.is_stop.store(true, Ordering::Relaxed);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Drops every key, holder, waiter and wheel entry. Pending waiters are
    /// discarded without a response; this is the admin FLUSHDB hammer.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        self.index.lock().clear();
        self.counters.reset();
        info!(db_id = self.db_id, "flushed lock database");
    }

    // -- manager wiring ---------------------------------------------------

    /// Finds or creates the manager for `command`'s key. The returned
    /// handle carries one reserved reference, taken under the index mutex,
    /// so a concurrent reclamation cannot invalidate it; the reservation is
    /// either transferred to the lock record the caller allocates or
    /// released through [`Self::release_reservation`].
    fn get_or_new_manager(&self, command: &LockCommand) -> Arc<ManagerHandle> {
        {
            let index = self.index.lock();
            if let Some(handle) = index.probe(&command.lock_key) {
                handle.ref_count.fetch_add(1, Ordering::AcqRel);
                return handle;
            }
        }

        // allocate state first: the shard mutex comes before the index
        // mutex in the lock order
        let shard_index = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let slot = {
            let mut shard = self.shards[shard_index].lock();
            shard.alloc_manager(command.lock_key, command.db_id)
        };
        let handle = Arc::new(ManagerHandle::new(shard_index as u8, slot));

        let raced = {
            let mut index = self.index.lock();
            if let Some(existing) = index.probe(&command.lock_key) {
                // another request bound the key first
                existing.ref_count.fetch_add(1, Ordering::AcqRel);
                Some(existing)
            } else {
                handle.ref_count.fetch_add(1, Ordering::AcqRel);
                index.insert(command.lock_key, handle.clone());
                self.counters.key_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        match raced {
            Some(existing) => {
                self.shards[shard_index].lock().free_manager(slot);
                existing
            }
            None => handle,
        }
    }

    fn get_manager(&self, command: &LockCommand) -> Option<Arc<ManagerHandle>> {
        self.index.lock().probe(&command.lock_key)
    }

    /// Releases one manager reference without a lock record attached.
    /// Returns a foreign orphan whose state must be freed after the current
    /// shard critical section.
    fn release_reservation(
        &self,
        shard: &mut Shard,
        handle: &Arc<ManagerHandle>,
    ) -> Option<Arc<ManagerHandle>> {
        if handle.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            return self.remove_manager(shard, handle);
        }
        None
    }

    /// Unwires and reclaims `handle` once its reference count reached zero.
    /// Must run under `handle`'s own shard mutex. Returns an orphaned slot
    /// owner living in another shard, whose state the caller frees after
    /// releasing this shard.
    fn remove_manager(
        &self,
        shard: &mut Shard,
        handle: &Arc<ManagerHandle>,
    ) -> Option<Arc<ManagerHandle>> {
        let key = match shard.state_of(handle) {
            Some(state) => state.lock_key,
            None => return None,
        };
        let orphan = {
            let mut index = self.index.lock();
            // a reservation taken under the index mutex resurrects the
            // manager; leave it alone
            if handle.ref_count.load(Ordering::Acquire) != 0 {
                return None;
            }
            if handle.freed.swap(true, Ordering::AcqRel) {
                return None;
            }
            index.remove(&key, handle)
        };
        self.counters.key_count.fetch_sub(1, Ordering::Relaxed);
        shard.free_manager(handle.slot);
        if let Some(owner) = orphan {
            self.counters.key_count.fetch_sub(1, Ordering::Relaxed);
            if owner.shard_index == handle.shard_index {
                shard.free_manager(owner.slot);
            } else {
                return Some(owner);
            }
        }
        None
    }

    fn free_foreign_state(&self, handle: &Arc<ManagerHandle>) {
        let mut shard = self.shards[handle.shard_index as usize].lock();
        shard.free_manager(handle.slot);
    }

    /// Releases one reference on a lock record; frees the record at zero
    /// and reclaims its manager when that was the manager's last reference.
    fn drop_lock_ref(&self, shard: &mut Shard, slot: LockSlot) -> Option<Arc<ManagerHandle>> {
        let lock = shard.lock_mut(slot);
        lock.ref_count -= 1;
        if lock.ref_count > 0 {
            return None;
        }
        let handle = lock.manager.clone();
        shard.free_lock(slot);
        if handle.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            return self.remove_manager(shard, &handle);
        }
        None
    }

    // -- waiter queue -----------------------------------------------------

    /// First live waiter of the manager, pruning and reclaiming timeouted
    /// records at the head. The live head stays enqueued; granting it marks
    /// it timeouted and re-calls this to prune it. Sets `waited` while a
    /// live waiter exists, clears it when the queue drains.
    fn get_wait_lock(
        &self,
        shard: &mut Shard,
        handle: &Arc<ManagerHandle>,
        deferred: &mut Vec<Arc<ManagerHandle>>,
    ) -> Option<LockSlot> {
        loop {
            let head = shard.state_of(handle).and_then(|s| s.waiters.peek_left());
            let Some(head) = head else {
                if let Some(state) = shard.state_of(handle) {
                    state.waited = false;
                }
                return None;
            };
            if shard.lock(head).timeouted {
                shard
                    .state_of(handle)
                    .expect("manager alive while pruning")
                    .waiters
                    .pop_left();
                if let Some(orphan) = self.drop_lock_ref(shard, head) {
                    deferred.push(orphan);
                }
                continue;
            }
            shard
                .state_of(handle)
                .expect("manager alive while peeking")
                .waited = true;
            return Some(head);
        }
    }

    /// Whether `slot` may hold the key right now. A free key always grants;
    /// a queue-owned key (waited) never grants; otherwise the shared-count
    /// rule admits up to the smaller of the current holder's and the
    /// requester's `count`.
    fn can_grant(&self, shard: &Shard, handle: &Arc<ManagerHandle>, slot: LockSlot) -> bool {
        let Some(state) = shard.state_ref(handle) else {
            return false;
        };
        if state.locked == 0 {
            return true;
        }
        if state.waited {
            return false;
        }
        let Some(current) = state.current_lock else {
            return false;
        };
        state.locked <= shard.lock(current).command.count
            && state.locked <= shard.lock(slot).command.count
    }

    // -- timer wheels -----------------------------------------------------

    fn enroll_timeout(&self, shard: &mut Shard, slot: LockSlot) {
        let check = self.check_timeout_time.load(Ordering::Relaxed);
        let wheel = {
            let lock = shard.lock(slot);
            let step = lock.timeout_checked_count.min(WHEEL_STEP_MAX) as i64;
            let mut at = check + step;
            if lock.timeout_time < at {
                at = lock.timeout_time.max(check);
            }
            at as usize & WHEEL_MASK
        };
        shard.timeout_slots[wheel].push(slot);
    }

    fn enroll_expried(&self, shard: &mut Shard, slot: LockSlot) {
        let check = self.check_expried_time.load(Ordering::Relaxed);
        let wheel = {
            let lock = shard.lock(slot);
            let step = lock.expried_checked_count.min(WHEEL_STEP_MAX) as i64;
            let mut at = check + step;
            if lock.expried_time < at {
                at = lock.expried_time.max(check);
            }
            at as usize & WHEEL_MASK
        };
        shard.expiry_slots[wheel].push(slot);
    }

    fn run_clock(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(Duration::from_millis(500));
            self.current_time.store(now_unix(), Ordering::Relaxed);
        }
    }

    fn run_timeout_checker(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(Duration::from_secs(1));

            let mut tick = self.check_timeout_time.load(Ordering::Relaxed);
            let now = self.current_time.load(Ordering::Relaxed);
            self.check_timeout_time.store(now + 1, Ordering::Relaxed);
            // publication fence: everyone who read the previous tick value
            // has finished enrolling once each shard mutex cycles
            for shard in &self.shards {
                drop(shard.lock());
            }
            while tick <= now {
                self.scan_timeout_tick(tick, now);
                tick += 1;
            }
        }
    }

    fn run_expiry_checker(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(Duration::from_secs(1));

            let mut tick = self.check_expried_time.load(Ordering::Relaxed);
            let now = self.current_time.load(Ordering::Relaxed);
            self.check_expried_time.store(now + 1, Ordering::Relaxed);
            for shard in &self.shards {
                drop(shard.lock());
            }
            while tick <= now {
                self.scan_expried_tick(tick, now);
                tick += 1;
            }
        }
    }

    fn scan_timeout_tick(&self, tick: i64, now: i64) {
        let wheel = tick as usize & WHEEL_MASK;
        let mut fire: Vec<(usize, LockSlot)> = Vec::new();
        for shard_index in 0..SHARD_COUNT {
            let mut deferred = Vec::new();
            {
                let mut guard = self.shards[shard_index].lock();
                let shard = &mut *guard;
                // drain before processing: a re-enrollment may land back in
                // the slot being scanned and must not extend the drain
                let mut staged = Vec::with_capacity(shard.timeout_slots[wheel].len());
                while let Some(slot) = shard.timeout_slots[wheel].pop_left() {
                    staged.push(slot);
                }
                for slot in staged {
                    let (dead, due) = {
                        let lock = shard.lock(slot);
                        (lock.timeouted, lock.timeout_time <= now)
                    };
                    if dead {
                        if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                            deferred.push(orphan);
                        }
                    } else if !due {
                        shard.lock_mut(slot).timeout_checked_count += 1;
                        self.enroll_timeout(shard, slot);
                    } else {
                        fire.push((shard_index, slot));
                    }
                }
            }
            for orphan in deferred {
                self.free_foreign_state(&orphan);
            }
        }
        for (shard_index, slot) in fire {
            self.do_timeout(shard_index, slot);
        }
    }

    fn scan_expried_tick(&self, tick: i64, now: i64) {
        let wheel = tick as usize & WHEEL_MASK;
        let mut fire: Vec<(usize, LockSlot)> = Vec::new();
        for shard_index in 0..SHARD_COUNT {
            let mut deferred = Vec::new();
            {
                let mut guard = self.shards[shard_index].lock();
                let shard = &mut *guard;
                let mut staged = Vec::with_capacity(shard.expiry_slots[wheel].len());
                while let Some(slot) = shard.expiry_slots[wheel].pop_left() {
                    staged.push(slot);
                }
                for slot in staged {
                    let (dead, due) = {
                        let lock = shard.lock(slot);
                        (lock.expried, lock.expried_time <= now)
                    };
                    if dead {
                        if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                            deferred.push(orphan);
                        }
                    } else if !due {
                        shard.lock_mut(slot).expried_checked_count += 1;
                        self.enroll_expried(shard, slot);
                    } else {
                        fire.push((shard_index, slot));
                    }
                }
            }
            for orphan in deferred {
                self.free_foreign_state(&orphan);
            }
        }
        for (shard_index, slot) in fire {
            self.do_expried(shard_index, slot);
        }
    }

    /// Fires a timeout for a still-waiting record.
    fn do_timeout(&self, shard_index: usize, slot: LockSlot) {
        let mut deferred = Vec::new();
        let mut response = None;
        {
            let mut guard = self.shards[shard_index].lock();
            let shard = &mut *guard;
            if shard.lock(slot).timeouted {
                // fired or granted since staging: just release the wheel
                if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                    deferred.push(orphan);
                }
            } else {
                let handle = shard.lock(slot).manager.clone();
                shard.lock_mut(slot).timeouted = true;
                // prune it from the queue head if it is the head; a
                // mid-queue record is skipped lazily later
                let _ = self.get_wait_lock(shard, &handle, &mut deferred);
                let (command, sink) = {
                    let lock = shard.lock(slot);
                    (lock.command, lock.sink.clone())
                };
                let locked = shard.state_ref(&handle).map_or(0, |s| s.locked);
                if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                    deferred.push(orphan);
                }
                response = Some((command, sink, locked));
            }
        }
        for orphan in deferred {
            self.free_foreign_state(&orphan);
        }
        if let Some((command, sink, locked)) = response {
            sink.deliver(LockResult::of(&command, ResultCode::Timeout, locked), false);
            self.counters.wait_count.fetch_sub(1, Ordering::Relaxed);
            self.counters.timeouted_count.fetch_add(1, Ordering::Relaxed);
            info!(
                db_id = command.db_id,
                lock_key = ?command.lock_key,
                lock_id = ?command.lock_id,
                request_id = ?command.request_id,
                peer = %sink.peer(),
                "LockTimeout",
            );
        }
    }

    /// Fires an expiry for a still-held record and wakes the next waiters.
    fn do_expried(&self, shard_index: usize, slot: LockSlot) {
        let mut deferred = Vec::new();
        let mut response = None;
        let mut cascade = None;
        {
            let mut guard = self.shards[shard_index].lock();
            let shard = &mut *guard;
            if shard.lock(slot).expried {
                // released since staging: just release the wheel reference
                if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                    deferred.push(orphan);
                }
            } else {
                let (command, sink, handle, lock_locked) = {
                    let lock = shard.lock(slot);
                    (lock.command, lock.sink.clone(), lock.manager.clone(), lock.locked)
                };
                shard.lock_mut(slot).expried = true;
                shard.remove_lock(handle.slot, slot);
                if let Some(state) = shard.state_of(&handle) {
                    state.locked -= lock_locked as u16;
                }
                let wait = self.get_wait_lock(shard, &handle, &mut deferred);
                let locked = shard.state_ref(&handle).map_or(0, |s| s.locked);
                // holder membership, then the wheel reference
                if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                    deferred.push(orphan);
                }
                if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                    deferred.push(orphan);
                }
                response = Some((command, sink, locked, lock_locked));
                if let Some(wait) = wait {
                    cascade = Some((handle, wait));
                }
            }
        }
        for orphan in deferred {
            self.free_foreign_state(&orphan);
        }
        if let Some((command, sink, locked, lock_locked)) = response {
            sink.deliver(LockResult::of(&command, ResultCode::Expried, locked), false);
            self.counters
                .locked_count
                .fetch_sub(lock_locked as u32, Ordering::Relaxed);
            self.counters
                .expried_count
                .fetch_add(lock_locked as u32, Ordering::Relaxed);
            info!(
                db_id = command.db_id,
                lock_key = ?command.lock_key,
                lock_id = ?command.lock_id,
                request_id = ?command.request_id,
                peer = %sink.peer(),
                "LockExpried",
            );
        }
        if let Some((handle, wait)) = cascade {
            self.wake_cascade(&handle, wait, None);
        }
    }

    // -- state machines ---------------------------------------------------

    /// The LOCK entry point. Exactly one result is delivered to `sink`,
    /// either here, from a wake cascade, or from the timeout wheel.
    pub fn lock(&self, sink: Arc<dyn ResultSink>, mut command: LockCommand) {
        let handle = self.get_or_new_manager(&command);
        let now = self.current_time.load(Ordering::Relaxed);

        let mut deferred = Vec::new();
        let mut response = None;
        {
            let mut guard = self.shards[handle.shard_index as usize].lock();
            let shard = &mut *guard;
            debug_assert!(!handle.is_freed(), "reservation pins the manager");

            let locked_now = shard.state_ref(&handle).map_or(0, |s| s.locked);
            let held = shard
                .state_ref(&handle)
                .and_then(|s| shard.get_locked(s, &command.lock_id));
            if locked_now > 0 {
                if command.flag & LOCK_FLAG_SHOW_WHEN_LOCKED != 0 {
                    let state = shard.state_ref(&handle).expect("reserved manager");
                    if let Some(current) = state.current_lock {
                        let current = shard.lock(current);
                        command.lock_id = current.command.lock_id;
                        command.expried = (current.expried_time - current.start_time) as u16;
                        command.timeout = current.command.timeout;
                        command.count = current.command.count;
                        command.rcount = current.command.rcount;
                    }
                    if let Some(orphan) = self.release_reservation(shard, &handle) {
                        deferred.push(orphan);
                    }
                    response = Some((ResultCode::UnownError, locked_now, command));
                } else if let Some(held) = held {
                    if command.flag & LOCK_FLAG_UPDATE_WHEN_LOCKED != 0 {
                        shard.update_locked(
                            held,
                            now,
                            command.timeout,
                            command.expried,
                            command.count,
                            command.rcount,
                        );
                        let current = shard.lock(held);
                        command.expried = (current.expried_time - current.start_time) as u16;
                        if let Some(orphan) = self.release_reservation(shard, &handle) {
                            deferred.push(orphan);
                        }
                        response = Some((ResultCode::Succeed, locked_now, command));
                    } else if shard.lock(held).locked <= command.rcount {
                        if command.expried == 0 {
                            let current = shard.lock(held);
                            command.expried = (current.expried_time - current.start_time) as u16;
                            command.timeout = current.command.timeout;
                            command.count = current.command.count;
                            command.rcount = current.command.rcount;
                            let depth = current.locked as u16;
                            if let Some(orphan) = self.release_reservation(shard, &handle) {
                                deferred.push(orphan);
                            }
                            response = Some((ResultCode::LockedError, depth, command));
                        } else {
                            // reentrant grant
                            shard.lock_mut(held).locked += 1;
                            shard.update_locked(
                                held,
                                now,
                                command.timeout,
                                command.expried,
                                command.count,
                                command.rcount,
                            );
                            let state = shard.state_of(&handle).expect("reserved manager");
                            state.locked += 1;
                            let lcount = state.locked;
                            let expried_time = shard.lock(held).expried_time;
                            if let Some(orphan) = self.release_reservation(shard, &handle) {
                                deferred.push(orphan);
                            }
                            self.counters.lock_count.fetch_add(1, Ordering::Relaxed);
                            self.counters.locked_count.fetch_add(1, Ordering::Relaxed);
                            self.persist_grant(&command, expried_time);
                            response = Some((ResultCode::Succeed, lcount, command));
                        }
                    } else {
                        if let Some(orphan) = self.release_reservation(shard, &handle) {
                            deferred.push(orphan);
                        }
                        response = Some((ResultCode::LockedError, locked_now, command));
                    }
                }
            }

            if response.is_none() {
                // the reservation becomes the record's manager reference
                let slot = shard.alloc_lock(Lock::new(command, sink.clone(), handle.clone(), now));
                if self.can_grant(shard, &handle, slot) {
                    if command.expried > 0 {
                        shard.add_lock(handle.slot, slot);
                        shard.lock_mut(slot).locked = 1;
                        let state = shard.state_of(&handle).expect("reserved manager");
                        state.locked += 1;
                        let lcount = state.locked;
                        shard.lock_mut(slot).ref_count += 1;
                        self.enroll_expried(shard, slot);
                        let expried_time = shard.lock(slot).expried_time;
                        self.counters.lock_count.fetch_add(1, Ordering::Relaxed);
                        self.counters.locked_count.fetch_add(1, Ordering::Relaxed);
                        self.persist_grant(&command, expried_time);
                        response = Some((ResultCode::Succeed, lcount, command));
                    } else {
                        // grantable but nothing to hold: answer and forget
                        let lcount = shard.state_ref(&handle).map_or(0, |s| s.locked);
                        if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                            deferred.push(orphan);
                        }
                        self.counters.lock_count.fetch_add(1, Ordering::Relaxed);
                        response = Some((ResultCode::Succeed, lcount, command));
                    }
                } else if command.timeout > 0 {
                    shard.add_wait_lock(handle.slot, slot);
                    shard.lock_mut(slot).ref_count += 1;
                    self.enroll_timeout(shard, slot);
                    self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    let lcount = shard.state_ref(&handle).map_or(0, |s| s.locked);
                    if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                        deferred.push(orphan);
                    }
                    response = Some((ResultCode::Timeout, lcount, command));
                }
            }
        }

        for orphan in deferred {
            self.free_foreign_state(&orphan);
        }
        if let Some((code, lcount, command)) = response {
            sink.deliver(LockResult::of(&command, code, lcount), true);
        }
    }

    /// The UNLOCK entry point.
    pub fn unlock(&self, sink: Arc<dyn ResultSink>, mut command: LockCommand) {
        let Some(handle) = self.get_manager(&command) else {
            self.counters.unlock_error_count.fetch_add(1, Ordering::Relaxed);
            sink.deliver(LockResult::of(&command, ResultCode::UnlockError, 0), true);
            return;
        };

        let mut deferred = Vec::new();
        let mut response = None;
        let mut cascade = None;
        {
            let mut guard = self.shards[handle.shard_index as usize].lock();
            let shard = &mut *guard;

            let state_ok = shard
                .state_ref(&handle)
                .map(|s| s.lock_key == command.lock_key)
                .unwrap_or(false);
            let locked_now = if state_ok {
                shard.state_ref(&handle).map_or(0, |s| s.locked)
            } else {
                0
            };
            if !state_ok || locked_now == 0 {
                response = Some((ResultCode::UnlockError, locked_now, command));
            } else {
                let mut held = shard
                    .state_ref(&handle)
                    .and_then(|s| shard.get_locked(s, &command.lock_id));
                if held.is_none() && command.flag & UNLOCK_FLAG_UNLOCK_CURRENT != 0 {
                    held = shard.state_ref(&handle).and_then(|s| s.current_lock);
                    if let Some(slot) = held {
                        command.lock_id = shard.lock(slot).command.lock_id;
                    }
                }
                match held {
                    None => {
                        response = Some((ResultCode::UnownError, locked_now, command));
                    }
                    Some(slot) => {
                        let wait = self.get_wait_lock(shard, &handle, &mut deferred);
                        let depth = shard.lock(slot).locked;
                        if depth > 1 && command.rcount != 0 {
                            // release one reentry level
                            shard.lock_mut(slot).locked -= 1;
                            let state = shard.state_of(&handle).expect("validated above");
                            state.locked -= 1;
                            let lcount = state.locked;
                            self.counters.unlock_count.fetch_add(1, Ordering::Relaxed);
                            self.counters.locked_count.fetch_sub(1, Ordering::Relaxed);
                            response = Some((ResultCode::Succeed, lcount, command));
                        } else {
                            // full release, all reentry levels at once
                            shard.lock_mut(slot).expried = true;
                            shard.remove_lock(handle.slot, slot);
                            let state = shard.state_of(&handle).expect("validated above");
                            state.locked -= depth as u16;
                            let lcount = state.locked;
                            if let Some(orphan) = self.drop_lock_ref(shard, slot) {
                                deferred.push(orphan);
                            }
                            self.counters
                                .unlock_count
                                .fetch_add(depth as u64, Ordering::Relaxed);
                            self.counters
                                .locked_count
                                .fetch_sub(depth as u32, Ordering::Relaxed);
                            response = Some((ResultCode::Succeed, lcount, command));
                        }
                        if let Some(wait) = wait {
                            cascade = Some((handle.clone(), wait));
                        }
                    }
                }
            }
        }

        for orphan in deferred {
            self.free_foreign_state(&orphan);
        }
        if let Some((code, lcount, command)) = response {
            if code == ResultCode::Succeed {
                self.persist_release(&command);
            } else {
                self.counters.unlock_error_count.fetch_add(1, Ordering::Relaxed);
            }
            sink.deliver(LockResult::of(&command, code, lcount), true);
        }
        if let Some((handle, wait)) = cascade {
            self.wake_cascade(&handle, wait, Some(&sink));
        }
    }

    /// Grants as many head-of-queue waiters as the grant rule allows after
    /// a release or expiry. The shard mutex is re-taken between steps and
    /// never held across a delivery.
    fn wake_cascade(
        &self,
        handle: &Arc<ManagerHandle>,
        first: LockSlot,
        initiator: Option<&Arc<dyn ResultSink>>,
    ) {
        let mut next = Some(first);
        while let Some(wait) = next {
            let mut deferred = Vec::new();
            let mut response = None;
            {
                let mut guard = self.shards[handle.shard_index as usize].lock();
                let shard = &mut *guard;
                if !self.can_grant(shard, handle, wait) {
                    // waited stays set: the queue still owns the grant order
                    break;
                }
                if shard.lock(wait).timeouted {
                    // timed out or granted by a racing cascade step
                    next = self.get_wait_lock(shard, handle, &mut deferred);
                } else {
                    shard.lock_mut(wait).timeouted = true;
                    let (command, sink) = {
                        let lock = shard.lock(wait);
                        (lock.command, lock.sink.clone())
                    };
                    if command.expried > 0 {
                        shard.add_lock(handle.slot, wait);
                        shard.lock_mut(wait).locked = 1;
                        shard.lock_mut(wait).ref_count += 1; // holder membership
                        let state = shard.state_of(handle).expect("waiter pins the manager");
                        state.locked += 1;
                        let lcount = state.locked;
                        shard.lock_mut(wait).ref_count += 1; // expiry wheel
                        self.enroll_expried(shard, wait);
                        let expried_time = shard.lock(wait).expried_time;
                        // prune the granted head and move to the next waiter
                        next = self.get_wait_lock(shard, handle, &mut deferred);
                        self.counters.lock_count.fetch_add(1, Ordering::Relaxed);
                        self.counters.locked_count.fetch_add(1, Ordering::Relaxed);
                        self.counters.wait_count.fetch_sub(1, Ordering::Relaxed);
                        self.persist_grant(&command, expried_time);
                        response = Some((command, sink, lcount));
                    } else {
                        let lcount = shard.state_ref(handle).map_or(0, |s| s.locked);
                        next = self.get_wait_lock(shard, handle, &mut deferred);
                        self.counters.lock_count.fetch_add(1, Ordering::Relaxed);
                        self.counters.wait_count.fetch_sub(1, Ordering::Relaxed);
                        response = Some((command, sink, lcount));
                    }
                }
            }
            for orphan in deferred {
                self.free_foreign_state(&orphan);
            }
            if let Some((command, sink, lcount)) = response {
                let reused = initiator.is_some_and(|i| Arc::ptr_eq(i, &sink));
                sink.deliver(LockResult::of(&command, ResultCode::Succeed, lcount), reused);
            }
        }
    }

    // -- persistence hook -------------------------------------------------

    fn persist_grant(&self, command: &LockCommand, expried_time: i64) {
        if command.is_aof {
            return;
        }
        if let Some(aof) = &self.aof {
            aof.push(AofEvent::grant(self.db_id, command, expried_time));
        }
    }

    fn persist_release(&self, command: &LockCommand) {
        if command.is_aof {
            return;
        }
        if let Some(aof) = &self.aof {
            aof.push(AofEvent::release(self.db_id, command));
        }
    }

    // -- fast-index resize ------------------------------------------------

    fn run_resize_watcher(self: Arc<Self>) {
        while !self.is_stopped() {
            let before = self.counters.lock_count.load(Ordering::Relaxed);
            thread::sleep(Duration::from_secs(1));
            let grown = self
                .counters
                .lock_count
                .load(Ordering::Relaxed)
                .wrapping_sub(before);
            let capacity = self.index.lock().capacity();
            if grown.saturating_mul(self.config.fast_resize_rate) > capacity {
                self.resize_index();
            }
        }
    }

    /// Doubles the fast index online. Lookups keep working throughout: the
    /// old capacity stays probeable until the last entry is re-homed.
    pub(crate) fn resize_index(&self) {
        let (seg_length, old_capacity, segment_count) = {
            let index = self.index.lock();
            if index.resizing() {
                return;
            }
            (index.seg_length(), index.capacity(), index.segment_count())
        };
        // allocate the new segments outside the mutex
        let new_segments: Vec<_> = (0..segment_count).map(|_| new_segment(seg_length)).collect();
        {
            let mut index = self.index.lock();
            if index.resizing() || index.capacity() != old_capacity {
                return;
            }
            index.begin_resize(new_segments);
        }

        let mut start = 0;
        while start < old_capacity {
            self.index.lock().rehome_batch(start, RESIZE_BATCH);
            start += RESIZE_BATCH;
        }

        let orphans = {
            let mut index = self.index.lock();
            let orphans = index.rebuild_overflow();
            index.finish_resize();
            orphans
        };
        let orphan_count = orphans.len();
        for orphan in orphans {
            self.counters.key_count.fetch_sub(1, Ordering::Relaxed);
            self.free_foreign_state(&orphan);
        }
        info!(
            db_id = self.db_id,
            capacity = old_capacity << 1,
            reclaimed = orphan_count,
            "fast lock index resized",
        );
    }
}

// -- server-wide state ----------------------------------------------------

/// Single-node server roles. Only `Leader` carries behavior; the follower
/// and sync roles exist for the wire but have no replication logic behind
/// them.
#[repr(u8)]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init = 0,
    Leader = 1,
    Follower = 2,
    Sync = 3,
}

/// The service: up to 256 lock databases, created lazily per db id, plus
/// the persistence collaborator they share.
pub struct Warden {
    dbs: Mutex<Vec<Option<Arc<LockDb>>>>,
    config: crate::config::ServerConfig,
    aof: Option<Arc<Aof>>,
    started_at: std::time::Instant,
    state: AtomicU8,
}

impl Warden {
    pub fn new(config: crate::config::ServerConfig) -> Arc<Self> {
        Self::with_aof(config, None)
    }

    pub fn with_aof(config: crate::config::ServerConfig, aof: Option<Arc<Aof>>) -> Arc<Self> {
        Arc::new(Self {
            dbs: Mutex::new(vec![None; 256]),
            config,
            aof,
            started_at: std::time::Instant::now(),
            state: AtomicU8::new(ServerState::Init as u8),
        })
    }

    pub fn config(&self) -> &crate::config::ServerConfig {
        &self.config
    }

    pub fn db(&self, db_id: u8) -> Option<Arc<LockDb>> {
        self.dbs.lock()[db_id as usize].clone()
    }

    pub fn get_or_new_db(&self, db_id: u8) -> Arc<LockDb> {
        let mut dbs = self.dbs.lock();
        if let Some(db) = &dbs[db_id as usize] {
            return db.clone();
        }
        let db = LockDb::new(db_id, self.config.db.clone(), self.aof.clone());
        dbs[db_id as usize] = Some(db.clone());
        info!(db_id, "created lock database");
        db
    }

    /// Existing databases, for the admin channel.
    pub fn live_dbs(&self) -> Vec<Arc<LockDb>> {
        self.dbs.lock().iter().flatten().cloned().collect()
    }

    pub fn flush_db(&self, db_id: u8) -> bool {
        match self.db(db_id) {
            Some(db) => {
                db.flush();
                true
            }
            None => false,
        }
    }

    /// Feeds replayed commands through a discarding sink, marking the
    /// server leader afterwards.
    pub fn replay(&self, commands: Vec<LockCommand>) {
        let count = commands.len();
        let sink: Arc<dyn ResultSink> = Arc::new(crate::aof::DiscardSink);
        for command in commands {
            self.get_or_new_db(command.db_id).lock(sink.clone(), command);
        }
        if count > 0 {
            info!(count, "replayed append-only-file grants");
        }
        self.update_state(ServerState::Leader);
    }

    pub fn update_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> ServerState {
        match self.state.load(Ordering::Relaxed) {
            1 => ServerState::Leader,
            2 => ServerState::Follower,
            3 => ServerState::Sync,
            _ => ServerState::Init,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Stops every database's background threads and the AOF writer.
    pub fn close(&self) {
        for db in self.live_dbs() {
            db.stop();
        }
        if let Some(aof) = &self.aof {
            aof.close();
        }
    }
}
