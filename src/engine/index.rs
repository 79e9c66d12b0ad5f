//! # Fast Key Index
//!
//! A two-level open-addressed table mapping lock keys to their managers,
//! with an ordinary hash map as the collision sink.
//!
//! The low bits of a key's index word pick the slot inside a segment; the
//! bits above them pick the segment. A key whose slot is empty is stored
//! directly. When a second key lands on an occupied slot the occupant is
//! marked conflicted and mirrored into the overflow map, the newcomer goes
//! into the overflow map only, and the occupant's reference count grows by
//! one per collider shadowed behind it. The slot owner therefore outlives
//! its own last lock until the last collider leaves, and the `conflicted`
//! bit records which teardown path applies. Each overflow entry remembers
//! the owner it is shadowed behind, so teardown and resize release the
//! reference on the right manager.
//!
//! ## Online doubling
//!
//! A background watcher doubles the capacity when grant traffic outgrows
//! it. While a doubling is in flight, `resizing_capacity` keeps the old
//! capacity visible: lookups probe the new base first and fall back to the
//! old one, because a concurrent insert may still have landed on an
//! old-base slot. The resizer holds the index mutex per batch of slots,
//! never for the whole pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::base::LockKey;

use super::shard::ManagerHandle;

pub(crate) struct FastSlot {
    pub(crate) handle: Arc<ManagerHandle>,
    pub(crate) lock_key: LockKey,
    /// True when this slot's occupant shadows colliders reachable through
    /// the overflow map.
    pub(crate) conflicted: bool,
}

struct OverflowEntry {
    handle: Arc<ManagerHandle>,
    /// The conflicted slot owner this entry is shadowed behind, carrying
    /// one reference on it. `None` for the owner's own mirror entry.
    shadow: Option<(LockKey, Arc<ManagerHandle>)>,
}

pub(crate) type Segment = Box<[Option<FastSlot>]>;

pub(crate) struct KeyIndex {
    segments: Vec<Segment>,
    /// Total slot count; always a power-of-two multiple of the segment
    /// length.
    capacity: u64,
    /// Non-zero while a doubling is in flight: the second capacity lookups
    /// must probe.
    resizing_capacity: u64,
    overflow: HashMap<LockKey, OverflowEntry>,
    seg_shift: u32,
}

pub(crate) fn new_segment(len: u64) -> Segment {
    let mut segment = Vec::with_capacity(len as usize);
    segment.resize_with(len as usize, || None);
    segment.into_boxed_slice()
}

impl KeyIndex {
    pub(crate) fn new(seg_shift: u32) -> Self {
        let seg_length = 1u64 << seg_shift;
        Self {
            segments: vec![new_segment(seg_length)],
            capacity: seg_length,
            resizing_capacity: 0,
            overflow: HashMap::with_capacity(64),
            seg_shift,
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn seg_length(&self) -> u64 {
        1u64 << self.seg_shift
    }

    pub(crate) fn resizing(&self) -> bool {
        self.resizing_capacity != 0
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    fn position(&self, word: u64, capacity: u64) -> (usize, usize) {
        let global = word & (capacity - 1);
        (
            (global >> self.seg_shift) as usize,
            (global & (self.seg_length() - 1)) as usize,
        )
    }

    fn slot(&self, word: u64, capacity: u64) -> &Option<FastSlot> {
        let (seg, pos) = self.position(word, capacity);
        &self.segments[seg][pos]
    }

    fn slot_mut(&mut self, word: u64, capacity: u64) -> &mut Option<FastSlot> {
        let (seg, pos) = self.position(word, capacity);
        &mut self.segments[seg][pos]
    }

    /// Finds the manager for `key`, if any. A direct hit requires a key
    /// match; conflicted slots and mismatches fall through. During a resize
    /// the old base is probed on any new-base miss: the slot may be empty,
    /// but it may also hold a fresh key inserted at the new address while
    /// this key still sits on its old slot waiting to be re-homed.
    pub(crate) fn probe(&self, key: &LockKey) -> Option<Arc<ManagerHandle>> {
        let word = key.index_word();
        if let Some(slot) = self.slot(word, self.capacity) {
            if !slot.conflicted && slot.lock_key == *key {
                return Some(slot.handle.clone());
            }
        }
        if self.resizing_capacity != 0 {
            if let Some(slot) = self.slot(word, self.resizing_capacity) {
                if !slot.conflicted && slot.lock_key == *key {
                    return Some(slot.handle.clone());
                }
            }
        }
        self.overflow.get(key).map(|entry| entry.handle.clone())
    }

    /// Wires a freshly allocated manager under `key`. The caller has probed
    /// under the same mutex hold: the key is not present.
    pub(crate) fn insert(&mut self, key: LockKey, handle: Arc<ManagerHandle>) {
        let (seg, pos) = self.position(key.index_word(), self.capacity);
        match &mut self.segments[seg][pos] {
            entry @ None => {
                *entry = Some(FastSlot {
                    handle,
                    lock_key: key,
                    conflicted: false,
                });
            }
            Some(slot) => {
                debug_assert!(slot.lock_key != key, "insert of a present key");
                let owner = (slot.lock_key, slot.handle.clone());
                if !slot.conflicted {
                    slot.conflicted = true;
                    self.overflow.insert(
                        slot.lock_key,
                        OverflowEntry {
                            handle: slot.handle.clone(),
                            shadow: None,
                        },
                    );
                }
                // one reference per collider shadowed behind the slot owner
                slot.handle.ref_count.fetch_add(1, Ordering::AcqRel);
                self.overflow.insert(
                    key,
                    OverflowEntry {
                        handle,
                        shadow: Some(owner),
                    },
                );
            }
        }
    }

    /// Clears whichever slot `handle` occupies, probing the new base and,
    /// mid-resize, the old one.
    fn clear_slot_of(&mut self, word: u64, handle: &Arc<ManagerHandle>) {
        let capacity = self.capacity;
        let entry = self.slot_mut(word, capacity);
        if let Some(slot) = entry {
            if Arc::ptr_eq(&slot.handle, handle) {
                *entry = None;
                return;
            }
        }
        let resizing = self.resizing_capacity;
        if resizing != 0 {
            let entry = self.slot_mut(word, resizing);
            if let Some(slot) = entry {
                if Arc::ptr_eq(&slot.handle, handle) {
                    *entry = None;
                }
            }
        }
    }

    /// Unwires `handle`, keyed by `key`, after its reference count reached
    /// zero. Returns a slot owner that this removal orphaned: one that only
    /// lived through its colliders and now has no references left. The
    /// caller reclaims the orphan's state.
    pub(crate) fn remove(
        &mut self,
        key: &LockKey,
        handle: &Arc<ManagerHandle>,
    ) -> Option<Arc<ManagerHandle>> {
        let word = key.index_word();
        if let Some(entry) = self.overflow.remove(key) {
            debug_assert!(Arc::ptr_eq(&entry.handle, handle), "overflow entry mismatch");
            match entry.shadow {
                None => {
                    // the mirrored owner itself is leaving; its colliders
                    // are gone, or it would still hold their references
                    self.clear_slot_of(word, handle);
                }
                Some((owner_key, owner)) => {
                    if owner.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // last collider gone and the owner holds no locks
                        owner.freed.store(true, Ordering::Release);
                        self.overflow.remove(&owner_key);
                        self.clear_slot_of(owner_key.index_word(), &owner);
                        return Some(owner);
                    }
                }
            }
            return None;
        }

        self.clear_slot_of(word, handle);
        None
    }

    /// Phase one of a doubling: append the pre-allocated segments, publish
    /// the fallback capacity and the doubled capacity.
    pub(crate) fn begin_resize(&mut self, new_segments: Vec<Segment>) {
        debug_assert_eq!(self.resizing_capacity, 0, "doubling already in flight");
        self.resizing_capacity = self.capacity;
        for segment in new_segments {
            self.segments.push(segment);
        }
        self.capacity <<= 1;
    }

    /// Phase two, one batch: re-home the direct entries in global positions
    /// `start..start+len` of the old base whose segment changes under the
    /// doubled capacity. Conflicted slots are the overflow pass's business.
    /// Old-base positions are never a move target, so batches are
    /// insensitive to ordering.
    pub(crate) fn rehome_batch(&mut self, start: u64, len: u64) {
        let old_capacity = self.resizing_capacity;
        for global in start..(start + len).min(old_capacity) {
            let seg = (global >> self.seg_shift) as usize;
            let pos = (global & (self.seg_length() - 1)) as usize;
            let needs_move = match &self.segments[seg][pos] {
                Some(slot) if !slot.conflicted => {
                    self.position(slot.lock_key.index_word(), self.capacity) != (seg, pos)
                }
                _ => false,
            };
            if needs_move {
                let moved = self.segments[seg][pos].take().expect("checked above");
                let (new_seg, new_pos) = self.position(moved.lock_key.index_word(), self.capacity);
                match &mut self.segments[new_seg][new_pos] {
                    entry @ None => *entry = Some(moved),
                    Some(slot) => {
                        // a mid-resize insert reached this home first; the
                        // mover spills behind it like any other collider
                        let owner = (slot.lock_key, slot.handle.clone());
                        if !slot.conflicted {
                            slot.conflicted = true;
                            self.overflow.insert(
                                slot.lock_key,
                                OverflowEntry {
                                    handle: slot.handle.clone(),
                                    shadow: None,
                                },
                            );
                        }
                        slot.handle.ref_count.fetch_add(1, Ordering::AcqRel);
                        self.overflow.insert(
                            moved.lock_key,
                            OverflowEntry {
                                handle: moved.handle,
                                shadow: Some(owner),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Phase three: rebuild the collision sink against the doubled
    /// capacity. Each entry tries its new direct slot and is re-spilled if
    /// it still collides. Owners that lived only through colliders which
    /// now fit elsewhere come back orphaned, `freed` already set, for the
    /// caller to reclaim.
    pub(crate) fn rebuild_overflow(&mut self) -> Vec<Arc<ManagerHandle>> {
        let entries: Vec<(LockKey, OverflowEntry)> = self.overflow.drain().collect();

        // detach the mirrored owners from their slots and release the
        // reference each collider held on its shadow owner; everything in
        // the map gets re-placed from scratch
        for (key, entry) in &entries {
            if entry.shadow.is_none() {
                self.clear_slot_of(key.index_word(), &entry.handle);
            }
        }
        for (_, entry) in &entries {
            if let Some((_, owner)) = &entry.shadow {
                owner.ref_count.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let mut orphans = Vec::new();
        for (key, entry) in entries {
            let handle = entry.handle;
            if handle.ref_count.load(Ordering::Acquire) == 0 {
                // nothing keeps this manager alive any more
                handle.freed.store(true, Ordering::Release);
                orphans.push(handle);
                continue;
            }
            let (seg, pos) = self.position(key.index_word(), self.capacity);
            match &mut self.segments[seg][pos] {
                entry @ None => {
                    *entry = Some(FastSlot {
                        handle,
                        lock_key: key,
                        conflicted: false,
                    });
                }
                Some(slot) => {
                    let owner = (slot.lock_key, slot.handle.clone());
                    if !slot.conflicted {
                        slot.conflicted = true;
                        self.overflow.insert(
                            slot.lock_key,
                            OverflowEntry {
                                handle: slot.handle.clone(),
                                shadow: None,
                            },
                        );
                    }
                    slot.handle.ref_count.fetch_add(1, Ordering::AcqRel);
                    self.overflow.insert(
                        key,
                        OverflowEntry {
                            handle,
                            shadow: Some(owner),
                        },
                    );
                }
            }
        }
        orphans
    }

    /// Phase four: the doubling is complete, retire the fallback base.
    pub(crate) fn finish_resize(&mut self) {
        self.resizing_capacity = 0;
    }

    /// Drops every entry. Used by FLUSHDB; the capacity is kept.
    pub(crate) fn clear(&mut self) {
        for segment in &mut self.segments {
            for slot in segment.iter_mut() {
                *slot = None;
            }
        }
        self.overflow.clear();
    }

    #[cfg(test)]
    pub(crate) fn overflow_len(&self) -> usize {
        self.overflow.len()
    }
}
