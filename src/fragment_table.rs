//! Fragment tables: open-addressed maps from application tag to fragment
//! id. Two flavors: the per-thread private table (owner-only, no
//! synchronization) and the process-shared table (single writer, many
//! lock-free readers under a sequence-number discipline).
//!
//! Shared-table contract: writers — insert, remove, resize — are fully
//! serialized by the writer lock, so a resize can never drop a
//! concurrently inserted entry. A reader that overlaps any writer
//! observes a sequence mismatch and retries its whole probe; storage
//! replaced by a resize stays alive for as long as any in-flight reader
//! still holds it.

use crate::app_pc::AppPc;
use crate::fragment::FragmentId;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

/// Load threshold: resize when (live + tombstones) exceeds 70% capacity.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

const INITIAL_CAPACITY: usize = 64;

fn hash_tag(tag: AppPc, seed: usize, mask: usize) -> usize {
    // Multiply-shift; the odd seed is drawn per table.
    tag.as_usize().wrapping_mul(seed) >> 16 & mask
}

fn fresh_seed() -> usize {
    rand::thread_rng().gen::<usize>() | 1
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertError {
    AlreadyPresent(FragmentId),
}

/// Per-thread table. Tags here are guaranteed unique per (tag, thread)
/// by construction: dispatch only inserts after a lookup miss.
pub struct PrivateFragmentTable {
    tags: Vec<usize>,
    ids: Vec<u64>,
    seed: usize,
    mask: usize,
    live: usize,
    tombstones: usize,
}

impl PrivateFragmentTable {
    pub fn new() -> PrivateFragmentTable {
        PrivateFragmentTable {
            tags: vec![EMPTY; INITIAL_CAPACITY],
            ids: vec![0; INITIAL_CAPACITY],
            seed: fresh_seed(),
            mask: INITIAL_CAPACITY - 1,
            live: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn lookup(&self, tag: AppPc) -> Option<FragmentId> {
        let raw = tag.as_usize();
        debug_assert!(raw != EMPTY && raw != TOMBSTONE);
        let mut i = hash_tag(tag, self.seed, self.mask);
        loop {
            match self.tags[i] {
                EMPTY => return None,
                t if t == raw => return Some(FragmentId::from_u64(self.ids[i])),
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    pub fn insert(&mut self, tag: AppPc, id: FragmentId) -> Result<(), InsertError> {
        if (self.live + self.tombstones + 1) * LOAD_DEN >= self.tags.len() * LOAD_NUM {
            self.grow();
        }
        let raw = tag.as_usize();
        let mut i = hash_tag(tag, self.seed, self.mask);
        let mut first_tomb = None;
        loop {
            match self.tags[i] {
                EMPTY => {
                    let slot = first_tomb.unwrap_or(i);
                    if self.tags[slot] == TOMBSTONE {
                        self.tombstones -= 1;
                    }
                    self.tags[slot] = raw;
                    self.ids[slot] = id.as_u64();
                    self.live += 1;
                    return Ok(());
                }
                TOMBSTONE => {
                    if first_tomb.is_none() {
                        first_tomb = Some(i);
                    }
                    i = (i + 1) & self.mask;
                }
                t if t == raw => {
                    return Err(InsertError::AlreadyPresent(FragmentId::from_u64(
                        self.ids[i],
                    )))
                }
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    pub fn remove(&mut self, tag: AppPc) -> Option<FragmentId> {
        let raw = tag.as_usize();
        let mut i = hash_tag(tag, self.seed, self.mask);
        loop {
            match self.tags[i] {
                EMPTY => return None,
                t if t == raw => {
                    self.tags[i] = TOMBSTONE;
                    self.live -= 1;
                    self.tombstones += 1;
                    return Some(FragmentId::from_u64(self.ids[i]));
                }
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    /// Drain every entry (thread teardown, full flush).
    pub fn drain(&mut self) -> Vec<(AppPc, FragmentId)> {
        let mut out = Vec::with_capacity(self.live);
        for i in 0..self.tags.len() {
            let t = self.tags[i];
            if t != EMPTY && t != TOMBSTONE {
                out.push((AppPc::new(t), FragmentId::from_u64(self.ids[i])));
            }
            self.tags[i] = EMPTY;
        }
        self.live = 0;
        self.tombstones = 0;
        out
    }

    fn grow(&mut self) {
        let new_cap = self.tags.len() * 2;
        let old_tags = std::mem::replace(&mut self.tags, vec![EMPTY; new_cap]);
        let old_ids = std::mem::replace(&mut self.ids, vec![0; new_cap]);
        self.mask = new_cap - 1;
        self.live = 0;
        self.tombstones = 0;
        for (t, id) in old_tags.into_iter().zip(old_ids) {
            if t != EMPTY && t != TOMBSTONE {
                // Unique by invariant; insertion cannot fail.
                let _ = self.insert(AppPc::new(t), FragmentId::from_u64(id));
            }
        }
    }
}

impl Default for PrivateFragmentTable {
    fn default() -> PrivateFragmentTable {
        PrivateFragmentTable::new()
    }
}

struct SharedSlot {
    tag: AtomicUsize,
    id: AtomicU64,
}

struct SharedStorage {
    slots: Box<[SharedSlot]>,
    mask: usize,
}

impl SharedStorage {
    fn with_capacity(cap: usize) -> SharedStorage {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap)
            .map(|_| SharedSlot {
                tag: AtomicUsize::new(EMPTY),
                id: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SharedStorage {
            slots,
            mask: cap - 1,
        }
    }
}

struct WriterState {
    live: usize,
    tombstones: usize,
}

/// The process-shared table.
pub struct SharedFragmentTable {
    seq: AtomicU64,
    seed: usize,
    writer: Mutex<WriterState>,
    storage: RwLock<SharedStorage>,
}

impl SharedFragmentTable {
    pub fn new() -> SharedFragmentTable {
        SharedFragmentTable {
            seq: AtomicU64::new(0),
            seed: fresh_seed(),
            writer: Mutex::new(WriterState {
                live: 0,
                tombstones: 0,
            }),
            storage: RwLock::new(SharedStorage::with_capacity(INITIAL_CAPACITY)),
        }
    }

    pub fn len(&self) -> usize {
        self.writer.lock().unwrap().live
    }

    /// Lock-free probe. Samples the sequence number around the probe and
    /// retries on mismatch, so an overlapped writer can never be
    /// half-observed.
    pub fn lookup(&self, tag: AppPc) -> Option<FragmentId> {
        let raw = tag.as_usize();
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 1 {
                std::thread::yield_now();
                continue;
            }
            let result = {
                let storage = self.storage.read().unwrap();
                let mut i = hash_tag(tag, self.seed, storage.mask);
                loop {
                    match storage.slots[i].tag.load(Ordering::Acquire) {
                        EMPTY => break None,
                        t if t == raw => {
                            break Some(FragmentId::from_u64(
                                storage.slots[i].id.load(Ordering::Acquire),
                            ))
                        }
                        _ => i = (i + 1) & storage.mask,
                    }
                }
            };
            if self.seq.load(Ordering::Acquire) == s1 {
                return result;
            }
        }
    }

    pub fn insert(&self, tag: AppPc, id: FragmentId) -> Result<(), InsertError> {
        let mut state = self.writer.lock().unwrap();
        {
            let cap = self.storage.read().unwrap().slots.len();
            if (state.live + state.tombstones + 1) * LOAD_DEN >= cap * LOAD_NUM {
                self.resize_locked(&mut state, cap * 2);
            }
        }
        self.begin_write();
        let result = {
            let storage = self.storage.read().unwrap();
            let raw = tag.as_usize();
            let mut i = hash_tag(tag, self.seed, storage.mask);
            let mut first_tomb = None;
            loop {
                match storage.slots[i].tag.load(Ordering::Acquire) {
                    EMPTY => {
                        let slot = first_tomb.unwrap_or(i);
                        if storage.slots[slot].tag.load(Ordering::Relaxed) == TOMBSTONE {
                            state.tombstones -= 1;
                        }
                        storage.slots[slot].id.store(id.as_u64(), Ordering::Release);
                        storage.slots[slot].tag.store(raw, Ordering::Release);
                        state.live += 1;
                        break Ok(());
                    }
                    TOMBSTONE => {
                        if first_tomb.is_none() {
                            first_tomb = Some(i);
                        }
                        i = (i + 1) & storage.mask;
                    }
                    t if t == raw => {
                        break Err(InsertError::AlreadyPresent(FragmentId::from_u64(
                            storage.slots[i].id.load(Ordering::Acquire),
                        )))
                    }
                    _ => i = (i + 1) & storage.mask,
                }
            }
        };
        self.end_write();
        result
    }

    pub fn remove(&self, tag: AppPc) -> Option<FragmentId> {
        let mut state = self.writer.lock().unwrap();
        self.begin_write();
        let result = {
            let storage = self.storage.read().unwrap();
            let raw = tag.as_usize();
            let mut i = hash_tag(tag, self.seed, storage.mask);
            loop {
                match storage.slots[i].tag.load(Ordering::Acquire) {
                    EMPTY => break None,
                    t if t == raw => {
                        let id = storage.slots[i].id.load(Ordering::Acquire);
                        storage.slots[i].tag.store(TOMBSTONE, Ordering::Release);
                        state.live -= 1;
                        state.tombstones += 1;
                        break Some(FragmentId::from_u64(id));
                    }
                    _ => i = (i + 1) & storage.mask,
                }
            }
        };
        self.end_write();
        result
    }

    /// Snapshot of all live entries (flush-all, stats). Taken under the
    /// writer lock so it is consistent.
    pub fn entries(&self) -> Vec<(AppPc, FragmentId)> {
        let _state = self.writer.lock().unwrap();
        let storage = self.storage.read().unwrap();
        let mut out = Vec::new();
        for slot in storage.slots.iter() {
            let t = slot.tag.load(Ordering::Acquire);
            if t != EMPTY && t != TOMBSTONE {
                out.push((
                    AppPc::new(t),
                    FragmentId::from_u64(slot.id.load(Ordering::Acquire)),
                ));
            }
        }
        out
    }

    fn begin_write(&self) {
        let s = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert!(s & 1 == 0, "nested shared-table write");
    }

    fn end_write(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Rehash into a doubled table. Caller holds the writer lock; taking
    /// the storage write lock waits out in-flight readers, which is the
    /// grace period that keeps them off freed storage.
    fn resize_locked(&self, state: &mut WriterState, new_cap: usize) {
        self.begin_write();
        let new_storage = SharedStorage::with_capacity(new_cap);
        {
            let old = self.storage.read().unwrap();
            for slot in old.slots.iter() {
                let t = slot.tag.load(Ordering::Acquire);
                if t == EMPTY || t == TOMBSTONE {
                    continue;
                }
                let id = slot.id.load(Ordering::Acquire);
                let mut i = hash_tag(AppPc::new(t), self.seed, new_storage.mask);
                while new_storage.slots[i].tag.load(Ordering::Relaxed) != EMPTY {
                    i = (i + 1) & new_storage.mask;
                }
                new_storage.slots[i].id.store(id, Ordering::Relaxed);
                new_storage.slots[i].tag.store(t, Ordering::Relaxed);
            }
        }
        *self.storage.write().unwrap() = new_storage;
        state.tombstones = 0;
        self.end_write();
    }
}

impl Default for SharedFragmentTable {
    fn default() -> SharedFragmentTable {
        SharedFragmentTable::new()
    }
}
