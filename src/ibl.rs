//! Indirect-branch lookup: the lossy open-addressed table the in-cache
//! probe sequence consults to resolve a dynamic target without leaving
//! the cache. The probe may report a false miss (costing one dispatch
//! round-trip) but never a false hit: a hit requires the tag word to read
//! the same before and after the target word, and entries are removed
//! from the table before their target bytes are invalidated (the unit
//! reclaim grace covers in-flight probes).

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use std::sync::atomic::{AtomicUsize, Ordering};

const EMPTY: usize = 0;
const MAX_PROBE: usize = 8;

struct IblSlot {
    tag: AtomicUsize,
    target: AtomicUsize,
}

pub struct IblTable {
    slots: Box<[IblSlot]>,
    mask: usize,
}

impl IblTable {
    pub fn with_bits(bits: u32) -> IblTable {
        let cap = 1usize << bits;
        let slots = (0..cap)
            .map(|_| IblSlot {
                tag: AtomicUsize::new(EMPTY),
                target: AtomicUsize::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        IblTable {
            slots,
            mask: cap - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn start_index(&self, tag: AppPc) -> usize {
        // Fibonacci multiply; the table is power-of-two sized.
        tag.as_usize().wrapping_mul(0x9e3779b97f4a7c15) >> 13 & self.mask
    }

    /// The probe: exactly the semantics of the emitted in-cache lookup
    /// sequence. Hit returns the cached entry point; miss (including
    /// chain exhaustion) means "exit to dispatch".
    pub fn probe(&self, tag: AppPc) -> Option<CachePc> {
        let raw = tag.as_usize();
        let mut i = self.start_index(tag);
        for _ in 0..MAX_PROBE {
            let seen = self.slots[i].tag.load(Ordering::Acquire);
            if seen == EMPTY {
                return None;
            }
            if seen == raw {
                let target = self.slots[i].target.load(Ordering::Acquire);
                // Re-check: a concurrent removal between the two tag reads
                // downgrades to a miss, never a wrong target.
                if self.slots[i].tag.load(Ordering::Acquire) == raw {
                    return Some(CachePc::new(target));
                }
                return None;
            }
            i = (i + 1) & self.mask;
        }
        None
    }

    /// Insert or update. When the probe chain is saturated the last slot
    /// is overwritten: the table is lossy by contract, the displaced
    /// entry just costs its next execution a dispatch round-trip.
    pub fn insert(&self, tag: AppPc, target: CachePc) {
        let raw = tag.as_usize();
        debug_assert!(raw != EMPTY);
        let mut i = self.start_index(tag);
        let mut victim = i;
        for _ in 0..MAX_PROBE {
            let seen = self.slots[i].tag.load(Ordering::Acquire);
            if seen == EMPTY || seen == raw {
                victim = i;
                break;
            }
            victim = i;
            i = (i + 1) & self.mask;
        }
        let slot = &self.slots[victim];
        // Order matters: invalidate, write target, publish tag. A reader
        // overlapping any step sees a miss or the complete new entry.
        slot.tag.store(EMPTY, Ordering::Release);
        slot.target.store(target.as_usize(), Ordering::Release);
        slot.tag.store(raw, Ordering::Release);
    }

    /// Remove the entry for `tag`, if present.
    pub fn remove(&self, tag: AppPc) {
        let raw = tag.as_usize();
        let mut i = self.start_index(tag);
        for _ in 0..MAX_PROBE {
            let seen = self.slots[i].tag.load(Ordering::Acquire);
            if seen == EMPTY {
                return;
            }
            if seen == raw {
                self.slots[i].tag.store(EMPTY, Ordering::Release);
                return;
            }
            i = (i + 1) & self.mask;
        }
    }

    /// Drop every entry (flush-all, thread teardown).
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.tag.store(EMPTY, Ordering::Release);
        }
    }

    pub fn live_entries(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.tag.load(Ordering::Relaxed) != EMPTY)
            .count()
    }
}
