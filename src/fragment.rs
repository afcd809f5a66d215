//! Fragments: the unit of cached code. Fragments live in a slab and are
//! named by dense ids everywhere else in the engine — incoming links carry
//! ids, not pointers, so eviction invalidates an id and turns later
//! lookups into misses instead of dangling references.

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use crate::translate::TranslationTable;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

bitflags! {
    pub struct FragmentFlags: u32 {
        /// Shared across threads (process-shared partition).
        const SHARED         = 0b0000_0001;
        /// A stitched trace rather than a single basic block.
        const IS_TRACE       = 0b0000_0010;
        /// A basic block promoted to trace head.
        const TRACE_HEAD     = 0b0000_0100;
        /// Materialized from a frozen per-module cache.
        const FROZEN         = 0b0000_1000;
        /// Mid-flush: no new entries or links may be created.
        const BEING_FLUSHED  = 0b0001_0000;
        /// Synthetic fragment that re-raises a decode fault.
        const FAULT_STUB     = 0b0010_0000;
        /// Block ends in a system call; never a trace constituent.
        const ENDS_IN_SYSCALL = 0b0100_0000;
        /// Every execution must route through dispatch (wrapped or
        /// replaced tag): never linked to, never in a lookup table.
        const NO_LINK        = 0b1000_0000;
    }
}

/// Which cache partition a fragment's bytes live in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Partition {
    PrivateBb,
    SharedBb,
    Trace,
    Persisted,
}

/// Cache-unit identity within a partition's unit list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UnitId(pub u32);

/// Packed fragment identity: slab index plus a serial that changes on
/// every reuse of the slot. A stale id never resolves.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FragmentId(u64);

impl FragmentId {
    pub fn pack(index: u32, serial: u32) -> FragmentId {
        FragmentId(((serial as u64) << 32) | index as u64)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn serial(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> FragmentId {
        FragmentId(raw)
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "F{}.{}", self.index(), self.serial())
    }
}

impl fmt::Debug for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Why an exit leaves its fragment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitKind {
    /// Unconditional direct branch (or the taken side of a conditional).
    DirectBranch,
    /// The fall-through side of a conditional branch.
    Fallthrough,
    /// Indirect branch or call through the lookup routine.
    IndirectBranch,
    /// Mangled return; resolved through the lookup routine.
    Return,
    /// System-call gate.
    Syscall,
    /// Synthetic fault re-raise.
    Fault,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ExitState {
    /// Exit routes through its stub back to dispatch.
    ToStub,
    /// Exit branches straight to the entry of the target fragment.
    Linked(FragmentId),
}

/// One outgoing exit of a fragment.
#[derive(Clone, Debug)]
pub struct Exit {
    pub kind: ExitKind,
    /// Static target tag for direct exits; None for indirect ones.
    pub target: Option<AppPc>,
    /// Offset of the exit stub within the fragment body.
    pub stub_offset: u32,
    /// Offset of the patchable branch-target word for this exit.
    pub patch_offset: u32,
    pub state: ExitState,
}

/// Back-reference to a fragment+exit that links to us. Non-owning:
/// resolved through the slab, so a stale source id is simply skipped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IncomingLink {
    pub source: FragmentId,
    pub exit_index: u32,
}

/// The mutable linkage state of a fragment, guarded by the per-fragment
/// link lock (short critical sections only).
#[derive(Debug, Default)]
pub struct LinkState {
    pub exits: Vec<Exit>,
    pub incoming: Vec<IncomingLink>,
}

pub struct Fragment {
    pub id: FragmentId,
    pub tag: AppPc,
    pub partition: Partition,
    pub unit: UnitId,
    /// Entry point of the body in cache memory.
    pub entry: CachePc,
    /// Body length in bytes.
    pub body_len: u32,
    /// Length in application bytes of the block this fragment covers.
    pub app_len: u32,
    pub translation: TranslationTable,
    flags: AtomicU32,
    links: Mutex<LinkState>,
    hit_count: AtomicU32,
}

impl Fragment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: AppPc,
        partition: Partition,
        unit: UnitId,
        entry: CachePc,
        body_len: u32,
        app_len: u32,
        translation: TranslationTable,
        flags: FragmentFlags,
        exits: Vec<Exit>,
    ) -> Fragment {
        Fragment {
            id: FragmentId::pack(0, 0),
            tag,
            partition,
            unit,
            entry,
            body_len,
            app_len,
            translation,
            flags: AtomicU32::new(flags.bits()),
            links: Mutex::new(LinkState {
                exits,
                incoming: Vec::new(),
            }),
            hit_count: AtomicU32::new(0),
        }
    }

    pub fn flags(&self) -> FragmentFlags {
        FragmentFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: FragmentFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: FragmentFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn test_flag(&self, flag: FragmentFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn is_shared(&self) -> bool {
        self.test_flag(FragmentFlags::SHARED)
    }

    /// Cache span [entry, entry + body_len).
    pub fn contains_cache_pc(&self, pc: CachePc) -> bool {
        pc >= self.entry && pc.offset_from(self.entry) < self.body_len as usize
    }

    /// Application span [tag, tag + app_len).
    pub fn covers_app_pc(&self, pc: AppPc) -> bool {
        pc >= self.tag && pc.offset_from(self.tag) < self.app_len as usize
    }

    pub fn bump_hit_count(&self) -> u32 {
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn reset_hit_count(&self) {
        self.hit_count.store(0, Ordering::Relaxed);
    }

    /// Run `f` under the per-fragment link lock.
    pub fn with_links<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let mut guard = self.links.lock().unwrap();
        f(&mut guard)
    }

    pub fn exit_count(&self) -> usize {
        self.links.lock().unwrap().exits.len()
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Fragment {{ id: {}, tag: {}, entry: {}, len: {}, flags: {:?} }}",
            self.id,
            self.tag,
            self.entry,
            self.body_len,
            self.flags()
        )
    }
}

struct Slot {
    serial: u32,
    frag: Option<Arc<Fragment>>,
}

/// The process-wide fragment slab. Insertion assigns the id; `get` hands
/// out a pinned (`Arc`) reference so a fragment being flushed stays
/// readable until every reader drops it, even though its id stops
/// resolving immediately.
pub struct FragmentSlab {
    slots: RwLock<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
}

impl FragmentSlab {
    pub fn new() -> FragmentSlab {
        FragmentSlab {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, mut fragment: Fragment) -> (FragmentId, Arc<Fragment>) {
        let mut slots = self.slots.write().unwrap();
        let index = match self.free.lock().unwrap().pop() {
            Some(i) => i,
            None => {
                slots.push(Slot {
                    serial: 1,
                    frag: None,
                });
                (slots.len() - 1) as u32
            }
        };
        let slot = &mut slots[index as usize];
        debug_assert!(slot.frag.is_none());
        let id = FragmentId::pack(index, slot.serial);
        fragment.id = id;
        let arc = Arc::new(fragment);
        slot.frag = Some(Arc::clone(&arc));
        (id, arc)
    }

    pub fn get(&self, id: FragmentId) -> Option<Arc<Fragment>> {
        let slots = self.slots.read().unwrap();
        let slot = slots.get(id.index() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        slot.frag.clone()
    }

    /// Remove the fragment, invalidating the id. The record itself lives
    /// until the last pin drops.
    pub fn remove(&self, id: FragmentId) -> Option<Arc<Fragment>> {
        let mut slots = self.slots.write().unwrap();
        let slot = slots.get_mut(id.index() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        let frag = slot.frag.take();
        if frag.is_some() {
            slot.serial = slot.serial.wrapping_add(1);
            self.free.lock().unwrap().push(id.index());
        }
        frag
    }

    /// First live fragment matching `pred` (cache-PC classification,
    /// audits). Linear over the slab; callers are cold paths.
    pub fn find(&self, mut pred: impl FnMut(&Arc<Fragment>) -> bool) -> Option<Arc<Fragment>> {
        let slots = self.slots.read().unwrap();
        slots
            .iter()
            .filter_map(|s| s.frag.as_ref())
            .find(|f| pred(*f))
            .cloned()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.frag.is_some())
            .count()
    }
}

impl Default for FragmentSlab {
    fn default() -> FragmentSlab {
        FragmentSlab::new()
    }
}
