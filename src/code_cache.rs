//! The code cache: growable lists of executable units per partition, bump
//! placement of fragment bodies, and FIFO-with-watermark selection of
//! units for reclaim. The cache owns placement and byte accounting;
//! unlinking, table removal, and the synch grace that make a reclaim safe
//! are orchestrated above it.

use crate::cache_pc::CachePc;
use crate::fragment::{FragmentId, Partition, UnitId};
use crate::heap::ExecHeap;
use crate::log::LogLevel::LogDebug;
use crate::os::MemRegion;
use serde::Serialize;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CacheError {
    /// Partition is at budget and eviction freed nothing.
    OutOfMemory,
    /// A single request larger than a unit can never be placed.
    RequestTooLarge(usize),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CacheError::OutOfMemory => write!(f, "code cache out of memory"),
            CacheError::RequestTooLarge(n) => {
                write!(f, "request of {} bytes exceeds unit size", n)
            }
        }
    }
}

/// Where a fragment body was placed.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Placement {
    pub unit: UnitId,
    pub pc: CachePc,
}

struct Unit {
    id: UnitId,
    region: MemRegion,
    cursor: usize,
    live_bytes: usize,
    fragments: Vec<(FragmentId, u32)>,
}

impl Unit {
    fn remaining(&self) -> usize {
        self.region.len - self.cursor
    }
}

/// Point-in-time accounting for one partition, serializable for the
/// stats command.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub units: usize,
    pub fragments: usize,
    pub live_bytes: usize,
    pub committed_bytes: usize,
    pub budget: usize,
}

/// One partition's cache. Private-BB instances are owned by a single
/// thread; shared-BB and trace instances live behind the engine's
/// unit-list lock.
pub struct CodeCache {
    partition: Partition,
    unit_size: usize,
    budget: usize,
    high_watermark_pct: u32,
    units: Vec<Unit>,
    next_unit: u32,
}

impl CodeCache {
    pub fn new(
        partition: Partition,
        unit_size: usize,
        budget: usize,
        high_watermark_pct: u32,
    ) -> CodeCache {
        CodeCache {
            partition,
            unit_size,
            budget,
            high_watermark_pct,
            units: Vec::new(),
            next_unit: 0,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Place `len` bytes, growing by one unit if the current one is
    /// exhausted and the budget allows. Does NOT evict: the caller
    /// orchestrates eviction (unlink + table removal + synch grace) and
    /// retries.
    pub fn allocate(&mut self, heap: &ExecHeap, len: usize) -> Result<Placement, CacheError> {
        let len = (len + 15) & !15;
        if len > self.unit_size {
            return Err(CacheError::RequestTooLarge(len));
        }
        if self.units.last().map(|u| u.remaining() < len).unwrap_or(true) {
            self.grow(heap)?;
        }
        let unit = self.units.last_mut().expect("grow added a unit");
        let pc = CachePc::new(unit.region.base + unit.cursor);
        unit.cursor += len;
        Ok(Placement { unit: unit.id, pc })
    }

    fn grow(&mut self, heap: &ExecHeap) -> Result<(), CacheError> {
        let committed: usize = self.units.iter().map(|u| u.region.len).sum();
        if committed + self.unit_size > self.budget {
            return Err(CacheError::OutOfMemory);
        }
        let region = heap
            .alloc_unit(self.unit_size)
            .map_err(|_| CacheError::OutOfMemory)?;
        let id = UnitId(self.next_unit);
        self.next_unit += 1;
        log!(
            LogDebug,
            "{:?} cache unit {:?} at {:#x}",
            self.partition,
            id,
            region.base
        );
        self.units.push(Unit {
            id,
            region,
            cursor: 0,
            live_bytes: 0,
            fragments: Vec::new(),
        });
        Ok(())
    }

    /// Copy an emitted body into its placement. The destination is inside
    /// engine-owned RWX memory that no thread executes until the fragment
    /// is published, so a plain copy is safe here.
    pub fn install(&mut self, placement: Placement, bytes: &[u8]) {
        debug_assert!(self
            .unit_mut(placement.unit)
            .map(|u| u.region.contains(placement.pc.as_usize()))
            .unwrap_or(false));
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                placement.pc.as_usize() as *mut u8,
                bytes.len(),
            );
        }
    }

    /// Record a committed fragment against its unit.
    pub fn note_fragment(&mut self, unit: UnitId, id: FragmentId, body_len: u32) {
        if let Some(u) = self.unit_mut(unit) {
            u.fragments.push((id, body_len));
            u.live_bytes += body_len as usize;
        }
    }

    /// Forget a fragment (flush or eviction bookkeeping).
    pub fn forget_fragment(&mut self, unit: UnitId, id: FragmentId) {
        if let Some(u) = self.unit_mut(unit) {
            if let Some(pos) = u.fragments.iter().position(|(f, _)| *f == id) {
                let (_, len) = u.fragments.swap_remove(pos);
                u.live_bytes -= len as usize;
            }
        }
    }

    fn unit_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.id == id)
    }

    pub fn live_bytes(&self) -> usize {
        self.units.iter().map(|u| u.live_bytes).sum()
    }

    /// True once live bytes exceed the high watermark of the budget.
    pub fn above_watermark(&self) -> bool {
        self.live_bytes() * 100 > self.budget * self.high_watermark_pct as usize
    }

    /// The FIFO victim: the oldest unit. Returns its id and the resident
    /// fragments the caller must unlink and unregister before the unit
    /// can be released.
    pub fn eviction_victim(&self) -> Option<(UnitId, Vec<FragmentId>)> {
        self.units
            .first()
            .map(|u| (u.id, u.fragments.iter().map(|(f, _)| *f).collect()))
    }

    /// Release a (now fragment-free) unit's pages. Caller has completed
    /// the synch grace: no thread holds a cache PC inside the unit.
    pub fn release_unit(&mut self, heap: &ExecHeap, id: UnitId) {
        if let Some(pos) = self.units.iter().position(|u| u.id == id) {
            let unit = self.units.remove(pos);
            debug_assert!(unit.fragments.is_empty());
            let _ = heap.free_unit(unit.region);
            log!(LogDebug, "{:?} cache released unit {:?}", self.partition, id);
        }
    }

    /// Does any unit of this partition contain `pc`?
    pub fn contains_pc(&self, pc: CachePc) -> bool {
        self.units.iter().any(|u| u.region.contains(pc.as_usize()))
    }

    /// The unit containing `pc`, if any.
    pub fn unit_of_pc(&self, pc: CachePc) -> Option<UnitId> {
        self.units
            .iter()
            .find(|u| u.region.contains(pc.as_usize()))
            .map(|u| u.id)
    }

    /// Fragments resident in `unit`.
    pub fn fragments_in_unit(&self, unit: UnitId) -> Vec<FragmentId> {
        self.units
            .iter()
            .find(|u| u.id == unit)
            .map(|u| u.fragments.iter().map(|(f, _)| *f).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            units: self.units.len(),
            fragments: self.units.iter().map(|u| u.fragments.len()).sum(),
            live_bytes: self.live_bytes(),
            committed_bytes: self.units.iter().map(|u| u.region.len).sum(),
            budget: self.budget,
        }
    }
}
