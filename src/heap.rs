//! Engine heap: bump arenas over facade-reserved regions. Three flavors:
//! a single-owner arena for per-thread state, an atomically-bumped shared
//! arena, and the executable heap that hands whole units to the code
//! cache. Engine data never lives in application-reachable allocations.

use crate::os::{MemRegion, Os, OsError, Prot, PAGE_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Bump arena owned by a single thread; no internal synchronization.
pub struct ThreadArena {
    os: Arc<dyn Os>,
    region: MemRegion,
    cursor: usize,
}

impl ThreadArena {
    pub fn new(os: Arc<dyn Os>, size: usize) -> Result<ThreadArena, OsError> {
        let region = os.reserve(size, None)?;
        os.commit(region, Prot::rw())?;
        Ok(ThreadArena {
            os,
            region,
            cursor: 0,
        })
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        let start = align_up(self.region.base + self.cursor, align) - self.region.base;
        if start + size > self.region.len {
            return None;
        }
        self.cursor = start + size;
        Some(self.region.base + start)
    }

    pub fn used(&self) -> usize {
        self.cursor
    }
}

impl Drop for ThreadArena {
    fn drop(&mut self) {
        let _ = self.os.free(self.region);
    }
}

/// Bump arena shared across threads; allocation is a CAS loop, never a
/// lock.
pub struct SharedArena {
    os: Arc<dyn Os>,
    region: MemRegion,
    cursor: AtomicUsize,
}

impl SharedArena {
    pub fn new(os: Arc<dyn Os>, size: usize) -> Result<SharedArena, OsError> {
        let region = os.reserve(size, None)?;
        os.commit(region, Prot::rw())?;
        Ok(SharedArena {
            os,
            region,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn alloc(&self, size: usize, align: usize) -> Option<usize> {
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = align_up(self.region.base + cur, align) - self.region.base;
            if start + size > self.region.len {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cur,
                start + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.region.base + start),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        let _ = self.os.free(self.region);
    }
}

/// The executable heap: reserves and commits whole writable+executable
/// units for the code cache, and returns them to the OS on reclaim.
pub struct ExecHeap {
    os: Arc<dyn Os>,
}

impl ExecHeap {
    pub fn new(os: Arc<dyn Os>) -> ExecHeap {
        ExecHeap { os }
    }

    pub fn alloc_unit(&self, size: usize) -> Result<MemRegion, OsError> {
        let region = self.os.reserve(size, None)?;
        self.os.commit(region, Prot::rwx())?;
        Ok(region)
    }

    pub fn free_unit(&self, region: MemRegion) -> Result<(), OsError> {
        self.os.free(region)
    }
}

/// The per-thread engine scratch stack ("dstack"). Engine code between
/// cache exit and cache entry runs on this stack, never the application's.
/// The lowest page is left uncommitted as a guard.
pub struct Dstack {
    os: Arc<dyn Os>,
    region: MemRegion,
}

impl Dstack {
    pub fn new(os: Arc<dyn Os>, size: usize) -> Result<Dstack, OsError> {
        debug_assert!(size > 2 * PAGE_SIZE);
        let region = os.reserve(size, None)?;
        let usable = MemRegion {
            base: region.base + PAGE_SIZE,
            len: region.len - PAGE_SIZE,
        };
        os.commit(usable, Prot::rw())?;
        Ok(Dstack { os, region })
    }

    /// Initial stack pointer: the high end, aligned down.
    pub fn top(&self) -> usize {
        self.region.end() & !0xf
    }

    pub fn guard_base(&self) -> usize {
        self.region.base
    }

    pub fn contains(&self, sp: usize) -> bool {
        self.region.contains(sp)
    }
}

impl Drop for Dstack {
    fn drop(&mut self) {
        let _ = self.os.free(self.region);
    }
}
