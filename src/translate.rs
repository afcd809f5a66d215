//! Per-fragment translation: the inverse map from a cache PC (and the live
//! register state at that point) back to the application PC and the
//! application register values. Built by the fragment builder alongside
//! emission; consumed by the async interposer and by synchall when it
//! teleports a suspended thread out of the cache.

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use crate::mcontext::{Mcontext, RegId};
use std::fmt;

/// Where one architectural register's application value lives at a given
/// cache point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RegLoc {
    /// The register itself still holds the application value.
    InReg,
    /// Spilled to the thread's numbered spill slot.
    Spill(u8),
    /// A known constant (e.g. the synthesized return address of a
    /// mangled call before it is pushed).
    Const(usize),
}

#[derive(Copy, Clone, Debug)]
pub struct RegRule {
    pub reg: RegId,
    pub loc: RegLoc,
}

/// One interval of the table: from `cache_offset` (to the next entry's
/// offset) the application PC is `tag + app_offset` and the registers are
/// recovered by `rules`. Entries inside a mangling sequence that cannot be
/// resumed mid-way are marked non-restartable; translation snaps them to
/// the nearest restartable boundary.
#[derive(Clone, Debug)]
pub struct TranslationEntry {
    pub cache_offset: u32,
    pub app_offset: u32,
    pub restartable: bool,
    pub rules: Vec<RegRule>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TranslateError {
    /// The cache PC does not fall inside this fragment's body.
    OutsideFragment,
    /// No restartable boundary exists in either direction; the fragment
    /// was emitted wrong and the engine is in a bug state.
    NoRestartableBoundary,
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TranslateError::OutsideFragment => write!(f, "cache pc outside fragment"),
            TranslateError::NoRestartableBoundary => {
                write!(f, "cache pc in unrestartable mangling region")
            }
        }
    }
}

/// Sorted interval table, one per fragment.
#[derive(Clone, Debug, Default)]
pub struct TranslationTable {
    entries: Vec<TranslationEntry>,
}

impl TranslationTable {
    pub fn new() -> TranslationTable {
        TranslationTable {
            entries: Vec::new(),
        }
    }

    /// Append an entry. Entries must arrive in increasing cache-offset
    /// order; emission is strictly forward so the builder satisfies this
    /// naturally.
    pub fn push(&mut self, entry: TranslationEntry) {
        if let Some(last) = self.entries.last() {
            debug_assert!(entry.cache_offset >= last.cache_offset);
        }
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Index of the interval containing `cache_offset`.
    fn interval_index(&self, cache_offset: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        match self
            .entries
            .binary_search_by(|e| e.cache_offset.cmp(&cache_offset))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Translate `cache_pc` inside a fragment whose body starts at
    /// `cache_entry` with tag `tag`. On success the application PC is
    /// returned and `mc` is rewritten in place to application register
    /// state, reading spilled values out of `spill_slots`.
    pub fn translate(
        &self,
        tag: AppPc,
        cache_entry: CachePc,
        body_len: u32,
        cache_pc: CachePc,
        mc: &mut Mcontext,
        spill_slots: &[usize],
    ) -> Result<AppPc, TranslateError> {
        if cache_pc < cache_entry || cache_pc.offset_from(cache_entry) >= body_len as usize {
            return Err(TranslateError::OutsideFragment);
        }
        let off = cache_pc.offset_from(cache_entry) as u32;
        let idx = self
            .interval_index(off)
            .ok_or(TranslateError::OutsideFragment)?;

        // Snap to a restartable boundary: rewind first (the start of a
        // mangling sequence re-executes it, which every sequence is
        // emitted to tolerate), advance only if nothing earlier exists.
        let chosen = if self.entries[idx].restartable {
            idx
        } else {
            match (0..idx).rev().find(|&i| self.entries[i].restartable) {
                Some(i) => i,
                None => (idx + 1..self.entries.len())
                    .find(|&i| self.entries[i].restartable)
                    .ok_or(TranslateError::NoRestartableBoundary)?,
            }
        };
        let entry = &self.entries[chosen];
        for rule in &entry.rules {
            match rule.loc {
                RegLoc::InReg => {}
                RegLoc::Spill(slot) => {
                    let value = spill_slots.get(slot as usize).copied().unwrap_or(0);
                    mc.set_gpr(rule.reg, value);
                }
                RegLoc::Const(value) => mc.set_gpr(rule.reg, value),
            }
        }
        // Offsets are signed displacements: trace constituents can sit
        // below their head tag.
        let app_pc = AppPc::new(
            tag.as_usize()
                .wrapping_add(entry.app_offset as i32 as isize as usize),
        );
        mc.set_pc(app_pc.as_usize());
        Ok(app_pc)
    }
}
