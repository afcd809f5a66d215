use crate::log::LogLevel::LogWarn;
use std::fmt;

/// Number of general-purpose registers the engine tracks. The decoder maps
/// whatever the target architecture calls its registers into this dense
/// space; the engine itself never names machine registers.
pub const NUM_GPRS: usize = 16;

/// Dense register index into an [`Mcontext`] register file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RegId(pub u8);

impl RegId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Return-value register.
pub const REG_RET: RegId = RegId(0);
/// Stack pointer.
pub const REG_SP: RegId = RegId(4);
/// First argument register; arguments 0..=5 are in consecutive registers,
/// the rest on the stack.
pub const REG_ARG0: RegId = RegId(6);
pub const NUM_REG_ARGS: usize = 6;

/// Register for the dynamic target of a mangled indirect branch. The
/// mangler spills and reuses this register, so its application value is
/// always recoverable through the translation recipe.
pub const REG_IBL_TARGET: RegId = RegId(12);

pub fn arg_reg(i: usize) -> Option<RegId> {
    if i < NUM_REG_ARGS {
        Some(RegId(REG_ARG0.0 + i as u8))
    } else {
        None
    }
}

/// A machine-context snapshot: the full application register state saved
/// at every cache boundary and restored on cache entry. `repr(C)` because
/// the native entry stubs address fields by fixed offset.
#[repr(C)]
#[derive(Copy, Clone, PartialEq)]
pub struct Mcontext {
    gprs: [usize; NUM_GPRS],
    pc: usize,
    flags: usize,
}

impl Default for Mcontext {
    fn default() -> Mcontext {
        Mcontext {
            gprs: [0; NUM_GPRS],
            pc: 0,
            flags: 0,
        }
    }
}

impl Mcontext {
    pub fn gpr(&self, reg: RegId) -> usize {
        self.gprs[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: RegId, value: usize) {
        self.gprs[reg.index()] = value;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn sp(&self) -> usize {
        self.gprs[REG_SP.index()]
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.gprs[REG_SP.index()] = sp;
    }

    pub fn flags(&self) -> usize {
        self.flags
    }

    pub fn set_flags(&mut self, value: usize) {
        self.flags = value;
    }

    pub fn retval(&self) -> usize {
        self.gprs[REG_RET.index()]
    }

    pub fn set_retval(&mut self, value: usize) {
        self.gprs[REG_RET.index()] = value;
    }
}

impl fmt::Debug for Mcontext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Mcontext {{ pc: {:#x}, sp: {:#x}", self.pc, self.sp())?;
        for (i, v) in self.gprs.iter().enumerate() {
            if *v != 0 && i != REG_SP.index() {
                write!(f, ", r{}: {:#x}", i, v)?;
            }
        }
        write!(f, " }}")
    }
}

pub enum MismatchBehavior {
    LogMismatches,
    BailOnMismatch,
}

/// Compare two contexts register by register. Returns true when they
/// match; on mismatch either logs each differing register or bails after
/// the first, per `behavior`.
pub fn compare_contexts(
    label_a: &str,
    a: &Mcontext,
    label_b: &str,
    b: &Mcontext,
    behavior: MismatchBehavior,
) -> bool {
    let mut matched = true;
    for i in 0..NUM_GPRS {
        if a.gprs[i] != b.gprs[i] {
            matched = false;
            log!(
                LogWarn,
                "r{} mismatch: {}:{:#x} vs {}:{:#x}",
                i,
                label_a,
                a.gprs[i],
                label_b,
                b.gprs[i]
            );
            if let MismatchBehavior::BailOnMismatch = behavior {
                return false;
            }
        }
    }
    if a.pc != b.pc {
        matched = false;
        log!(
            LogWarn,
            "pc mismatch: {}:{:#x} vs {}:{:#x}",
            label_a,
            a.pc,
            label_b,
            b.pc
        );
    }
    matched
}

/// The per-thread spill area the cache-exit stubs write into: the saved
/// application context plus the exit descriptor dispatch consumes. The
/// native stubs address these fields by offset, so the layout is part of
/// the backend contract.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SpillArea {
    pub mcontext: Mcontext,
    /// Application PC to continue at, as computed by the exiting stub.
    pub next_tag: usize,
    /// Packed fragment id of the exiting fragment, or 0.
    pub exit_source: u64,
    /// Exit index within the source fragment.
    pub exit_index: u32,
    /// Discriminant of the exit reason, interpreted by dispatch.
    pub exit_kind: u32,
}

#[allow(dead_code)]
mod layout {
    use super::*;
    use memoffset::offset_of;
    use static_assertions::const_assert;

    const_assert!(std::mem::size_of::<Mcontext>() == (NUM_GPRS + 2) * std::mem::size_of::<usize>());

    /// Offsets consumed by the native entry/exit stubs.
    pub fn spill_offsets() -> (usize, usize, usize) {
        (
            offset_of!(SpillArea, mcontext),
            offset_of!(SpillArea, next_tag),
            offset_of!(SpillArea, exit_kind),
        )
    }
}
