//! The native execution backend: thin Rust shims over the platform
//! assembly stubs that perform the actual application<->engine context
//! switches. The stubs themselves are provided by the platform build
//! (outside this crate); this module only carries their signatures and
//! the takeover path the injector entry uses.

use crate::cache_pc::CachePc;
use crate::dispatch::{CacheEntry, CacheExit};
use crate::engine::{Engine, EngineConfig, InjectorBlock};
use crate::fragment::FragmentId;
use crate::log::LogLevel::LogWarn;
use crate::mcontext::SpillArea;
use crate::os::linux::LinuxOs;
use crate::thread::ThreadContext;
use std::sync::Arc;

extern "C" {
    /// Restore application state from the spill area, jump to `entry`,
    /// run until a cache exit spills back. Returns the exit descriptor
    /// packed by the exit stub.
    fn drio_cache_enter(spill: *mut SpillArea, entry: usize) -> u64;
}

const EXIT_KIND_STUB: u32 = 0;
const EXIT_KIND_IBL_MISS: u32 = 1;
const EXIT_KIND_SYSCALL: u32 = 2;
const EXIT_KIND_FAULT: u32 = 3;

pub struct NativeBackend;

impl CacheEntry for NativeBackend {
    fn enter(&self, _engine: &Engine, tcx: &mut ThreadContext, entry: CachePc) -> CacheExit {
        let mut spill = SpillArea {
            mcontext: tcx.mcontext,
            ..Default::default()
        };
        unsafe {
            drio_cache_enter(&mut spill, entry.as_usize());
        }
        tcx.mcontext = spill.mcontext;
        match spill.exit_kind {
            EXIT_KIND_STUB => CacheExit::Stub {
                source: FragmentId::from_u64(spill.exit_source),
                exit_index: spill.exit_index,
            },
            EXIT_KIND_IBL_MISS => CacheExit::IndirectMiss {
                target: crate::app_pc::AppPc::new(spill.next_tag),
            },
            EXIT_KIND_SYSCALL => CacheExit::Syscall {
                source: FragmentId::from_u64(spill.exit_source),
                exit_index: spill.exit_index,
            },
            _ => CacheExit::Fault {
                record: crate::os::ExceptionRecord {
                    fault: crate::isa::FaultKind::InvalidOpcode,
                    pc: spill.next_tag,
                    tid: tcx.tid,
                    signum: libc::SIGILL,
                },
            },
        }
    }
}

use crate::isa::{InstrDecoder, InstrEncoder};
use std::sync::Mutex;

lazy_static! {
    static ref PLATFORM_ISA: Mutex<Option<(Box<dyn InstrDecoder>, Box<dyn InstrEncoder>)>> =
        Mutex::new(None);
}

/// The platform layer registers its decoder/encoder pair before handing
/// control to the injector entry.
pub fn register_platform_isa(decoder: Box<dyn InstrDecoder>, encoder: Box<dyn InstrEncoder>) {
    *PLATFORM_ISA.lock().unwrap() = Some((decoder, encoder));
}

/// Injector takeover: stand the engine up on the Linux facade and
/// dispatch from the saved context.
pub fn take_over(block: &mut InjectorBlock) -> i32 {
    let os = match LinuxOs::new() {
        Ok(os) => Arc::new(os),
        Err(e) => {
            log!(LogWarn, "takeover failed: {}", e);
            return -1;
        }
    };
    let (decoder, encoder) = match PLATFORM_ISA.lock().unwrap().take() {
        Some(pair) => pair,
        None => {
            log!(LogWarn, "takeover without a registered platform ISA");
            return -1;
        }
    };
    let engine = Engine::new(EngineConfig {
        os,
        decoder,
        encoder,
        backend: Box::new(NativeBackend),
        private_bbs: false,
    });
    let mut tcx = match engine.attach_thread() {
        Ok(t) => t,
        Err(e) => {
            log!(LogWarn, "takeover thread attach failed: {}", e);
            return -1;
        }
    };
    tcx.mcontext = block.mcontext;
    crate::dispatch::dispatch_loop(&engine, &mut tcx);
    0
}
