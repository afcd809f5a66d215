//! The async-event interposer: the engine's top-level handler for every
//! signal/exception it owns. Classifies the faulting PC (application,
//! cache, engine), translates cache contexts back to application state,
//! and either delivers immediately (synchronous faults) or queues on the
//! target thread for delivery at its next dispatch (asynchronous
//! signals).

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use crate::engine::Engine;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::mcontext::{Mcontext, REG_ARG0};
use crate::os::ExceptionRecord;
use crate::thread::ThreadContext;
use std::cell::Cell;

/// A queued asynchronous signal: the normalized record plus the
/// already-translated application context at interruption.
#[derive(Clone, Debug)]
pub struct PendingSignal {
    pub record: ExceptionRecord,
    pub mc: Mcontext,
}

/// Fault-like signals are delivered synchronously; everything else is
/// deferred to the thread's next dispatch.
pub fn is_synchronous(signum: i32) -> bool {
    matches!(
        signum,
        libc::SIGSEGV | libc::SIGILL | libc::SIGBUS | libc::SIGFPE | libc::SIGTRAP
    )
}

// Per-thread try-frame state for guarded engine probes: an expected
// fault inside a guard region is consumed and flagged instead of being
// treated as an engine bug.
thread_local! {
    static GUARD_DEPTH: Cell<u32> = Cell::new(0);
    static GUARD_TRIPPED: Cell<bool> = Cell::new(false);
}

pub struct GuardRegion;

impl GuardRegion {
    pub fn enter() -> GuardRegion {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        GuardRegion
    }

    /// True when a fault tripped inside this region.
    pub fn tripped(&self) -> bool {
        GUARD_TRIPPED.with(|t| t.get())
    }
}

impl Drop for GuardRegion {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        GUARD_TRIPPED.with(|t| t.set(false));
    }
}

fn in_guard() -> bool {
    GUARD_DEPTH.with(|d| d.get()) > 0
}

fn trip_guard() {
    GUARD_TRIPPED.with(|t| t.set(true));
}

/// The engine's exception-sink body. Returns true when the event was
/// consumed (the context may have been rewritten for resumption); false
/// propagates the event to the application's native disposition.
pub fn interpose(engine: &Engine, record: &ExceptionRecord, mc: &mut Mcontext) -> bool {
    // (c) Expected fault from a guarded engine probe.
    if in_guard() {
        trip_guard();
        log!(LogDebug, "guarded engine fault at {:#x}", record.pc);
        return true;
    }

    // (b) Inside a cache fragment: translate to application state.
    let cache_pc = CachePc::new(record.pc);
    if let Some(frag) = engine.fragment_at_cache_pc(cache_pc) {
        let spills = engine
            .thread_shared(record.tid)
            .map(|t| t.read_spill_slots())
            .unwrap_or([0; crate::thread::NUM_SPILL_SLOTS]);
        let app_pc = match frag.translation.translate(
            frag.tag,
            frag.entry,
            frag.body_len,
            cache_pc,
            mc,
            &spills,
        ) {
            Ok(pc) => pc,
            Err(e) => {
                fatal!("untranslatable cache pc {} in {}: {}", cache_pc, frag.id, e);
            }
        };
        let translated = ExceptionRecord {
            pc: app_pc.as_usize(),
            ..*record
        };
        if is_synchronous(record.signum) {
            deliver_now(engine, &translated, mc);
        } else if let Some(shared) = engine.thread_shared(record.tid) {
            shared.queue_signal(PendingSignal {
                record: translated,
                mc: *mc,
            });
        }
        return true;
    }

    // (a) Application code not yet cached (or engine code, whose faults
    // the dispatcher reports through its own fatal paths): propagate
    // with the original context.
    false
}

/// Deliver a (translated) synchronous fault right now: redirect to the
/// application's handler if one is registered, otherwise hand the event
/// back to the OS for native disposition.
fn deliver_now(engine: &Engine, record: &ExceptionRecord, mc: &mut Mcontext) {
    match engine.app_handler(record.signum) {
        Some(handler) => redirect_to_handler(engine, handler, record, mc),
        None => {
            log!(
                LogDebug,
                "raising signal {} to app at {:#x}",
                record.signum,
                record.pc
            );
            if let Err(e) = engine.os.raise_exception_to_app(record, mc) {
                log!(LogWarn, "raise_exception_to_app failed: {}", e);
            }
        }
    }
}

/// Build the application-visible handler activation: the interrupted PC
/// is pushed as the handler's return address and the signal number
/// becomes its first argument.
fn redirect_to_handler(
    engine: &Engine,
    handler: AppPc,
    record: &ExceptionRecord,
    mc: &mut Mcontext,
) {
    let sp = mc.sp() - 8;
    let interrupted = mc.pc();
    if engine
        .os
        .write_app(AppPc::new(sp), &interrupted.to_le_bytes())
        .is_err()
    {
        log!(LogWarn, "cannot push signal frame at {:#x}", sp);
        return;
    }
    mc.set_sp(sp);
    mc.set_gpr(REG_ARG0, record.signum as usize);
    mc.set_pc(handler.as_usize());
    log!(
        LogDebug,
        "redirected signal {} to handler {}",
        record.signum,
        handler
    );
}

/// Drain this thread's deferred signals at a dispatch safe point.
pub fn drain_pending(engine: &Engine, tcx: &mut ThreadContext) {
    loop {
        let next = tcx.shared.pending_signals.lock().unwrap().pop_front();
        let pending = match next {
            Some(p) => p,
            None => return,
        };
        // The queued context is the translated application state at
        // interruption; deliver against it, then resume from whatever
        // the handler activation dictates.
        tcx.mcontext = pending.mc;
        deliver_now(engine, &pending.record, &mut tcx.mcontext);
    }
}
