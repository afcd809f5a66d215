//! The dispatch loop: the engine-side routine run between fragment
//! executions. Saves nothing itself — the cache-exit path has already
//! spilled application state into the thread context — it drains pending
//! work (synch requests, flushes, deferred signals, wrap unwinds), picks
//! the next fragment (building on miss), drives trace formation, and
//! re-enters the cache through the platform context-switch seam.

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use crate::engine::Engine;
use crate::fragment::{ExitKind, FragmentId};
use crate::log::LogLevel::LogDebug;
use crate::mcontext::{arg_reg, REG_RET};
use crate::os::ExceptionRecord;
use crate::sig;
use crate::synch;
use crate::thread::ThreadContext;
use crate::wrap;
use std::sync::atomic::Ordering;

/// How control came back from the cache.
#[derive(Copy, Clone, Debug)]
pub enum CacheExit {
    /// An exit stub fired: dispatch resolves (and may link) the target.
    Stub {
        source: FragmentId,
        exit_index: u32,
    },
    /// The indirect-branch lookup missed; the dynamic target is known.
    IndirectMiss { target: AppPc },
    /// A system-call gate fired.
    Syscall {
        source: FragmentId,
        exit_index: u32,
    },
    /// A fault surfaced while executing cache code (or a synthetic
    /// fault fragment re-raised an application fault).
    Fault { record: ExceptionRecord },
}

/// The platform context-switch boundary: restore application register
/// state, enter the cache at `entry`, run until a cache exit, spill the
/// state back. The native implementation is a small assembly stub behind
/// the `native-backend` feature; tests install a simulated executor.
pub trait CacheEntry: Send + Sync {
    fn enter(&self, engine: &Engine, tcx: &mut ThreadContext, entry: CachePc) -> CacheExit;
}

/// Why the dispatch loop returned.
#[derive(Clone, Debug)]
pub enum DispatchExit {
    /// The configured stop tag was reached (injector return path, test
    /// harness).
    ReachedStop,
    /// The engine is detaching; the thread's state is pure application
    /// state.
    Detached,
    /// An application fault with no registered handler: native
    /// disposition took over.
    AppFault(ExceptionRecord),
}

pub fn dispatch_loop(engine: &Engine, tcx: &mut ThreadContext) -> DispatchExit {
    // A direct exit waiting to be linked to the fragment about to be
    // built: {source, exit index, expected target tag}.
    let mut relink: Option<(FragmentId, u32, AppPc)> = None;

    loop {
        synch::at_safe_point(&tcx.shared);
        if engine.detaching.load(Ordering::Acquire) {
            wrap::drain_all(&mut tcx.wrap_stack, &mut tcx.mcontext);
            return DispatchExit::Detached;
        }
        engine.apply_pending_flushes(tcx);
        sig::drain_pending(engine, tcx);

        let raw_tag = AppPc::new(tcx.mcontext.pc());
        if tcx.stop_tag == Some(raw_tag) {
            wrap::check_unwind(&mut tcx.wrap_stack, &mut tcx.mcontext, raw_tag);
            return DispatchExit::ReachedStop;
        }
        wrap::check_unwind(&mut tcx.wrap_stack, &mut tcx.mcontext, raw_tag);
        let tag = match wrap::enter_target(
            &engine.wrap,
            engine.os.as_ref(),
            &mut tcx.mcontext,
            &mut tcx.wrap_stack,
            raw_tag,
        ) {
            wrap::WrapDisposition::Proceed(t) => t,
            wrap::WrapDisposition::Redirect(t) => {
                tcx.mcontext.set_pc(t.as_usize());
                relink = None;
                continue;
            }
        };
        tcx.mcontext.set_pc(tag.as_usize());

        let frag = match engine.lookup_or_build(tcx, tag) {
            Ok(f) => f,
            Err(e) => fatal!("cannot build fragment for {}: {}", tag, e),
        };

        // Satisfy a direct exit that was waiting on this tag. Recording
        // threads skip this: their throwaway copies must stay unlinked.
        if let Some((source, exit_index, expected)) = relink.take() {
            if expected == tag && !tcx.trace.is_recording() {
                engine.linker.link(&engine.slab, source, exit_index, frag.id);
            }
        }

        engine.trace_tick(tcx, &frag);

        // While recording, each block runs as a throwaway unlinked copy
        // so its exit comes back here and the block can be appended.
        let entry = if tcx.trace.is_recording() {
            match engine.recording_copy(tcx, tag) {
                Ok(copy) => copy.entry,
                Err(e) => fatal!("cannot copy block {} for recording: {}", tag, e),
            }
        } else {
            frag.entry
        };
        let exit = engine.backend.enter(engine, tcx, entry);
        match exit {
            CacheExit::Stub { source, exit_index } => {
                let (kind, target) = match engine.exit_info(source, exit_index) {
                    Some(info) => info,
                    None => fatal!("stale exit {}:{}", source, exit_index),
                };
                let target = match target {
                    Some(t) => t,
                    None => fatal!("stub exit {}:{} has no static target", source, exit_index),
                };
                tcx.mcontext.set_pc(target.as_usize());
                if matches!(kind, ExitKind::DirectBranch | ExitKind::Fallthrough) {
                    relink = Some((source, exit_index, target));
                }
            }
            CacheExit::IndirectMiss { target } => {
                tcx.mcontext.set_pc(target.as_usize());
                // Fill the lookup table so the next execution stays in
                // the cache — unless the target is interposed on (or is
                // the loop's stop sentinel) and must keep round-tripping
                // through dispatch.
                if tcx.stop_tag != Some(target) && !engine.is_interposed(target) {
                    if let Ok(f) = engine.lookup_or_build(tcx, target) {
                        engine.publish_ibl(tcx, &f);
                    }
                }
            }
            CacheExit::Syscall { source, exit_index } => {
                let fallthrough = match engine.exit_info(source, exit_index) {
                    Some((_, Some(t))) => t,
                    _ => fatal!("syscall exit {}:{} has no continuation", source, exit_index),
                };
                let number = tcx.mcontext.gpr(REG_RET);
                let mut args = [0usize; 6];
                for (i, slot) in args.iter_mut().enumerate() {
                    if let Some(reg) = arg_reg(i) {
                        *slot = tcx.mcontext.gpr(reg);
                    }
                }
                log!(LogDebug, "syscall {} from {}", number, source);
                // Blocked-in-kernel threads count as safe for synchall.
                tcx.shared.in_kernel.store(true, Ordering::Release);
                let ret = engine.os.perform_syscall(number, &args);
                tcx.shared.in_kernel.store(false, Ordering::Release);
                tcx.mcontext.set_retval(ret);
                tcx.mcontext.set_pc(fallthrough.as_usize());
            }
            CacheExit::Fault { record } => {
                if sig::interpose(engine, &record, &mut tcx.mcontext) {
                    // Consumed: context now points at application state
                    // (handler activation or past the translated fault).
                    continue;
                }
                // Application-level fault. A registered handler gets an
                // activation; otherwise native disposition ends the
                // show.
                if engine.deliver_app_fault(&record, &mut tcx.mcontext) {
                    continue;
                }
                return DispatchExit::AppFault(record);
            }
        }
    }
}
