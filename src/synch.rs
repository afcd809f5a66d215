//! Synchall: stop every other thread at a safe point. Cooperative first
//! (a flag checked at every cache exit), escalating to forced OS
//! suspension with translate-out-of-cache when a peer does not come to
//! rest in time. Synchall invocations are serialized by the top-ranked
//! global lock; a thread blocked in a system call through the engine's
//! gate counts as already safe.

use crate::cache_pc::CachePc;
use crate::engine::Engine;
use crate::flags::Flags;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::os::Tid;
use crate::thread::ThreadShared;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct SynchState {
    /// Only one synchall in flight; ranked above every other engine
    /// lock.
    global: Mutex<()>,
}

impl SynchState {
    pub fn new() -> SynchState {
        SynchState {
            global: Mutex::new(()),
        }
    }
}

impl Default for SynchState {
    fn default() -> SynchState {
        SynchState::new()
    }
}

/// How each peer was brought to rest.
#[derive(Debug, Default)]
pub struct SynchOutcome {
    pub cooperative: Vec<Tid>,
    pub forced: Vec<Tid>,
    /// Peers that could not be suspended (privilege, races with exit);
    /// logged and skipped per the escalation policy.
    pub skipped: Vec<Tid>,
}

fn peer_is_safe(peer: &ThreadShared) -> bool {
    peer.exited.load(Ordering::Acquire)
        || peer.synch_acked.load(Ordering::Acquire)
        || peer.in_kernel.load(Ordering::Acquire)
}

/// Suspend `peer` by force and, if its PC sits inside a cache fragment,
/// rewrite its context to the translated application state so no cache
/// address survives in the thread.
fn force_out_of_cache(engine: &Engine, peer: &ThreadShared) -> bool {
    let tid = peer.tid;
    if engine.os.suspend_thread(tid).is_err() {
        return false;
    }
    let mut ctx = match engine.os.get_thread_context(tid) {
        Ok(c) => c,
        Err(_) => {
            let _ = engine.os.resume_thread(tid);
            return false;
        }
    };
    let cache_pc = CachePc::new(ctx.pc());
    if let Some(frag) = engine.fragment_at_cache_pc(cache_pc) {
        let spills = peer.read_spill_slots();
        match frag
            .translation
            .translate(frag.tag, frag.entry, frag.body_len, cache_pc, &mut ctx, &spills)
        {
            Ok(app_pc) => {
                log!(
                    LogDebug,
                    "teleported tid {} out of {} to {}",
                    tid,
                    frag.id,
                    app_pc
                );
                if engine.os.set_thread_context(tid, &ctx).is_err() {
                    log!(LogWarn, "failed to write translated context for {}", tid);
                }
            }
            Err(e) => {
                fatal!("thread {} unsynchable: {}", tid, e);
            }
        }
    }
    let _ = engine.os.resume_thread(tid);
    true
}

/// Stop the world (all threads except `requester`), run `critical`, and
/// release. Returns the closure's result and how each peer was stopped.
pub fn synchall<R>(
    engine: &Engine,
    requester: Tid,
    critical: impl FnOnce() -> R,
) -> (R, SynchOutcome) {
    let _global = engine.synch.global.lock().unwrap();
    let peers: Vec<Arc<ThreadShared>> = engine.peer_threads(requester);
    let mut outcome = SynchOutcome::default();

    for peer in &peers {
        peer.synch_requested.store(true, Ordering::Release);
    }

    let deadline = Instant::now() + Duration::from_millis(Flags::get().synchall_timeout_ms);
    let mut unresolved: Vec<Arc<ThreadShared>> = peers.clone();
    while !unresolved.is_empty() && Instant::now() < deadline {
        unresolved.retain(|peer| {
            if peer_is_safe(peer) {
                outcome.cooperative.push(peer.tid);
                false
            } else {
                true
            }
        });
        if !unresolved.is_empty() {
            std::thread::yield_now();
        }
    }

    // Timeout: escalate to forced suspension for the stragglers.
    for peer in unresolved {
        if force_out_of_cache(engine, &peer) {
            outcome.forced.push(peer.tid);
        } else {
            log!(LogWarn, "synchall skipping unsuspendable tid {}", peer.tid);
            outcome.skipped.push(peer.tid);
        }
    }

    let result = critical();

    for peer in &peers {
        peer.synch_requested.store(false, Ordering::Release);
    }
    (result, outcome)
}

/// The cooperative half, run by every thread at each cache exit: if a
/// synchronizer asked, acknowledge and park until released.
pub fn at_safe_point(shared: &ThreadShared) {
    if !shared.synch_requested.load(Ordering::Acquire) {
        return;
    }
    shared.synch_acked.store(true, Ordering::Release);
    while shared.synch_requested.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    shared.synch_acked.store(false, Ordering::Release);
}
