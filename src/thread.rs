//! Per-thread engine state. The split follows the suspension-point
//! discipline: [`ThreadContext`] is touched only by its owner thread (or
//! by a synchronizer holding the thread suspended), while
//! [`ThreadShared`] carries the few cross-thread-visible fields — synch
//! flags, the pending-event queue, flush requests — behind atomics and
//! short locks.

use crate::app_pc::AppPc;
use crate::code_cache::CodeCache;
use crate::diagnostics;
use crate::flags::Flags;
use crate::fragment::Partition;
use crate::fragment_table::PrivateFragmentTable;
use crate::heap::Dstack;
use crate::ibl::IblTable;
use crate::mcontext::Mcontext;
use crate::os::{Os, OsError, Tid};
use crate::sig::PendingSignal;
use crate::trace::TraceState;
use crate::wrap::WrapFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const NUM_SPILL_SLOTS: usize = 4;

const DSTACK_SIZE: usize = 64 * 1024;

/// Cross-thread-visible half of a thread's state.
pub struct ThreadShared {
    pub tid: Tid,
    /// A synchronizer wants this thread held at a safe point.
    pub synch_requested: AtomicBool,
    /// The thread acknowledged and is parked at its safe point.
    pub synch_acked: AtomicBool,
    /// Blocked in a system call issued through the engine gate; counts
    /// as "at safe point - in kernel" for synchall.
    pub in_kernel: AtomicBool,
    pub exited: AtomicBool,
    /// A block in this thread's in-progress trace was flushed; the
    /// recording must be discarded at the next dispatch.
    pub trace_poison: AtomicBool,
    /// Asynchronous signals awaiting delivery at the next safe point.
    pub pending_signals: Mutex<VecDeque<PendingSignal>>,
    /// Tags whose private fragments must be dropped at the next dispatch
    /// (cross-thread flush cannot touch a private table directly).
    pub pending_flushes: Mutex<Vec<AppPc>>,
    /// Mangling spill slots. Written by in-cache sequences on the owner
    /// thread; read cross-thread only while the owner is suspended or
    /// inside the signal interposer, which is why they live here rather
    /// than in the owner-only context.
    pub spill_slots: [AtomicUsize; NUM_SPILL_SLOTS],
}

impl ThreadShared {
    pub fn new(tid: Tid) -> Arc<ThreadShared> {
        Arc::new(ThreadShared {
            tid,
            synch_requested: AtomicBool::new(false),
            synch_acked: AtomicBool::new(false),
            in_kernel: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            trace_poison: AtomicBool::new(false),
            pending_signals: Mutex::new(VecDeque::new()),
            pending_flushes: Mutex::new(Vec::new()),
            spill_slots: Default::default(),
        })
    }

    pub fn set_spill_slot(&self, slot: usize, value: usize) {
        self.spill_slots[slot].store(value, Ordering::Release);
    }

    pub fn read_spill_slots(&self) -> [usize; NUM_SPILL_SLOTS] {
        let mut out = [0; NUM_SPILL_SLOTS];
        for (i, slot) in self.spill_slots.iter().enumerate() {
            out[i] = slot.load(Ordering::Acquire);
        }
        out
    }

    pub fn queue_signal(&self, sig: PendingSignal) {
        self.pending_signals.lock().unwrap().push_back(sig);
    }

    pub fn queue_flush(&self, tag: AppPc) {
        self.pending_flushes.lock().unwrap().push(tag);
        self.trace_poison.store(true, Ordering::Release);
    }
}

/// Owner-only half: the spill area, engine stack, private tables, wrap
/// stack, and trace recording state.
pub struct ThreadContext {
    pub tid: Tid,
    pub shared: Arc<ThreadShared>,
    /// Application register state, saved at cache exit and restored on
    /// entry.
    pub mcontext: Mcontext,
    /// Engine scratch stack; engine code never runs on the application
    /// stack.
    pub dstack: Dstack,
    pub private_table: PrivateFragmentTable,
    pub private_ibl: IblTable,
    pub private_cache: CodeCache,
    pub wrap_stack: Vec<WrapFrame>,
    pub trace: TraceState,
    /// Dispatch sentinel: reaching this tag ends the dispatch loop
    /// (used by the injector return path and the test harness).
    pub stop_tag: Option<AppPc>,
}

impl ThreadContext {
    /// The thread-birth hook's allocation half: build the context before
    /// the thread takes its first dispatch.
    pub fn new(os: Arc<dyn Os>, shared: Arc<ThreadShared>) -> Result<ThreadContext, OsError> {
        let flags = Flags::get();
        let tid = shared.tid;
        let dstack = Dstack::new(Arc::clone(&os), DSTACK_SIZE)?;
        diagnostics::note_thread(tid, "created");
        Ok(ThreadContext {
            tid,
            shared,
            mcontext: Mcontext::default(),
            dstack,
            private_table: PrivateFragmentTable::new(),
            private_ibl: IblTable::with_bits(flags.ibl_table_bits),
            private_cache: CodeCache::new(
                Partition::PrivateBb,
                flags.cache_unit_size,
                flags.private_cache_budget,
                flags.cache_high_watermark_pct,
            ),
            wrap_stack: Vec::new(),
            trace: TraceState::Idle,
            stop_tag: None,
        })
    }

    /// Drain this thread's pending private-flush requests. Returns the
    /// tags so the caller can also unlink the dropped fragments.
    pub fn take_pending_flushes(&mut self) -> Vec<AppPc> {
        std::mem::take(&mut *self.shared.pending_flushes.lock().unwrap())
    }

    /// Thread-death hook's teardown half. Private fragments become
    /// unreachable with the table; the private cache and dstack release
    /// their memory on drop.
    pub fn teardown(&mut self) {
        self.private_table.drain();
        self.private_ibl.clear();
        self.shared.exited.store(true, Ordering::Release);
        diagnostics::forget_thread(self.tid);
    }
}
