//! The engine handle: every entry point takes an explicit `Engine`
//! reference — there is no ambient engine state beyond the process-wide
//! flags and the signal-handler rendezvous the OS facade needs. Owns the
//! shared caches and tables, the fragment slab, the linker, trace
//! control, the wrap registry, and the thread registry.

use crate::app_pc::AppPc;
use crate::builder::{self, BuildError, BuildInputs};
use crate::cache_pc::CachePc;
use crate::code_cache::{CacheError, CacheStats, CodeCache};
use crate::dispatch::{dispatch_loop, CacheEntry, DispatchExit};
use crate::flags::Flags;
use crate::fragment::{
    ExitKind, Fragment, FragmentFlags, FragmentId, FragmentSlab, Partition,
};
use crate::fragment_table::{InsertError, SharedFragmentTable};
use crate::heap::ExecHeap;
use crate::ibl::IblTable;
use crate::isa::{InstrDecoder, InstrEncoder};
use crate::link::Linker;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::mcontext::{Mcontext, REG_ARG0};
use crate::os::{ExceptionRecord, Os, OsError, Tid};
use crate::persist::PersistedModule;
use crate::sig;
use crate::synch::{self, SynchOutcome, SynchState};
use crate::thread::{ThreadContext, ThreadShared};
use crate::trace::{self, TraceControl, TraceRecording, TraceState};
use crate::wrap::{PostCallback, PreCallback, WrapError, WrapFlags, WrapId, WrapRegistry};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub struct EngineConfig {
    pub os: Arc<dyn Os>,
    pub decoder: Box<dyn InstrDecoder>,
    pub encoder: Box<dyn InstrEncoder>,
    pub backend: Box<dyn CacheEntry>,
    /// Build basic blocks thread-private instead of process-shared.
    pub private_bbs: bool,
}

pub struct Engine {
    pub os: Arc<dyn Os>,
    pub decoder: Box<dyn InstrDecoder>,
    pub encoder: Box<dyn InstrEncoder>,
    pub backend: Box<dyn CacheEntry>,
    pub slab: FragmentSlab,
    pub linker: Linker,
    pub shared_table: SharedFragmentTable,
    pub shared_ibl: IblTable,
    pub shared_cache: Mutex<CodeCache>,
    pub trace_cache: Mutex<CodeCache>,
    pub heap: ExecHeap,
    pub synch: SynchState,
    pub wrap: WrapRegistry,
    pub trace_ctl: TraceControl,
    pub detaching: AtomicBool,
    private_bbs: bool,
    threads: Mutex<HashMap<Tid, Arc<ThreadShared>>>,
    app_handlers: Mutex<HashMap<i32, AppPc>>,
    persisted: Mutex<Vec<PersistedModule>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub shared_cache: CacheStats,
    pub trace_cache: CacheStats,
    pub live_fragments: usize,
    pub shared_table_entries: usize,
    pub threads: usize,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Engine> {
        let flags = Flags::get();
        crate::log::set_level(flags.log_level);
        let heap = ExecHeap::new(Arc::clone(&config.os));
        let engine = Arc::new(Engine {
            os: config.os,
            decoder: config.decoder,
            encoder: config.encoder,
            backend: config.backend,
            slab: FragmentSlab::new(),
            linker: Linker::new(),
            shared_table: SharedFragmentTable::new(),
            shared_ibl: IblTable::with_bits(flags.ibl_table_bits),
            shared_cache: Mutex::new(CodeCache::new(
                Partition::SharedBb,
                flags.cache_unit_size,
                flags.shared_cache_budget,
                flags.cache_high_watermark_pct,
            )),
            trace_cache: Mutex::new(CodeCache::new(
                Partition::Trace,
                flags.cache_unit_size,
                flags.trace_cache_budget,
                flags.cache_high_watermark_pct,
            )),
            heap,
            synch: SynchState::new(),
            wrap: WrapRegistry::new(),
            trace_ctl: TraceControl::new(),
            detaching: AtomicBool::new(false),
            private_bbs: config.private_bbs,
            threads: Mutex::new(HashMap::new()),
            app_handlers: Mutex::new(HashMap::new()),
            persisted: Mutex::new(Vec::new()),
        });
        let weak: Weak<Engine> = Arc::downgrade(&engine);
        let sink = Arc::new(move |record: &ExceptionRecord, mc: &mut Mcontext| {
            match weak.upgrade() {
                Some(engine) => sig::interpose(&engine, record, mc),
                None => false,
            }
        });
        if let Err(e) = engine.os.install_exception_handler(sink) {
            log!(LogWarn, "exception interposition unavailable: {}", e);
        }
        log!(LogInfo, "engine initialized");
        engine
    }

    // ---- thread lifecycle ----

    /// Thread-birth hook: allocate the per-thread context and register
    /// the thread. The caller takes the first dispatch.
    pub fn attach_thread(&self) -> Result<ThreadContext, OsError> {
        let tid = self.os.current_tid();
        let shared = ThreadShared::new(tid);
        let previous = self
            .threads
            .lock()
            .unwrap()
            .insert(tid, Arc::clone(&shared));
        engine_assert!(
            tid,
            previous.is_none() || previous.as_ref().map(|p| p.exited.load(Ordering::Acquire))
                == Some(true),
            "thread attached twice"
        );
        ThreadContext::new(Arc::clone(&self.os), shared)
    }

    /// Thread-death hook: tear down per-thread state and unregister.
    pub fn detach_thread(&self, tcx: &mut ThreadContext) {
        tcx.teardown();
        self.threads.lock().unwrap().remove(&tcx.tid);
    }

    pub fn thread_shared(&self, tid: Tid) -> Option<Arc<ThreadShared>> {
        self.threads.lock().unwrap().get(&tid).cloned()
    }

    pub fn peer_threads(&self, requester: Tid) -> Vec<Arc<ThreadShared>> {
        self.threads
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.tid != requester && !t.exited.load(Ordering::Acquire))
            .cloned()
            .collect()
    }

    /// Convenience driver: dispatch from `start` until `stop` is the
    /// next application PC.
    pub fn run_thread(
        &self,
        tcx: &mut ThreadContext,
        start: AppPc,
        stop: AppPc,
    ) -> DispatchExit {
        tcx.stop_tag = Some(stop);
        tcx.mcontext.set_pc(start.as_usize());
        dispatch_loop(self, tcx)
    }

    // ---- lookup and build ----

    fn lookup_visible(&self, tcx: &ThreadContext, tag: AppPc) -> Option<FragmentId> {
        if let Some(id) = tcx.private_table.lookup(tag) {
            return Some(id);
        }
        self.shared_table.lookup(tag)
    }

    pub fn lookup_or_build(
        &self,
        tcx: &mut ThreadContext,
        tag: AppPc,
    ) -> Result<Arc<Fragment>, BuildError> {
        if let Some(id) = tcx.private_table.lookup(tag) {
            match self.slab.get(id) {
                Some(f) => return Ok(f),
                None => {
                    tcx.private_table.remove(tag);
                }
            }
        }
        if let Some(id) = self.shared_table.lookup(tag) {
            match self.slab.get(id) {
                Some(f) => return Ok(f),
                None => {
                    self.shared_table.remove(tag);
                }
            }
        }
        // Third partition: a frozen per-module entry that still matches
        // the live application bytes lets the rebuild carry the FROZEN
        // mark (and skip re-validation next time).
        let frozen = self.persisted_matches(tag);
        let frag = if self.private_bbs {
            self.build_private(tcx, tag)?
        } else {
            self.build_shared(tcx, tag)?
        };
        if frozen {
            frag.set_flag(FragmentFlags::FROZEN);
        }
        Ok(frag)
    }

    fn build_inputs(&self) -> BuildInputs {
        BuildInputs {
            os: self.os.as_ref(),
            decoder: self.decoder.as_ref(),
            encoder: self.encoder.as_ref(),
            heap: &self.heap,
            slab: &self.slab,
        }
    }

    fn build_shared(
        &self,
        tcx: &ThreadContext,
        tag: AppPc,
    ) -> Result<Arc<Fragment>, BuildError> {
        let frag = {
            let inp = self.build_inputs();
            let mut cache = self.shared_cache.lock().unwrap();
            match builder::build_bb(&inp, &mut cache, Partition::SharedBb, tag) {
                Ok(f) => f,
                Err(BuildError::Cache(CacheError::OutOfMemory)) => {
                    drop(cache);
                    self.evict_oldest_shared(tcx.tid);
                    let mut cache = self.shared_cache.lock().unwrap();
                    builder::build_bb(&inp, &mut cache, Partition::SharedBb, tag)?
                }
                Err(e) => return Err(e),
            }
        };
        if self.is_interposed(tag) {
            frag.set_flag(FragmentFlags::NO_LINK);
        }
        match self.shared_table.insert(tag, frag.id) {
            Ok(()) => {}
            Err(InsertError::AlreadyPresent(winner)) => {
                // Lost the race: discard our build, use the winner's.
                log!(LogDebug, "lost shared build race for {}", tag);
                let mut cache = self.shared_cache.lock().unwrap();
                cache.forget_fragment(frag.unit, frag.id);
                self.slab.remove(frag.id);
                if let Some(w) = self.slab.get(winner) {
                    return Ok(w);
                }
                // Winner evaporated between insert and get; fall through
                // to a retry via the caller's normal path.
                return self.build_shared(tcx, tag);
            }
        }
        self.linker
            .attach(&self.slab, &frag, |t| self.shared_table.lookup(t));
        Ok(frag)
    }

    fn build_private(
        &self,
        tcx: &mut ThreadContext,
        tag: AppPc,
    ) -> Result<Arc<Fragment>, BuildError> {
        let frag = {
            let inp = self.build_inputs();
            match builder::build_bb(&inp, &mut tcx.private_cache, Partition::PrivateBb, tag) {
                Ok(f) => f,
                Err(BuildError::Cache(CacheError::OutOfMemory)) => {
                    self.evict_oldest_private(tcx);
                    let inp = self.build_inputs();
                    builder::build_bb(&inp, &mut tcx.private_cache, Partition::PrivateBb, tag)?
                }
                Err(e) => return Err(e),
            }
        };
        if self.is_interposed(tag) {
            frag.set_flag(FragmentFlags::NO_LINK);
        }
        // Private tables cannot race: the owner is the only writer.
        let _ = tcx.private_table.insert(tag, frag.id);
        // Private fragments link only among this thread's privates and
        // never via the global pending list.
        let direct: Vec<(u32, AppPc)> = frag.with_links(|links| {
            links
                .exits
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.target.map(|t| (i as u32, t)))
                .collect()
        });
        for (exit_index, target_tag) in direct {
            if let Some(target) = tcx.private_table.lookup(target_tag) {
                self.linker.link(&self.slab, frag.id, exit_index, target);
            }
        }
        Ok(frag)
    }

    pub fn exit_info(
        &self,
        source: FragmentId,
        exit_index: u32,
    ) -> Option<(ExitKind, Option<AppPc>)> {
        let frag = self.slab.get(source)?;
        frag.with_links(|links| {
            links
                .exits
                .get(exit_index as usize)
                .map(|e| (e.kind, e.target))
        })
    }

    /// The fragment whose cache span contains `pc`, across every
    /// partition (the slab holds them all).
    pub fn fragment_at_cache_pc(&self, pc: CachePc) -> Option<Arc<Fragment>> {
        self.slab.find(|f| f.contains_cache_pc(pc))
    }

    // ---- interposition plumbing ----

    pub fn is_interposed(&self, tag: AppPc) -> bool {
        self.wrap.is_wrapped(tag) || self.wrap.resolve_replacement(tag) != tag
    }

    pub fn publish_ibl(&self, tcx: &ThreadContext, frag: &Arc<Fragment>) {
        // Heads and interposed tags must keep round-tripping through
        // dispatch; a lookup-table hit would bypass it.
        if frag.test_flag(FragmentFlags::NO_LINK) || frag.test_flag(FragmentFlags::TRACE_HEAD) {
            return;
        }
        if frag.is_shared() {
            self.shared_ibl.insert(frag.tag, frag.entry);
        } else {
            tcx.private_ibl.insert(frag.tag, frag.entry);
        }
    }

    pub fn set_app_handler(&self, signum: i32, handler: AppPc) {
        self.app_handlers.lock().unwrap().insert(signum, handler);
    }

    pub fn app_handler(&self, signum: i32) -> Option<AppPc> {
        self.app_handlers.lock().unwrap().get(&signum).copied()
    }

    /// Deliver an application-code fault: redirect to a registered
    /// handler (true) or hand it to native disposition (false).
    pub fn deliver_app_fault(&self, record: &ExceptionRecord, mc: &mut Mcontext) -> bool {
        match self.app_handler(record.signum) {
            Some(handler) => {
                let sp = mc.sp() - 8;
                if self
                    .os
                    .write_app(AppPc::new(sp), &mc.pc().to_le_bytes())
                    .is_err()
                {
                    return false;
                }
                mc.set_sp(sp);
                mc.set_gpr(REG_ARG0, record.signum as usize);
                mc.set_pc(handler.as_usize());
                true
            }
            None => {
                let _ = self.os.raise_exception_to_app(record, mc);
                false
            }
        }
    }

    // ---- wrap / replace surface ----

    pub fn wrap_function(
        &self,
        func: AppPc,
        pre: Option<PreCallback>,
        post: Option<PostCallback>,
        flags: WrapFlags,
        user_seed: usize,
    ) -> WrapId {
        let id = self.wrap.wrap(func, pre, post, flags, user_seed);
        // Lazily invalidate any fragment that could bypass dispatch for
        // this tag (links into it, lookup-table entries).
        self.flush_tag(self.os.current_tid(), func);
        id
    }

    pub fn unwrap_function(&self, func: AppPc, id: WrapId) -> Result<(), WrapError> {
        let result = self.wrap.unwrap_id(func, id);
        if result.is_ok() {
            self.flush_tag(self.os.current_tid(), func);
        }
        result
    }

    pub fn replace_function(
        &self,
        orig: AppPc,
        repl: Option<AppPc>,
        override_existing: bool,
    ) -> Result<(), WrapError> {
        let result = self.wrap.replace(orig, repl, override_existing);
        if result.is_ok() {
            self.flush_tag(self.os.current_tid(), orig);
        }
        result
    }

    // ---- flush and eviction ----

    /// Flush every fragment keyed by `tag`: unlink, drop table and
    /// lookup entries, and synch all threads so none remains inside
    /// before the id dies. Private copies in other threads are flushed
    /// lazily through their pending queues.
    pub fn flush_tag(&self, requester: Tid, tag: AppPc) {
        let shared_victim = self.shared_table.lookup(tag);
        if let Some(id) = shared_victim {
            if let Some(frag) = self.slab.get(id) {
                frag.set_flag(FragmentFlags::BEING_FLUSHED);
            }
            self.linker.unlink_incoming(&self.slab, id);
            self.linker.unlink_outgoing(&self.slab, id);
            self.shared_table.remove(tag);
            self.shared_ibl.remove(tag);
        }
        for peer in self.peer_threads(requester) {
            peer.queue_flush(tag);
        }
        if let Some(own) = self.thread_shared(requester) {
            own.queue_flush(tag);
        }
        let (_, outcome) = synch::synchall(self, requester, || {
            if let Some(id) = shared_victim {
                if let Some(frag) = self.slab.get(id) {
                    self.shared_cache
                        .lock()
                        .unwrap()
                        .forget_fragment(frag.unit, id);
                }
                self.slab.remove(id);
            }
        });
        log_synch_outcome("flush", &outcome);
    }

    /// Drain this thread's queued private flushes (dispatch safe point).
    pub fn apply_pending_flushes(&self, tcx: &mut ThreadContext) {
        let tags = tcx.take_pending_flushes();
        if tags.is_empty() {
            return;
        }
        let recording_poisoned = tcx.shared.trace_poison.swap(false, Ordering::AcqRel);
        for tag in tags {
            if let Some(id) = tcx.private_table.remove(tag) {
                self.linker.unlink_incoming(&self.slab, id);
                self.linker.unlink_outgoing(&self.slab, id);
                tcx.private_ibl.remove(tag);
                if let Some(frag) = self.slab.get(id) {
                    tcx.private_cache.forget_fragment(frag.unit, id);
                }
                self.slab.remove(id);
            }
        }
        if recording_poisoned {
            if let TraceState::Recording(rec) = std::mem::take(&mut tcx.trace) {
                log!(LogDebug, "discarding poisoned trace from {}", rec.head);
                self.discard_recording_copies(tcx, &rec.copies);
                self.trace_ctl.release(rec.head, tcx.tid);
            }
        }
    }

    /// FIFO eviction of the shared partition's oldest unit.
    fn evict_oldest_shared(&self, requester: Tid) {
        let victim = self.shared_cache.lock().unwrap().eviction_victim();
        let (unit, frags) = match victim {
            Some(v) => v,
            None => return,
        };
        for &id in &frags {
            self.linker.unlink_incoming(&self.slab, id);
            self.linker.unlink_outgoing(&self.slab, id);
            if let Some(frag) = self.slab.get(id) {
                if self.shared_table.lookup(frag.tag) == Some(id) {
                    self.shared_table.remove(frag.tag);
                }
                self.shared_ibl.remove(frag.tag);
            }
        }
        let (_, outcome) = synch::synchall(self, requester, || {
            let mut cache = self.shared_cache.lock().unwrap();
            for &id in &frags {
                cache.forget_fragment(unit, id);
                self.slab.remove(id);
            }
            cache.release_unit(&self.heap, unit);
        });
        log_synch_outcome("evict", &outcome);
    }

    /// Private partitions are single-owner: no synch needed beyond the
    /// owner being right here.
    fn evict_oldest_private(&self, tcx: &mut ThreadContext) {
        let victim = tcx.private_cache.eviction_victim();
        let (unit, frags) = match victim {
            Some(v) => v,
            None => return,
        };
        for &id in &frags {
            self.linker.unlink_incoming(&self.slab, id);
            self.linker.unlink_outgoing(&self.slab, id);
            if let Some(frag) = self.slab.get(id) {
                tcx.private_table.remove(frag.tag);
                tcx.private_ibl.remove(frag.tag);
            }
            tcx.private_cache.forget_fragment(unit, id);
            self.slab.remove(id);
        }
        tcx.private_cache.release_unit(&self.heap, unit);
    }

    // ---- trace formation ----

    pub fn trace_tick(&self, tcx: &mut ThreadContext, frag: &Arc<Fragment>) {
        let flags = Flags::get();
        if tcx.trace.is_recording() {
            // Running into an existing trace (or a fault stub) ends the
            // recording at the boundary; anything else is considered
            // for inclusion.
            let stop = if frag.test_flag(FragmentFlags::IS_TRACE)
                || frag.test_flag(FragmentFlags::FAULT_STUB)
            {
                Some(trace::TraceStop::Repeat)
            } else {
                match &mut tcx.trace {
                    TraceState::Recording(rec) => rec.note_block(frag, flags.max_trace_blocks),
                    TraceState::Idle => None,
                }
            };
            if let Some(stop) = stop {
                if let TraceState::Recording(rec) = std::mem::take(&mut tcx.trace) {
                    log!(LogDebug, "trace from {} stopped: {:?}", rec.head, stop);
                    self.finish_recording(tcx, rec);
                }
            }
            return;
        }
        if frag.test_flag(FragmentFlags::IS_TRACE) || frag.test_flag(FragmentFlags::FAULT_STUB) {
            return;
        }
        if frag.test_flag(FragmentFlags::TRACE_HEAD)
            && trace::head_ready_to_trace(frag, flags.trace_threshold)
            && self.trace_ctl.try_claim(frag.tag, tcx.tid)
        {
            let mut rec = TraceRecording::new(frag.tag);
            match rec.note_block(frag, flags.max_trace_blocks) {
                None => tcx.trace = TraceState::Recording(rec),
                Some(_) => {
                    // Terminal head: nothing to fuse, drop back to cold.
                    self.trace_ctl.release(frag.tag, tcx.tid);
                    frag.clear_flag(FragmentFlags::TRACE_HEAD);
                    frag.reset_hit_count();
                }
            }
        }
    }

    /// Throwaway unlinked copy of one block, used while recording so
    /// every block exit returns to dispatch and can be appended to the
    /// trace.
    pub fn recording_copy(
        &self,
        tcx: &mut ThreadContext,
        tag: AppPc,
    ) -> Result<Arc<Fragment>, BuildError> {
        let frag = {
            let inp = self.build_inputs();
            builder::build_bb(&inp, &mut tcx.private_cache, Partition::PrivateBb, tag)?
        };
        frag.set_flag(FragmentFlags::NO_LINK);
        if let TraceState::Recording(rec) = &mut tcx.trace {
            rec.copies.push(frag.id);
        }
        Ok(frag)
    }

    fn discard_recording_copies(&self, tcx: &mut ThreadContext, copies: &[FragmentId]) {
        for &id in copies {
            if let Some(frag) = self.slab.get(id) {
                tcx.private_cache.forget_fragment(frag.unit, id);
            }
            self.slab.remove(id);
        }
    }

    fn finish_recording(&self, tcx: &mut ThreadContext, rec: TraceRecording) {
        let head = rec.head;
        let blocks = rec.blocks;
        self.discard_recording_copies(tcx, &rec.copies);
        self.trace_ctl.release(head, tcx.tid);
        let head_id = self.lookup_visible(tcx, head);
        if blocks.len() < 2 {
            // Retired without a trace: back to cold.
            if let Some(id) = head_id {
                if let Some(frag) = self.slab.get(id) {
                    frag.clear_flag(FragmentFlags::TRACE_HEAD);
                    frag.reset_hit_count();
                }
            }
            return;
        }
        let trace_frag = {
            let inp = self.build_inputs();
            let mut cache = self.trace_cache.lock().unwrap();
            match builder::build_trace(&inp, &mut cache, &blocks) {
                Ok(f) => f,
                Err(e) => {
                    log!(LogWarn, "trace emission from {} failed: {}", head, e);
                    return;
                }
            }
        };
        log!(
            LogInfo,
            "trace {} covers {} blocks from {}",
            trace_frag.id,
            blocks.len(),
            head
        );
        // The trace shadows the head block: future lookups and indirect
        // branches land on the trace; links into the old head are torn
        // down so linked predecessors re-resolve through dispatch.
        if let Some(id) = head_id {
            self.linker.unlink_incoming(&self.slab, id);
            if let Some(frag) = self.slab.get(id) {
                frag.clear_flag(FragmentFlags::TRACE_HEAD);
            }
        }
        if tcx.private_table.remove(head).is_some() {
            let _ = tcx.private_table.insert(head, trace_frag.id);
            tcx.private_ibl.insert(head, trace_frag.entry);
        } else {
            if self.shared_table.lookup(head).is_some() {
                self.shared_table.remove(head);
            }
            let _ = self.shared_table.insert(head, trace_frag.id);
            self.shared_ibl.insert(head, trace_frag.entry);
        }
        self.linker
            .attach(&self.slab, &trace_frag, |t| self.shared_table.lookup(t));
    }

    // ---- persisted module caches ----

    pub fn bind_persisted_module(&self, module: PersistedModule) {
        log!(
            LogInfo,
            "bound persisted cache for {} ({} entries)",
            module.identity.path,
            module.entries.len()
        );
        self.persisted.lock().unwrap().push(module);
    }

    /// True when a frozen entry covers `tag` and its bytes still match
    /// the live application code. Frozen stub identities and cache
    /// addresses are run-specific, so a validated entry is rebuilt
    /// through the normal emitter rather than executed verbatim.
    pub fn persisted_matches(&self, tag: AppPc) -> bool {
        let modules = self.persisted.lock().unwrap();
        for module in modules.iter() {
            if let Some((offset, size)) = module.entry_covering(tag) {
                let frozen = match module.bytes.get(offset..offset + size) {
                    Some(b) => b,
                    None => continue,
                };
                let mut live = vec![0u8; size];
                if self.os.read_app(tag, &mut live) != Ok(size) {
                    continue;
                }
                if live == frozen {
                    return true;
                }
            }
        }
        false
    }

    // ---- detach and teardown ----

    /// Runtime detach: stop shepherding. Threads parked in dispatch
    /// drain their wrap stacks and leave with pure application state;
    /// suspended stragglers are teleported out of the cache.
    pub fn detach(&self, requester: Tid) -> bool {
        if !Flags::get().detach_allowed {
            log!(LogWarn, "detach requested but not allowed; continuing");
            return false;
        }
        self.detaching.store(true, Ordering::Release);
        let (_, outcome) = synch::synchall(self, requester, || {});
        log_synch_outcome("detach", &outcome);
        true
    }

    /// Process-death hook: bring every thread to rest, then let drops
    /// release caches and tables in reverse dependency order.
    pub fn process_death(&self, requester: Tid) {
        let (_, outcome) = synch::synchall(self, requester, || {
            log!(LogInfo, "process teardown under synchall");
        });
        log_synch_outcome("teardown", &outcome);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            shared_cache: self.shared_cache.lock().unwrap().stats(),
            trace_cache: self.trace_cache.lock().unwrap().stats(),
            live_fragments: self.slab.live_count(),
            shared_table_entries: self.shared_table.len(),
            threads: self.threads.lock().unwrap().len(),
        }
    }
}

fn log_synch_outcome(what: &str, outcome: &SynchOutcome) {
    if !outcome.skipped.is_empty() {
        log!(
            LogWarn,
            "{}: skipped unsuspendable threads {:?}",
            what,
            outcome.skipped
        );
    }
    log!(
        LogDebug,
        "{}: {} cooperative, {} forced",
        what,
        outcome.cooperative.len(),
        outcome.forced.len()
    );
}

/// The injector hands control to this entry with a pointer to its
/// argument block: a sentinel, the saved machine context to resume, and
/// an optional engine home directory. Returns nonzero when takeover
/// cannot proceed (bad block, or no native backend linked into this
/// build).
pub const INJECTOR_SENTINEL: usize = 0xD101_C0DE;

#[repr(C)]
pub struct InjectorBlock {
    pub sentinel: usize,
    pub mcontext: Mcontext,
    pub home: *const libc::c_char,
}

#[no_mangle]
pub unsafe extern "C" fn drio_engine_entry(block: *mut InjectorBlock) -> i32 {
    if block.is_null() || (*block).sentinel != INJECTOR_SENTINEL {
        return -1;
    }
    #[cfg(feature = "native-backend")]
    {
        crate::native::take_over(&mut *block)
    }
    #[cfg(not(feature = "native-backend"))]
    {
        log!(
            LogWarn,
            "injector entry reached without the native backend linked"
        );
        -1
    }
}
