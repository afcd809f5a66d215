//! End-to-end scenarios driving the whole engine — builder, cache,
//! linker, lookup tables, dispatch, traces, wrap layer, signals —
//! against the toy ISA, the simulated executor, and the in-memory OS
//! facade.

use crate::app_pc::AppPc;
use crate::dispatch::DispatchExit;
use crate::engine::{Engine, EngineConfig};
use crate::fragment::FragmentFlags;
use crate::isa::FaultKind;
use crate::mcontext::{Mcontext, RegId, REG_ARG0, REG_RET, REG_SP};
use crate::mock::{Assembler, MockOs, Observable, TestIsa, INSTR_LEN};
use crate::os::{ExceptionRecord, Os, Prot, PAGE_SIZE};
use crate::persist::{ModuleIdentity, PersistEntry, PersistedModule};
use crate::sig::PendingSignal;
use crate::sim::SimCpu;
use crate::thread::ThreadContext;
use crate::wrap::{PostContext, PreContext, WrapFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Sentinel "return address" never executed: dispatch stops when the
/// next application PC equals it.
const STOP: usize = 0x5704_0000;

struct Harness {
    os: Arc<MockOs>,
    engine: Arc<Engine>,
}

impl Harness {
    fn new() -> Harness {
        let os = MockOs::arc();
        let engine = Engine::new(EngineConfig {
            os: Arc::clone(&os) as Arc<dyn Os>,
            decoder: Box::new(TestIsa),
            encoder: Box::new(TestIsa),
            backend: Box::new(SimCpu::new(Arc::clone(&os))),
            private_bbs: false,
        });
        Harness { os, engine }
    }

    /// A thread whose application stack holds the stop sentinel as the
    /// outermost return address.
    fn thread_with_stack(&self) -> ThreadContext {
        let mut tcx = self.engine.attach_thread().unwrap();
        let sp = self.os.map_app_stack() - 8;
        self.os.poke_app(AppPc::new(sp), &STOP.to_le_bytes());
        tcx.mcontext.set_sp(sp);
        tcx
    }

    /// Reset the stack for another call on the same thread.
    fn rearm_stack(&self, tcx: &mut ThreadContext) {
        let sp = self.os.map_app_stack() - 8;
        self.os.poke_app(AppPc::new(sp), &STOP.to_le_bytes());
        tcx.mcontext.set_sp(sp);
    }

    fn run(&self, tcx: &mut ThreadContext, start: AppPc) -> DispatchExit {
        self.engine.run_thread(tcx, start, AppPc::new(STOP))
    }
}

fn assert_stopped(exit: DispatchExit) {
    match exit {
        DispatchExit::ReachedStop => {}
        other => panic!("expected clean stop, got {:?}", other),
    }
}

#[test]
fn s1_basic_interposition() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let mut asm = Assembler::at(&h.os, page);
    asm.movi(REG_RET, 1);
    asm.ret();

    assert_stopped(h.run(&mut tcx, page));
    assert_eq!(tcx.mcontext.retval(), 1);
    // Exactly one fragment, for the function's tag; no traces formed.
    assert_eq!(h.engine.shared_table.len(), 1);
    assert!(h.engine.shared_table.lookup(page).is_some());
    assert_eq!(h.engine.stats().trace_cache.fragments, 0);
    assert!(tcx.wrap_stack.is_empty());
}

#[test]
fn s2_wrap_pre_and_post() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let data = h.os.map_app_pages(&[Prot::rw()]).as_usize();

    // foo(x): writes x to `data`, returns x.
    let foo = page;
    let mut asm = Assembler::at(&h.os, foo);
    asm.store(REG_ARG0, data);
    asm.movi(REG_RET, 0);
    asm.add(REG_RET, REG_ARG0);
    asm.ret();

    h.engine.wrap_function(
        foo,
        Some(Arc::new(|ctx: &mut PreContext| {
            // The application passed 37; the wrap rewrites it.
            assert_eq!(ctx.get_arg(0), 37);
            ctx.set_arg(0, 42);
        })),
        Some(Arc::new(|ctx: &mut PostContext| {
            assert_eq!(ctx.get_retval(), Some(42));
            ctx.set_retval((-4i64) as usize);
        })),
        WrapFlags::default(),
        0,
    );

    tcx.mcontext.set_gpr(REG_ARG0, 37);
    assert_stopped(h.run(&mut tcx, foo));

    // foo executed with the rewritten argument; the caller sees the
    // rewritten return value.
    assert!(h
        .os
        .observables()
        .contains(&Observable::Store {
            addr: data,
            value: 42
        }));
    assert_eq!(tcx.mcontext.retval(), (-4i64) as usize);
    assert!(tcx.wrap_stack.is_empty());
}

#[test]
fn s3_skip_call() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let data = h.os.map_app_pages(&[Prot::rw()]).as_usize();

    let foo = page;
    let mut asm = Assembler::at(&h.os, foo);
    asm.movi(RegId(1), 99);
    asm.store(RegId(1), data);
    asm.ret();

    let post_calls = Arc::new(AtomicUsize::new(0));
    let post_calls2 = Arc::clone(&post_calls);
    h.engine.wrap_function(
        foo,
        Some(Arc::new(|ctx: &mut PreContext| {
            ctx.skip_call(7, 0);
        })),
        Some(Arc::new(move |_ctx: &mut PostContext| {
            post_calls2.fetch_add(1, Ordering::SeqCst);
        })),
        WrapFlags::default(),
        0,
    );

    tcx.mcontext.set_gpr(REG_ARG0, 1234);
    assert_stopped(h.run(&mut tcx, foo));

    // The body never ran, the caller got 7, and no post fired.
    assert_eq!(tcx.mcontext.retval(), 7);
    assert!(h.os.observables().is_empty());
    assert_eq!(post_calls.load(Ordering::SeqCst), 0);
    assert!(tcx.wrap_stack.is_empty());
}

#[test]
fn s4_abnormal_unwind() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let jump_site_sp = tcx.mcontext.sp();

    let long0 = page;
    let long1 = page + 0x100;
    let long2 = page + 0x200;
    let long3 = page + 0x300;
    let land = page + 0x400;
    let longdone = page + 0x500;

    let mut asm = Assembler::at(&h.os, long0);
    asm.call(long1);
    asm.ret();
    let mut asm = Assembler::at(&h.os, long1);
    asm.call(long2);
    asm.ret();
    let mut asm = Assembler::at(&h.os, long2);
    asm.call(long3);
    asm.ret();
    // long3 performs the nonlocal exit: restore the outer stack pointer
    // and jump to the landing site, bypassing three returns.
    let mut asm = Assembler::at(&h.os, long3);
    asm.movi(REG_SP, jump_site_sp);
    asm.jmp(land);
    let mut asm = Assembler::at(&h.os, land);
    asm.call(longdone);
    asm.ret();
    let mut asm = Assembler::at(&h.os, longdone);
    asm.movi(RegId(1), 7);
    asm.ret();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for (func, name) in [
        (long0, "long0"),
        (long1, "long1"),
        (long2, "long2"),
        (long3, "long3"),
        (longdone, "longdone"),
    ]
    .iter()
    {
        let name_pre = name.to_string();
        let name_post = name.to_string();
        let log_pre = Arc::clone(&log);
        let log_post = Arc::clone(&log);
        h.engine.wrap_function(
            *func,
            Some(Arc::new(move |_ctx: &mut PreContext| {
                log_pre.lock().unwrap().push(format!("pre-{}", name_pre));
            })),
            Some(Arc::new(move |ctx: &mut PostContext| {
                let suffix = if ctx.is_abnormal() { "!ab" } else { "" };
                log_post
                    .lock()
                    .unwrap()
                    .push(format!("post-{}{}", name_post, suffix));
            })),
            WrapFlags::default(),
            0,
        );
    }

    assert_stopped(h.run(&mut tcx, long0));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "pre-long0",
            "pre-long1",
            "pre-long2",
            "pre-long3",
            "post-long3!ab",
            "post-long2!ab",
            "post-long1!ab",
            "pre-longdone",
            "post-longdone",
            "post-long0",
        ]
    );
    // Every pre was paired with exactly one post; nothing is left.
    assert!(tcx.wrap_stack.is_empty());
}

#[test]
fn s5_flush_safety() {
    let h = Harness::new();
    let page = h.os.map_app_page();
    let entry = page;
    let l = page + 0x100;
    let m = page + 0x200;

    let mut asm = Assembler::at(&h.os, entry);
    asm.movi(RegId(2), 4000);
    asm.movi(RegId(3), usize::MAX); // -1
    asm.jmp(l);
    let mut asm = Assembler::at(&h.os, l);
    asm.add(RegId(2), RegId(3));
    asm.jnz(RegId(2), m);
    asm.ret();
    let mut asm = Assembler::at(&h.os, m);
    asm.jmp(l);

    let engine = Arc::clone(&h.engine);
    let os = Arc::clone(&h.os);
    let worker = std::thread::spawn(move || {
        let mut tcx = engine.attach_thread().unwrap();
        let sp = os.map_app_stack() - 8;
        os.poke_app(AppPc::new(sp), &STOP.to_le_bytes());
        tcx.mcontext.set_sp(sp);
        let exit = engine.run_thread(&mut tcx, entry, AppPc::new(STOP));
        let remaining = tcx.mcontext.gpr(RegId(2));
        engine.detach_thread(&mut tcx);
        (exit, remaining)
    });

    // Wait until the loop block is resident, then flush it out from
    // under the running thread.
    let victim = loop {
        if let Some(id) = h.engine.shared_table.lookup(l) {
            break id;
        }
        std::thread::yield_now();
    };
    h.engine.flush_tag(h.os.current_tid(), l);
    // By the time flush returns the observed fragment is no longer the
    // one reachable under the tag (it is gone, or the worker has since
    // rebuilt a fresh one under a new identity).
    assert_ne!(h.engine.shared_table.lookup(l), Some(victim));

    let (exit, remaining) = worker.join().unwrap();
    assert_stopped(exit);
    assert_eq!(remaining, 0);
}

#[test]
fn s6_indirect_branch_lookup() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();

    let site = page; // jmp *r5
    let t1 = page + 0x100;
    let t2 = page + 0x200;
    let mut asm = Assembler::at(&h.os, site);
    asm.jmpr(RegId(5));
    let mut asm = Assembler::at(&h.os, t1);
    asm.movi(REG_RET, 11);
    asm.ret();
    let mut asm = Assembler::at(&h.os, t2);
    asm.movi(REG_RET, 22);
    asm.ret();

    // First execution of each target goes through dispatch and fills
    // the lookup table.
    tcx.mcontext.set_gpr(RegId(5), t1.as_usize());
    assert_stopped(h.run(&mut tcx, site));
    assert_eq!(tcx.mcontext.retval(), 11);
    let t1_frag = h.engine.slab.get(h.engine.shared_table.lookup(t1).unwrap()).unwrap();
    assert_eq!(h.engine.shared_ibl.probe(t1), Some(t1_frag.entry));

    h.rearm_stack(&mut tcx);
    tcx.mcontext.set_gpr(RegId(5), t2.as_usize());
    assert_stopped(h.run(&mut tcx, site));
    assert_eq!(tcx.mcontext.retval(), 22);
    let t2_frag = h.engine.slab.get(h.engine.shared_table.lookup(t2).unwrap()).unwrap();
    assert_eq!(h.engine.shared_ibl.probe(t2), Some(t2_frag.entry));

    // Subsequent executions resolve in-cache off the filled table.
    h.rearm_stack(&mut tcx);
    tcx.mcontext.set_gpr(RegId(5), t1.as_usize());
    assert_stopped(h.run(&mut tcx, site));
    assert_eq!(tcx.mcontext.retval(), 11);
}

#[test]
fn hot_loop_forms_a_trace() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let entry = page;
    let l = page + 0x100;
    let m = page + 0x200;

    // 120 iterations: comfortably past the default trace threshold.
    let mut asm = Assembler::at(&h.os, entry);
    asm.movi(RegId(2), 120);
    asm.movi(RegId(3), usize::MAX);
    asm.jmp(l);
    let mut asm = Assembler::at(&h.os, l);
    asm.add(RegId(2), RegId(3));
    asm.jnz(RegId(2), m);
    asm.ret();
    let mut asm = Assembler::at(&h.os, m);
    asm.jmp(l);

    assert_stopped(h.run(&mut tcx, entry));
    assert_eq!(tcx.mcontext.gpr(RegId(2)), 0);

    // The loop head is shadowed by a trace covering both blocks.
    let head_frag = h
        .engine
        .slab
        .get(h.engine.shared_table.lookup(l).expect("head entry"))
        .expect("head fragment");
    assert!(head_frag.test_flag(FragmentFlags::IS_TRACE));
    assert!(h.engine.stats().trace_cache.fragments >= 1);
    assert!(!tcx.trace.is_recording());
}

#[test]
fn syscalls_are_performed_in_program_order() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let data = h.os.map_app_pages(&[Prot::rw()]).as_usize();
    h.os.set_syscall_return(7, 55);

    let mut asm = Assembler::at(&h.os, page);
    asm.movi(REG_RET, 7); // syscall number
    asm.movi(REG_ARG0, 123);
    asm.syscall();
    asm.store(REG_RET, data); // return value flows back
    asm.ret();

    assert_stopped(h.run(&mut tcx, page));
    assert_eq!(
        h.os.observables(),
        vec![
            Observable::Syscall {
                number: 7,
                args: vec![123, 0, 0, 0, 0, 0]
            },
            Observable::Store {
                addr: data,
                value: 55
            },
        ]
    );
}

#[test]
fn fall_through_into_unreadable_page_raises_exact_fault() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let base = h.os.map_app_pages(&[Prot::rwx(), Prot::empty()]);
    let bad_page = (base + PAGE_SIZE).as_usize();

    // Two plain instructions ending flush against the unreadable page.
    let start = base + (PAGE_SIZE - 2 * INSTR_LEN);
    let mut asm = Assembler::at(&h.os, start);
    asm.movi(RegId(1), 1);
    asm.movi(RegId(2), 2);

    match h.run(&mut tcx, start) {
        DispatchExit::AppFault(record) => {
            assert_eq!(record.pc, bad_page);
            assert_eq!(
                record.fault,
                FaultKind::BadAccess {
                    addr: bad_page,
                    write: false
                }
            );
        }
        other => panic!("expected fault, got {:?}", other),
    }
    // The fault was surfaced to the application exactly once.
    let raised = h.os.raised_to_app.lock().unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].pc, bad_page);
    // The instructions before the boundary did execute.
    assert_eq!(tcx.mcontext.gpr(RegId(1)), 1);
    assert_eq!(tcx.mcontext.gpr(RegId(2)), 2);
}

#[test]
fn queued_signal_is_delivered_through_app_handler() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let data = h.os.map_app_pages(&[Prot::rw()]).as_usize();

    let resume = page; // movi r0,5; ret
    let handler = page + 0x100; // store r6 (signum) to data; ret
    let mut asm = Assembler::at(&h.os, resume);
    asm.movi(REG_RET, 5);
    asm.ret();
    let mut asm = Assembler::at(&h.os, handler);
    asm.store(REG_ARG0, data);
    asm.ret();

    h.engine.set_app_handler(libc::SIGUSR1, handler);
    let mut interrupted = tcx.mcontext;
    interrupted.set_pc(resume.as_usize());
    tcx.shared.queue_signal(PendingSignal {
        record: ExceptionRecord {
            fault: FaultKind::InvalidOpcode,
            pc: resume.as_usize(),
            tid: tcx.tid,
            signum: libc::SIGUSR1,
        },
        mc: interrupted,
    });

    assert_stopped(h.run(&mut tcx, resume));
    // Handler saw the signal number, then execution resumed at the
    // interrupted PC and finished normally.
    assert!(h.os.observables().contains(&Observable::Store {
        addr: data,
        value: libc::SIGUSR1 as u64
    }));
    assert_eq!(tcx.mcontext.retval(), 5);
}

#[test]
fn cache_fault_translates_to_application_pc() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let mut asm = Assembler::at(&h.os, page);
    asm.movi(RegId(1), 1);
    asm.movi(RegId(2), 2);
    asm.ret();
    assert_stopped(h.run(&mut tcx, page));

    let frag = h
        .engine
        .slab
        .get(h.engine.shared_table.lookup(page).unwrap())
        .unwrap();
    // An asynchronous-looking fault lands mid-fragment, after the first
    // copied instruction.
    let record = ExceptionRecord {
        fault: FaultKind::BadAccess {
            addr: 0x12,
            write: false,
        },
        pc: (frag.entry + INSTR_LEN).as_usize(),
        tid: tcx.tid,
        signum: libc::SIGSEGV,
    };
    let mut mc = Mcontext::default();
    mc.set_pc(record.pc);
    let consumed = h.os.deliver_exception(&record, &mut mc);
    assert!(consumed);
    // Translation rewrote the context to the application PC inside the
    // tag block, and the fault was surfaced against it.
    assert_eq!(mc.pc(), (page + INSTR_LEN).as_usize());
    let raised = h.os.raised_to_app.lock().unwrap();
    assert_eq!(raised.last().unwrap().pc, (page + INSTR_LEN).as_usize());
}

#[test]
fn wrap_then_unwrap_is_a_no_op() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let foo = page;
    let mut asm = Assembler::at(&h.os, foo);
    asm.movi(REG_RET, 31);
    asm.ret();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_pre = Arc::clone(&fired);
    let fired_post = Arc::clone(&fired);
    let id = h.engine.wrap_function(
        foo,
        Some(Arc::new(move |_: &mut PreContext| {
            fired_pre.fetch_add(1, Ordering::SeqCst);
        })),
        Some(Arc::new(move |_: &mut PostContext| {
            fired_post.fetch_add(1, Ordering::SeqCst);
        })),
        WrapFlags::default(),
        0,
    );
    h.engine.unwrap_function(foo, id).unwrap();

    assert_stopped(h.run(&mut tcx, foo));
    assert_eq!(tcx.mcontext.retval(), 31);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn replace_and_restore_round_trip() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let f = page;
    let g = page + 0x100;
    let mut asm = Assembler::at(&h.os, f);
    asm.movi(REG_RET, 11);
    asm.ret();
    let mut asm = Assembler::at(&h.os, g);
    asm.movi(REG_RET, 22);
    asm.ret();

    // Prime the original so replacement must invalidate it.
    assert_stopped(h.run(&mut tcx, f));
    assert_eq!(tcx.mcontext.retval(), 11);

    h.engine.replace_function(f, Some(g), false).unwrap();
    h.rearm_stack(&mut tcx);
    assert_stopped(h.run(&mut tcx, f));
    assert_eq!(tcx.mcontext.retval(), 22);

    h.engine.replace_function(f, None, true).unwrap();
    h.rearm_stack(&mut tcx);
    assert_stopped(h.run(&mut tcx, f));
    assert_eq!(tcx.mcontext.retval(), 11);
}

#[test]
fn validated_persisted_entry_marks_fragment_frozen() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let mut asm = Assembler::at(&h.os, page);
    asm.movi(REG_RET, 9);
    asm.ret();

    // Freeze the exact application bytes of this block and bind the
    // module at its live base.
    let mut code = vec![0u8; 2 * INSTR_LEN];
    h.os.read_app(page, &mut code).unwrap();
    let size = code.len() as u64;
    let module = PersistedModule {
        identity: ModuleIdentity {
            path: "libdemo.so".to_string(),
            digest: 0xfeed,
        },
        entries: vec![PersistEntry {
            app_offset: 0,
            cache_offset: 0,
            size,
        }],
        bytes: code,
        base: AppPc::null(),
    }
    .with_base(page);
    h.engine.bind_persisted_module(module);

    assert_stopped(h.run(&mut tcx, page));
    assert_eq!(tcx.mcontext.retval(), 9);
    let frag = h
        .engine
        .slab
        .get(h.engine.shared_table.lookup(page).unwrap())
        .unwrap();
    assert!(frag.test_flag(FragmentFlags::FROZEN));

    // A tag with no frozen entry stays unmarked.
    let other = page + 0x100;
    let mut asm = Assembler::at(&h.os, other);
    asm.movi(REG_RET, 10);
    asm.ret();
    h.rearm_stack(&mut tcx);
    assert_stopped(h.run(&mut tcx, other));
    let other_frag = h
        .engine
        .slab
        .get(h.engine.shared_table.lookup(other).unwrap())
        .unwrap();
    assert!(!other_frag.test_flag(FragmentFlags::FROZEN));
}

#[test]
fn linked_fragments_bypass_dispatch_but_stay_consistent() {
    let h = Harness::new();
    let mut tcx = h.thread_with_stack();
    let page = h.os.map_app_page();
    let a = page;
    let b = page + 0x100;
    let c = page + 0x200;
    let mut asm = Assembler::at(&h.os, a);
    asm.movi(RegId(1), 1);
    asm.jmp(b);
    let mut asm = Assembler::at(&h.os, b);
    asm.movi(RegId(2), 2);
    asm.jmp(c);
    let mut asm = Assembler::at(&h.os, c);
    asm.movi(REG_RET, 3);
    asm.ret();

    // First pass builds and chains the three blocks.
    assert_stopped(h.run(&mut tcx, a));
    assert_eq!(tcx.mcontext.retval(), 3);

    // Second pass runs the linked chain; results are identical.
    h.rearm_stack(&mut tcx);
    tcx.mcontext.set_gpr(RegId(1), 0);
    tcx.mcontext.set_gpr(RegId(2), 0);
    assert_stopped(h.run(&mut tcx, a));
    assert_eq!(tcx.mcontext.gpr(RegId(1)), 1);
    assert_eq!(tcx.mcontext.gpr(RegId(2)), 2);
    assert_eq!(tcx.mcontext.retval(), 3);
    assert_eq!(h.engine.shared_table.len(), 3);
}
