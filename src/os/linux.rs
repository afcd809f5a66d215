//! Linux implementation of the OS facade: anonymous mappings for cache
//! memory, `/proc/self/maps` for address-space queries, a signal-based
//! suspend handshake for forced thread stops, and `sigaction`-installed
//! interposition for faults.

use crate::app_pc::AppPc;
use crate::isa::FaultKind;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::mcontext::Mcontext;
use crate::os::{
    ExceptionRecord, ExceptionSink, MemKind, MemQuery, MemRegion, MemState, Os, OsError, Prot, Tid,
};
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Signal used for the forced-suspension handshake. Chosen for being
/// essentially unused by applications; a tracee that installs its own
/// handler for it loses forced suspension, which synchall reports and
/// skips.
const SUSPEND_SIG: Signal = Signal::SIGPWR;

const SUSPEND_WAIT: Duration = Duration::from_millis(200);

struct SuspendGate {
    parked: AtomicBool,
    saved: Mutex<Option<Mcontext>>,
    resume_with: Mutex<Option<Mcontext>>,
}

lazy_static! {
    static ref SUSPEND_GATES: Mutex<HashMap<Tid, Arc<SuspendGate>>> = Mutex::new(HashMap::new());
    static ref EXCEPTION_SINK: Mutex<Option<ExceptionSink>> = Mutex::new(None);
}

pub struct LinuxOs;

impl LinuxOs {
    pub fn new() -> Result<LinuxOs, OsError> {
        install_suspend_handler()?;
        Ok(LinuxOs)
    }
}

fn gettid() -> Tid {
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

fn tgkill(tid: Tid, sig: i32) -> Result<(), OsError> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(OsError::NoSuchThread(tid))
    }
}

fn to_mman_prot(prot: Prot) -> ProtFlags {
    let mut p = ProtFlags::PROT_NONE;
    if prot.contains(Prot::READ) {
        p |= ProtFlags::PROT_READ;
    }
    if prot.contains(Prot::WRITE) {
        p |= ProtFlags::PROT_WRITE;
    }
    if prot.contains(Prot::EXEC) {
        p |= ProtFlags::PROT_EXEC;
    }
    p
}

extern "C" fn suspend_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc_ptr: *mut libc::c_void,
) {
    let tid = gettid();
    let gate = match SUSPEND_GATES.lock().unwrap().get(&tid) {
        Some(g) => Arc::clone(g),
        None => return,
    };
    let uc = uc_ptr as *mut libc::ucontext_t;
    let mc = unsafe { mcontext_from_ucontext(&*uc) };
    *gate.saved.lock().unwrap() = Some(mc);
    while gate.parked.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    if let Some(new_mc) = gate.resume_with.lock().unwrap().take() {
        unsafe { apply_mcontext_to_ucontext(&new_mc, &mut *uc) };
    };
}

fn install_suspend_handler() -> Result<(), OsError> {
    let sa = SigAction::new(
        SigHandler::SigAction(suspend_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(SUSPEND_SIG, &sa) }
        .map(|_| ())
        .map_err(|_| OsError::NotSupported("sigaction for suspend signal"))
}

extern "C" fn exception_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc_ptr: *mut libc::c_void,
) {
    let sink = match EXCEPTION_SINK.lock().unwrap().clone() {
        Some(s) => s,
        None => return,
    };
    let uc = uc_ptr as *mut libc::ucontext_t;
    let mut mc = unsafe { mcontext_from_ucontext(&*uc) };
    let fault_addr = unsafe { (*info).si_addr() as usize };
    let fault = match sig {
        libc::SIGILL => FaultKind::InvalidOpcode,
        _ => FaultKind::BadAccess {
            addr: fault_addr,
            write: false,
        },
    };
    let record = ExceptionRecord {
        fault,
        pc: mc.pc(),
        tid: gettid(),
        signum: sig,
    };
    if sink(&record, &mut mc) {
        unsafe { apply_mcontext_to_ucontext(&mc, &mut *uc) };
        return;
    }
    // Unconsumed: fall back to default disposition so the kernel produces
    // the same termination the application would have seen natively.
    if let Ok(signal) = Signal::try_from(sig) {
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { sigaction(signal, &dfl) };
    }
    let _ = tgkill(gettid(), sig);
}

const INTERPOSED_SIGNALS: &[Signal] = &[
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGTRAP,
];

impl Os for LinuxOs {
    fn reserve(&self, size: usize, preferred: Option<usize>) -> Result<MemRegion, OsError> {
        let len = crate::os::page_align(size);
        let addr = preferred.unwrap_or(0) as *mut libc::c_void;
        let ptr = unsafe {
            mmap(
                addr,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                -1,
                0,
            )
        }
        .map_err(|_| OsError::OutOfMemory)?;
        log!(LogDebug, "reserved {:#x} bytes at {:p}", len, ptr);
        Ok(MemRegion {
            base: ptr as usize,
            len,
        })
    }

    fn commit(&self, region: MemRegion, prot: Prot) -> Result<(), OsError> {
        unsafe { mprotect(region.base as *mut libc::c_void, region.len, to_mman_prot(prot)) }
            .map_err(|e| OsError::Sys(e.as_errno().map(|e| e as i32).unwrap_or(0)))
    }

    fn protect(&self, region: MemRegion, prot: Prot) -> Result<(), OsError> {
        self.commit(region, prot)
    }

    fn free(&self, region: MemRegion) -> Result<(), OsError> {
        unsafe { munmap(region.base as *mut libc::c_void, region.len) }
            .map_err(|e| OsError::Sys(e.as_errno().map(|e| e as i32).unwrap_or(0)))
    }

    fn query(&self, addr: usize) -> Option<MemQuery> {
        let maps = fs::read_to_string("/proc/self/maps").ok()?;
        for line in maps.lines() {
            if let Some(q) = parse_maps_line(line) {
                if addr >= q.base && addr < q.base + q.size {
                    return Some(q);
                }
            }
        }
        None
    }

    fn map_file(&self, path: &Path, writable: bool) -> Result<MemRegion, OsError> {
        let file = fs::File::open(path).map_err(|_| OsError::PermissionDenied)?;
        let len = file
            .metadata()
            .map_err(|_| OsError::PermissionDenied)?
            .len() as usize;
        if len == 0 {
            return Err(OsError::BadAddress(0));
        }
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|_| OsError::OutOfMemory)?;
        Ok(MemRegion {
            base: ptr as usize,
            len,
        })
    }

    fn unmap_file(&self, region: MemRegion) -> Result<(), OsError> {
        self.free(region)
    }

    fn read_app(&self, pc: AppPc, buf: &mut [u8]) -> Result<usize, OsError> {
        // The engine shares the application's address space; a query-bounded
        // copy gives fault-free reads that stop at the first unreadable page.
        let mut done = 0;
        while done < buf.len() {
            let addr = pc.as_usize() + done;
            let q = match self.query(addr) {
                Some(q) if q.prot.contains(Prot::READ) => q,
                _ => break,
            };
            let readable_end = q.base + q.size;
            let n = std::cmp::min(buf.len() - done, readable_end - addr);
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, buf[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        if done == 0 {
            Err(OsError::BadAddress(pc.as_usize()))
        } else {
            Ok(done)
        }
    }

    fn write_app(&self, pc: AppPc, bytes: &[u8]) -> Result<(), OsError> {
        match self.query(pc.as_usize()) {
            Some(q) if q.prot.contains(Prot::WRITE) => {
                if pc.as_usize() + bytes.len() > q.base + q.size {
                    return Err(OsError::BadAddress(q.base + q.size));
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        pc.as_usize() as *mut u8,
                        bytes.len(),
                    );
                }
                Ok(())
            }
            _ => Err(OsError::BadAddress(pc.as_usize())),
        }
    }

    fn perform_syscall(&self, number: usize, args: &[usize; 6]) -> usize {
        unsafe {
            libc::syscall(
                number as libc::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            ) as usize
        }
    }

    fn current_tid(&self) -> Tid {
        gettid()
    }

    fn suspend_thread(&self, tid: Tid) -> Result<(), OsError> {
        let gate = Arc::new(SuspendGate {
            parked: AtomicBool::new(true),
            saved: Mutex::new(None),
            resume_with: Mutex::new(None),
        });
        SUSPEND_GATES.lock().unwrap().insert(tid, Arc::clone(&gate));
        tgkill(tid, SUSPEND_SIG as i32)?;
        let deadline = Instant::now() + SUSPEND_WAIT;
        while gate.saved.lock().unwrap().is_none() {
            if Instant::now() > deadline {
                SUSPEND_GATES.lock().unwrap().remove(&tid);
                log!(LogWarn, "suspend handshake timed out for tid {}", tid);
                return Err(OsError::NoSuchThread(tid));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    fn resume_thread(&self, tid: Tid) -> Result<(), OsError> {
        let gate = SUSPEND_GATES
            .lock()
            .unwrap()
            .remove(&tid)
            .ok_or(OsError::NoSuchThread(tid))?;
        gate.parked.store(false, Ordering::Release);
        Ok(())
    }

    fn get_thread_context(&self, tid: Tid) -> Result<Mcontext, OsError> {
        let gates = SUSPEND_GATES.lock().unwrap();
        let gate = gates.get(&tid).ok_or(OsError::NoSuchThread(tid))?;
        let saved = *gate.saved.lock().unwrap();
        saved.ok_or(OsError::NoSuchThread(tid))
    }

    fn set_thread_context(&self, tid: Tid, mc: &Mcontext) -> Result<(), OsError> {
        let gates = SUSPEND_GATES.lock().unwrap();
        let gate = gates.get(&tid).ok_or(OsError::NoSuchThread(tid))?;
        *gate.resume_with.lock().unwrap() = Some(*mc);
        Ok(())
    }

    fn install_exception_handler(&self, sink: ExceptionSink) -> Result<(), OsError> {
        *EXCEPTION_SINK.lock().unwrap() = Some(sink);
        let sa = SigAction::new(
            SigHandler::SigAction(exception_handler),
            SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );
        for &sig in INTERPOSED_SIGNALS {
            unsafe { sigaction(sig, &sa) }
                .map_err(|_| OsError::NotSupported("sigaction for fault interposition"))?;
        }
        Ok(())
    }

    fn raise_exception_to_app(
        &self,
        record: &ExceptionRecord,
        _mc: &Mcontext,
    ) -> Result<(), OsError> {
        // Restore default disposition for the signal, then re-raise it on
        // this thread. The translated context has already been written back
        // by the interposer, so the kernel-visible state is the application
        // state.
        if let Ok(signal) = Signal::try_from(record.signum) {
            let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            let _ = unsafe { sigaction(signal, &dfl) };
        }
        tgkill(record.tid, record.signum)
    }
}

fn parse_prot(perms: &str) -> Prot {
    let mut prot = Prot::empty();
    let bytes = perms.as_bytes();
    if bytes.get(0) == Some(&b'r') {
        prot |= Prot::READ;
    }
    if bytes.get(1) == Some(&b'w') {
        prot |= Prot::WRITE;
    }
    if bytes.get(2) == Some(&b'x') {
        prot |= Prot::EXEC;
    }
    prot
}

/// Parse one `/proc/self/maps` line:
/// `start-end perms offset dev inode [path]`.
fn parse_maps_line(line: &str) -> Option<MemQuery> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next();

    let dash = range.find('-')?;
    let base = usize::from_str_radix(&range[..dash], 16).ok()?;
    let end = usize::from_str_radix(&range[dash + 1..], 16).ok()?;
    let kind = match path {
        Some(p) if p.starts_with('/') => {
            if p.ends_with(".so") || p.contains(".so.") {
                MemKind::Image
            } else {
                MemKind::File
            }
        }
        _ => MemKind::Private,
    };
    Some(MemQuery {
        base,
        size: end - base,
        prot: parse_prot(perms),
        state: MemState::Committed,
        kind,
    })
}

#[cfg(target_arch = "x86_64")]
mod regs {
    use crate::mcontext::{Mcontext, RegId, NUM_GPRS};

    /// Bijection from the engine's dense register space onto x86-64 GPRs,
    /// chosen so that the fixed roles line up with the SysV ABI:
    /// r0 = rax (return value), r4 = rsp, r6..r11 = rdi, rsi, rdx, rcx,
    /// r8, r9 (the six argument registers).
    const GREG_MAP: [i32; NUM_GPRS] = [
        libc::REG_RAX,
        libc::REG_RBX,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_RSP,
        libc::REG_RBP,
        libc::REG_RDI,
        libc::REG_RSI,
        libc::REG_RDX,
        libc::REG_RCX,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R14,
        libc::REG_R15,
    ];

    pub unsafe fn mcontext_from_ucontext(uc: &libc::ucontext_t) -> Mcontext {
        let mut mc = Mcontext::default();
        for (i, &greg) in GREG_MAP.iter().enumerate() {
            mc.set_gpr(RegId(i as u8), uc.uc_mcontext.gregs[greg as usize] as usize);
        }
        mc.set_pc(uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize);
        mc.set_flags(uc.uc_mcontext.gregs[libc::REG_EFL as usize] as usize);
        mc
    }

    pub unsafe fn apply_mcontext_to_ucontext(mc: &Mcontext, uc: &mut libc::ucontext_t) {
        for (i, &greg) in GREG_MAP.iter().enumerate() {
            uc.uc_mcontext.gregs[greg as usize] = mc.gpr(RegId(i as u8)) as i64;
        }
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = mc.pc() as i64;
        uc.uc_mcontext.gregs[libc::REG_EFL as usize] = mc.flags() as i64;
    }
}

#[cfg(target_arch = "x86_64")]
use regs::{apply_mcontext_to_ucontext, mcontext_from_ucontext};

#[cfg(not(target_arch = "x86_64"))]
unsafe fn mcontext_from_ucontext(_uc: &libc::ucontext_t) -> Mcontext {
    Mcontext::default()
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn apply_mcontext_to_ucontext(_mc: &Mcontext, _uc: &mut libc::ucontext_t) {}
