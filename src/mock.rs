//! Test doubles: an in-memory OS facade, a deterministic fixed-width ISA
//! with a decoder/encoder pair, and a tiny assembler for building test
//! programs. Everything hands out real process addresses (backed by
//! leaked buffers) so cache installation, word patching, and the
//! simulated executor all work exactly as they would against the real
//! facade.

use crate::app_pc::AppPc;
use crate::isa::{
    CodeBuffer, DecodeError, EncodeError, ExitStubSite, FaultKind, IblChoice, Instr, InstrDecoder,
    InstrEncoder, InstrKind, PatchSite,
};
use crate::mcontext::{Mcontext, RegId};
use crate::os::{
    ExceptionRecord, ExceptionSink, MemKind, MemQuery, MemRegion, MemState, Os, OsError, Prot, Tid,
    PAGE_SIZE,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Test ISA: fixed 16-byte records.
//
//   byte 0      opcode
//   byte 1      register a
//   byte 2      register b
//   byte 3      unused
//   bytes 4-7   imm32 (little endian)
//   bytes 8-15  operand word (8-aligned when the record is; patchable)
// ---------------------------------------------------------------------------

pub const INSTR_LEN: usize = 16;
pub const OPERAND_OFFSET: usize = 8;

// Application opcodes.
pub const OP_MOVI: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_LOAD: u8 = 0x03;
pub const OP_STORE: u8 = 0x04;
pub const OP_LEA: u8 = 0x07;
pub const OP_JMP: u8 = 0x10;
pub const OP_JNZ: u8 = 0x11;
pub const OP_CALL: u8 = 0x12;
pub const OP_JMPR: u8 = 0x13;
pub const OP_RET: u8 = 0x14;
pub const OP_SYSCALL: u8 = 0x20;

// Synthesized opcodes, only ever emitted by the encoder into the cache.
pub const OP_SBRANCH: u8 = 0x80;
pub const OP_SCBRANCH: u8 = 0x81;
pub const OP_SPUSHC: u8 = 0x82;
pub const OP_SPOPR: u8 = 0x83;
pub const OP_SIBL: u8 = 0x84;
pub const OP_SSPILL: u8 = 0x85;
pub const OP_SMOVR: u8 = 0x86;
pub const OP_SSTUB: u8 = 0x87;
pub const OP_SSYSGATE: u8 = 0x88;
pub const OP_SFAULT: u8 = 0x89;

pub const FAULT_CODE_INVALID: u32 = 1;
pub const FAULT_CODE_BAD_ACCESS: u32 = 2;

pub fn record(op: u8, ra: u8, rb: u8, imm: u32, operand: u64) -> [u8; INSTR_LEN] {
    let mut r = [0u8; INSTR_LEN];
    r[0] = op;
    r[1] = ra;
    r[2] = rb;
    r[4..8].copy_from_slice(&imm.to_le_bytes());
    r[8..16].copy_from_slice(&operand.to_le_bytes());
    r
}

pub fn record_op(bytes: &[u8]) -> u8 {
    bytes[0]
}

pub fn record_ra(bytes: &[u8]) -> RegId {
    RegId(bytes[1])
}

pub fn record_rb(bytes: &[u8]) -> RegId {
    RegId(bytes[2])
}

pub fn record_imm(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
}

pub fn record_operand(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ])
}

pub struct TestIsa;

impl InstrDecoder for TestIsa {
    fn decode(&self, pc: AppPc, bytes: &[u8]) -> Result<Instr, DecodeError> {
        if bytes.len() < INSTR_LEN {
            return Err(DecodeError::Unreadable(pc));
        }
        let raw = bytes[..INSTR_LEN].to_vec();
        let operand = record_operand(&raw) as usize;
        let kind = match record_op(&raw) {
            OP_MOVI | OP_ADD | OP_LOAD | OP_STORE => InstrKind::Normal,
            OP_LEA => InstrKind::Normal,
            OP_JMP => InstrKind::DirectJump {
                target: AppPc::new(operand),
            },
            OP_JNZ => InstrKind::CondJump {
                taken: AppPc::new(operand),
            },
            OP_CALL => InstrKind::Call {
                target: AppPc::new(operand),
            },
            OP_JMPR => InstrKind::IndirectJump {
                reg: record_ra(&raw),
            },
            OP_RET => InstrKind::Return,
            OP_SYSCALL => InstrKind::Syscall,
            _ => return Err(DecodeError::Invalid(pc)),
        };
        let pc_relative = record_op(&raw) == OP_LEA;
        Ok(Instr {
            kind,
            len: INSTR_LEN as u8,
            raw,
            pc_relative,
        })
    }

    fn max_instr_len(&self) -> usize {
        INSTR_LEN
    }
}

impl InstrEncoder for TestIsa {
    fn encode_app_instr(
        &self,
        instr: &Instr,
        orig_pc: AppPc,
        buf: &mut CodeBuffer,
    ) -> Result<(), EncodeError> {
        if instr.raw.len() != INSTR_LEN {
            return Err(EncodeError::Unrepresentable);
        }
        if instr.pc_relative {
            // LEA ra, [pc + imm] is rewritten to an absolute MOVI.
            let ra = record_ra(&instr.raw).0;
            let imm = record_imm(&instr.raw);
            let absolute = orig_pc.as_usize().wrapping_add(imm as usize);
            buf.put_bytes(&record(OP_MOVI, ra, 0, 0, absolute as u64));
        } else {
            buf.put_bytes(&instr.raw);
        }
        Ok(())
    }

    fn emit_branch(&self, buf: &mut CodeBuffer, initial_target: usize) -> PatchSite {
        let offset = buf.len() + OPERAND_OFFSET;
        buf.put_bytes(&record(OP_SBRANCH, 0, 0, 0, initial_target as u64));
        PatchSite { offset }
    }

    fn emit_cond_branch(
        &self,
        buf: &mut CodeBuffer,
        cond_source: &Instr,
        initial_target: usize,
    ) -> Result<PatchSite, EncodeError> {
        if record_op(&cond_source.raw) != OP_JNZ {
            return Err(EncodeError::Unrepresentable);
        }
        let ra = record_ra(&cond_source.raw).0;
        let offset = buf.len() + OPERAND_OFFSET;
        buf.put_bytes(&record(OP_SCBRANCH, ra, 0, 0, initial_target as u64));
        Ok(PatchSite { offset })
    }

    fn emit_push_const(&self, buf: &mut CodeBuffer, value: usize) {
        buf.put_bytes(&record(OP_SPUSHC, 0, 0, 0, value as u64));
    }

    fn emit_pop_reg(&self, buf: &mut CodeBuffer, reg: RegId) {
        buf.put_bytes(&record(OP_SPOPR, reg.0, 0, 0, 0));
    }

    fn emit_spill(&self, buf: &mut CodeBuffer, reg: RegId, slot: u8) {
        buf.put_bytes(&record(OP_SSPILL, reg.0, 0, slot as u32, 0));
    }

    fn emit_move_reg(&self, buf: &mut CodeBuffer, dst: RegId, src: RegId) {
        buf.put_bytes(&record(OP_SMOVR, dst.0, src.0, 0, 0));
    }

    fn emit_ibl_probe(&self, buf: &mut CodeBuffer, reg: RegId, table: IblChoice) {
        let which = match table {
            IblChoice::Private => 0,
            IblChoice::Shared => 1,
        };
        buf.put_bytes(&record(OP_SIBL, reg.0, 0, which, 0));
    }

    fn emit_exit_stub(&self, buf: &mut CodeBuffer, exit_index: u32) -> ExitStubSite {
        let stub_offset = buf.len();
        let id_patch = PatchSite {
            offset: stub_offset + OPERAND_OFFSET,
        };
        buf.put_bytes(&record(OP_SSTUB, 0, 0, exit_index, 0));
        ExitStubSite {
            stub_offset,
            id_patch,
        }
    }

    fn emit_syscall_gate(&self, buf: &mut CodeBuffer, exit_index: u32) -> ExitStubSite {
        let stub_offset = buf.len();
        let id_patch = PatchSite {
            offset: stub_offset + OPERAND_OFFSET,
        };
        buf.put_bytes(&record(OP_SSYSGATE, 0, 0, exit_index, 0));
        ExitStubSite {
            stub_offset,
            id_patch,
        }
    }

    fn emit_raise_fault(&self, buf: &mut CodeBuffer, kind: FaultKind, at: AppPc) {
        let (code, addr) = match kind {
            FaultKind::InvalidOpcode => (FAULT_CODE_INVALID, at.as_usize()),
            FaultKind::BadAccess { addr, .. } => (FAULT_CODE_BAD_ACCESS, addr),
        };
        buf.put_bytes(&record(OP_SFAULT, 0, 0, code, addr as u64));
    }

    fn word_size(&self) -> usize {
        8
    }
}

// ---------------------------------------------------------------------------
// MockOs
// ---------------------------------------------------------------------------

struct MockAlloc {
    // Keep the backing storage alive for the whole test: freed regions are
    // quarantined, not returned, so a stale read hits stable bytes rather
    // than unmapped memory.
    _backing: Box<[u8]>,
    region: MemRegion,
    prot: Prot,
    freed: bool,
}

struct AppPage {
    base: usize,
    prot: Prot,
}

#[derive(Default)]
struct MockThreadSlot {
    suspended: bool,
    context: Mcontext,
}

/// One recorded observable effect: application stores and system calls,
/// in program order. Tests compare these against native expectations.
#[derive(Clone, Debug, PartialEq)]
pub enum Observable {
    Store { addr: usize, value: u64 },
    Syscall { number: usize, args: Vec<usize> },
}

pub struct MockOs {
    allocs: Mutex<Vec<MockAlloc>>,
    app_pages: Mutex<Vec<AppPage>>,
    app_backing: Mutex<Vec<Box<[u8]>>>,
    threads: Mutex<HashMap<Tid, MockThreadSlot>>,
    sink: Mutex<Option<ExceptionSink>>,
    pub observables: Mutex<Vec<Observable>>,
    pub raised_to_app: Mutex<Vec<ExceptionRecord>>,
    syscall_return: Mutex<HashMap<usize, usize>>,
}

static NEXT_TID: AtomicI32 = AtomicI32::new(100);

thread_local! {
    static MOCK_TID: Tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

impl MockOs {
    pub fn new() -> MockOs {
        MockOs {
            allocs: Mutex::new(Vec::new()),
            app_pages: Mutex::new(Vec::new()),
            app_backing: Mutex::new(Vec::new()),
            threads: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            observables: Mutex::new(Vec::new()),
            raised_to_app: Mutex::new(Vec::new()),
            syscall_return: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<MockOs> {
        Arc::new(MockOs::new())
    }

    fn alloc_aligned(len: usize) -> (Box<[u8]>, usize) {
        let padded = len + PAGE_SIZE;
        let backing = vec![0u8; padded].into_boxed_slice();
        let raw = backing.as_ptr() as usize;
        let base = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        (backing, base)
    }

    /// Map `prots.len()` contiguous application pages, one protection per
    /// page, and return the address of the first.
    pub fn map_app_pages(&self, prots: &[Prot]) -> AppPc {
        let len = prots.len() * PAGE_SIZE;
        let (backing, base) = Self::alloc_aligned(len);
        self.app_backing.lock().unwrap().push(backing);
        let mut pages = self.app_pages.lock().unwrap();
        for (i, &prot) in prots.iter().enumerate() {
            pages.push(AppPage {
                base: base + i * PAGE_SIZE,
                prot,
            });
        }
        AppPc::new(base)
    }

    /// One RWX application page: enough for most test programs.
    pub fn map_app_page(&self) -> AppPc {
        self.map_app_pages(&[Prot::rwx()])
    }

    /// A writable page used as an application stack; returns an initial
    /// stack pointer near its top.
    pub fn map_app_stack(&self) -> usize {
        let base = self.map_app_pages(&[Prot::rw()]);
        base.as_usize() + PAGE_SIZE - 64
    }

    pub fn set_page_prot(&self, addr: usize, prot: Prot) {
        let mut pages = self.app_pages.lock().unwrap();
        if let Some(p) = pages
            .iter_mut()
            .find(|p| addr >= p.base && addr < p.base + PAGE_SIZE)
        {
            p.prot = prot;
        }
    }

    /// Test-setup write that ignores page protections.
    pub fn poke_app(&self, pc: AppPc, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), pc.as_usize() as *mut u8, bytes.len());
        }
    }

    pub fn peek_app_word(&self, addr: usize) -> u64 {
        let mut buf = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(buf)
    }

    fn page_of(&self, addr: usize) -> Option<Prot> {
        let pages = self.app_pages.lock().unwrap();
        pages
            .iter()
            .find(|p| addr >= p.base && addr < p.base + PAGE_SIZE)
            .map(|p| p.prot)
    }

    pub fn record_observable(&self, obs: Observable) {
        self.observables.lock().unwrap().push(obs);
    }

    pub fn observables(&self) -> Vec<Observable> {
        self.observables.lock().unwrap().clone()
    }

    pub fn set_syscall_return(&self, number: usize, ret: usize) {
        self.syscall_return.lock().unwrap().insert(number, ret);
    }

    /// Register a fake peer thread with a known context, for forced
    /// suspension tests.
    pub fn register_mock_thread(&self, tid: Tid, context: Mcontext) {
        self.threads.lock().unwrap().insert(
            tid,
            MockThreadSlot {
                suspended: false,
                context,
            },
        );
    }

    pub fn thread_context_now(&self, tid: Tid) -> Option<Mcontext> {
        self.threads.lock().unwrap().get(&tid).map(|t| t.context)
    }

    /// Feed an exception into the installed sink, as the kernel would.
    /// Returns the possibly rewritten context and whether the sink
    /// consumed the event.
    pub fn deliver_exception(&self, record: &ExceptionRecord, mc: &mut Mcontext) -> bool {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => sink(record, mc),
            None => false,
        }
    }
}

impl Default for MockOs {
    fn default() -> MockOs {
        MockOs::new()
    }
}

impl Os for MockOs {
    fn reserve(&self, size: usize, _preferred: Option<usize>) -> Result<MemRegion, OsError> {
        let len = crate::os::page_align(size.max(1));
        let (backing, base) = Self::alloc_aligned(len);
        let region = MemRegion { base, len };
        self.allocs.lock().unwrap().push(MockAlloc {
            _backing: backing,
            region,
            prot: Prot::empty(),
            freed: false,
        });
        Ok(region)
    }

    fn commit(&self, region: MemRegion, prot: Prot) -> Result<(), OsError> {
        let mut allocs = self.allocs.lock().unwrap();
        for a in allocs.iter_mut() {
            if !a.freed && a.region.contains(region.base) {
                a.prot = prot;
                return Ok(());
            }
        }
        Err(OsError::BadAddress(region.base))
    }

    fn protect(&self, region: MemRegion, prot: Prot) -> Result<(), OsError> {
        self.commit(region, prot)
    }

    fn free(&self, region: MemRegion) -> Result<(), OsError> {
        let mut allocs = self.allocs.lock().unwrap();
        for a in allocs.iter_mut() {
            if a.region == region && !a.freed {
                a.freed = true;
                return Ok(());
            }
        }
        Err(OsError::BadAddress(region.base))
    }

    fn query(&self, addr: usize) -> Option<MemQuery> {
        if let Some(prot) = self.page_of(addr) {
            return Some(MemQuery {
                base: crate::os::page_base(addr),
                size: PAGE_SIZE,
                prot,
                state: MemState::Committed,
                kind: MemKind::Private,
            });
        }
        let allocs = self.allocs.lock().unwrap();
        allocs
            .iter()
            .find(|a| !a.freed && a.region.contains(addr))
            .map(|a| MemQuery {
                base: a.region.base,
                size: a.region.len,
                prot: a.prot,
                state: MemState::Committed,
                kind: MemKind::Private,
            })
    }

    fn map_file(&self, _path: &Path, _writable: bool) -> Result<MemRegion, OsError> {
        Err(OsError::NotSupported("map_file in mock"))
    }

    fn unmap_file(&self, region: MemRegion) -> Result<(), OsError> {
        self.free(region)
    }

    fn read_app(&self, pc: AppPc, buf: &mut [u8]) -> Result<usize, OsError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = pc.as_usize() + done;
            match self.page_of(addr) {
                Some(prot) if prot.contains(Prot::READ) => {
                    let page_end = crate::os::page_base(addr) + PAGE_SIZE;
                    let n = std::cmp::min(buf.len() - done, page_end - addr);
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            addr as *const u8,
                            buf[done..].as_mut_ptr(),
                            n,
                        );
                    }
                    done += n;
                }
                _ => break,
            }
        }
        if done == 0 {
            Err(OsError::BadAddress(pc.as_usize()))
        } else {
            Ok(done)
        }
    }

    fn write_app(&self, pc: AppPc, bytes: &[u8]) -> Result<(), OsError> {
        match self.page_of(pc.as_usize()) {
            Some(prot) if prot.contains(Prot::WRITE) => {
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
        self.record_observable(Observable::Syscall {
            number,
            args: args.to_vec(),
        });
        self.syscall_return
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or(0)
    }

    fn current_tid(&self) -> Tid {
        MOCK_TID.with(|t| *t)
    }

    fn suspend_thread(&self, tid: Tid) -> Result<(), OsError> {
        let mut threads = self.threads.lock().unwrap();
        match threads.get_mut(&tid) {
            Some(t) => {
                t.suspended = true;
                Ok(())
            }
            None => Err(OsError::NoSuchThread(tid)),
        }
    }

    fn resume_thread(&self, tid: Tid) -> Result<(), OsError> {
        let mut threads = self.threads.lock().unwrap();
        match threads.get_mut(&tid) {
            Some(t) => {
                t.suspended = false;
                Ok(())
            }
            None => Err(OsError::NoSuchThread(tid)),
        }
    }

    fn get_thread_context(&self, tid: Tid) -> Result<Mcontext, OsError> {
        let threads = self.threads.lock().unwrap();
        threads
            .get(&tid)
            .filter(|t| t.suspended)
            .map(|t| t.context)
            .ok_or(OsError::NoSuchThread(tid))
    }

    fn set_thread_context(&self, tid: Tid, mc: &Mcontext) -> Result<(), OsError> {
        let mut threads = self.threads.lock().unwrap();
        match threads.get_mut(&tid) {
            Some(t) if t.suspended => {
                t.context = *mc;
                Ok(())
            }
            _ => Err(OsError::NoSuchThread(tid)),
        }
    }

    fn install_exception_handler(&self, sink: ExceptionSink) -> Result<(), OsError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn raise_exception_to_app(
        &self,
        record: &ExceptionRecord,
        _mc: &Mcontext,
    ) -> Result<(), OsError> {
        self.raised_to_app.lock().unwrap().push(*record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Writes test-ISA records into mock application memory sequentially.
pub struct Assembler<'a> {
    os: &'a MockOs,
    cursor: AppPc,
}

impl<'a> Assembler<'a> {
    pub fn at(os: &'a MockOs, pc: AppPc) -> Assembler<'a> {
        Assembler { os, cursor: pc }
    }

    pub fn here(&self) -> AppPc {
        self.cursor
    }

    fn emit(&mut self, rec: [u8; INSTR_LEN]) -> AppPc {
        let at = self.cursor;
        self.os.poke_app(at, &rec);
        self.cursor = at + INSTR_LEN;
        at
    }

    pub fn movi(&mut self, reg: RegId, value: usize) -> AppPc {
        self.emit(record(OP_MOVI, reg.0, 0, 0, value as u64))
    }

    pub fn add(&mut self, dst: RegId, src: RegId) -> AppPc {
        self.emit(record(OP_ADD, dst.0, src.0, 0, 0))
    }

    pub fn load(&mut self, reg: RegId, addr: usize) -> AppPc {
        self.emit(record(OP_LOAD, reg.0, 0, 0, addr as u64))
    }

    pub fn store(&mut self, reg: RegId, addr: usize) -> AppPc {
        self.emit(record(OP_STORE, reg.0, 0, 0, addr as u64))
    }

    pub fn lea(&mut self, reg: RegId, displacement: u32) -> AppPc {
        self.emit(record(OP_LEA, reg.0, 0, displacement, 0))
    }

    pub fn jmp(&mut self, target: AppPc) -> AppPc {
        self.emit(record(OP_JMP, 0, 0, 0, target.as_usize() as u64))
    }

    pub fn jnz(&mut self, reg: RegId, taken: AppPc) -> AppPc {
        self.emit(record(OP_JNZ, reg.0, 0, 0, taken.as_usize() as u64))
    }

    pub fn call(&mut self, target: AppPc) -> AppPc {
        self.emit(record(OP_CALL, 0, 0, 0, target.as_usize() as u64))
    }

    pub fn jmpr(&mut self, reg: RegId) -> AppPc {
        self.emit(record(OP_JMPR, reg.0, 0, 0, 0))
    }

    pub fn ret(&mut self) -> AppPc {
        self.emit(record(OP_RET, 0, 0, 0, 0))
    }

    pub fn syscall(&mut self) -> AppPc {
        self.emit(record(OP_SYSCALL, 0, 0, 0, 0))
    }

    pub fn invalid(&mut self) -> AppPc {
        self.emit(record(0xff, 0, 0, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcontext::RegId;

    #[test]
    fn decode_app_instrs() {
        let isa = TestIsa;
        let mov = record(OP_MOVI, 3, 0, 0, 42);
        let i = isa.decode(AppPc::new(0x1000), &mov).unwrap();
        assert_eq!(i.kind, InstrKind::Normal);
        assert_eq!(i.len as usize, INSTR_LEN);

        let jmp = record(OP_JMP, 0, 0, 0, 0x2000);
        let i = isa.decode(AppPc::new(0x1000), &jmp).unwrap();
        assert_eq!(
            i.kind,
            InstrKind::DirectJump {
                target: AppPc::new(0x2000)
            }
        );

        let bad = record(0xee, 0, 0, 0, 0);
        assert_eq!(
            isa.decode(AppPc::new(0x1000), &bad),
            Err(DecodeError::Invalid(AppPc::new(0x1000)))
        );
        assert_eq!(
            isa.decode(AppPc::new(0x1000), &bad[..8]),
            Err(DecodeError::Unreadable(AppPc::new(0x1000)))
        );
    }

    #[test]
    fn lea_rewritten_absolute() {
        let isa = TestIsa;
        let lea = isa
            .decode(AppPc::new(0x5000), &record(OP_LEA, 2, 0, 0x40, 0))
            .unwrap();
        assert!(lea.pc_relative);
        let mut buf = CodeBuffer::new();
        isa.encode_app_instr(&lea, AppPc::new(0x5000), &mut buf)
            .unwrap();
        let emitted = buf.bytes();
        assert_eq!(record_op(emitted), OP_MOVI);
        assert_eq!(record_operand(emitted), 0x5040);
    }

    #[test]
    fn branch_patch_site_points_at_operand() {
        let isa = TestIsa;
        let mut buf = CodeBuffer::new();
        buf.put_bytes(&record(OP_MOVI, 0, 0, 0, 0));
        let site = isa.emit_branch(&mut buf, 0xdead);
        assert_eq!(site.offset, INSTR_LEN + OPERAND_OFFSET);
        assert_eq!(record_operand(&buf.bytes()[INSTR_LEN..]), 0xdead);
    }

    #[test]
    fn mock_read_stops_at_unreadable_page() {
        let os = MockOs::new();
        let base = os.map_app_pages(&[Prot::rwx(), Prot::empty()]);
        let mut buf = vec![0u8; PAGE_SIZE + 64];
        let n = os.read_app(base, &mut buf).unwrap();
        assert_eq!(n, PAGE_SIZE);
        // Entirely unreadable start address errors.
        assert!(os.read_app(base + PAGE_SIZE, &mut buf).is_err());
    }

    #[test]
    fn mock_thread_suspension() {
        let os = MockOs::new();
        let mut mc = Mcontext::default();
        mc.set_pc(0x1234);
        os.register_mock_thread(7, mc);
        assert!(os.get_thread_context(7).is_err());
        os.suspend_thread(7).unwrap();
        assert_eq!(os.get_thread_context(7).unwrap().pc(), 0x1234);
        let mut new_mc = mc;
        new_mc.set_pc(0x9999);
        os.set_thread_context(7, &new_mc).unwrap();
        os.resume_thread(7).unwrap();
        assert_eq!(os.thread_context_now(7).unwrap().pc(), 0x9999);
    }

    #[test]
    fn assembler_round_trip() {
        let os = MockOs::new();
        let page = os.map_app_page();
        let mut asm = Assembler::at(&os, page);
        asm.movi(RegId(0), 7);
        asm.ret();
        let isa = TestIsa;
        let mut bytes = [0u8; 2 * INSTR_LEN];
        os.read_app(page, &mut bytes).unwrap();
        let first = isa.decode(page, &bytes).unwrap();
        assert_eq!(first.kind, InstrKind::Normal);
        let second = isa.decode(page + INSTR_LEN, &bytes[INSTR_LEN..]).unwrap();
        assert_eq!(second.kind, InstrKind::Return);
    }
}
