//! Trace building: hot basic blocks are promoted to trace heads, a
//! recording thread then collects the executed block sequence, and the
//! builder fuses it into a single trace fragment. Head promotion state
//! lives on the fragment itself (flags + hit counter); the per-head
//! recording claim arbitrates racing threads.

use crate::app_pc::AppPc;
use crate::fragment::{ExitKind, Fragment, FragmentFlags};
use crate::log::LogLevel::LogDebug;
use crate::os::Tid;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Why recording stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceStop {
    /// Backward branch to the trace head: a loop closed.
    Loop,
    /// A block already in this trace reappeared.
    Repeat,
    /// Configured block limit reached.
    Limit,
    /// Terminal return.
    Return,
    /// Terminal unresolved indirect branch.
    Indirect,
    /// Next block ends in a system call; traces never span one.
    Syscall,
}

/// A thread's in-progress recording. While recording, the thread
/// executes throwaway unlinked copies of each block so that every block
/// exit returns to dispatch and can be appended here; `copies` tracks
/// those fragments for teardown.
#[derive(Debug)]
pub struct TraceRecording {
    pub head: AppPc,
    pub blocks: Vec<AppPc>,
    pub copies: Vec<crate::fragment::FragmentId>,
    seen: HashSet<AppPc>,
}

impl TraceRecording {
    pub fn new(head: AppPc) -> TraceRecording {
        TraceRecording {
            head,
            blocks: Vec::new(),
            copies: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Consider the block about to execute. Either it joins the trace or
    /// it stops the recording; a stopping block is not included unless
    /// it is itself a valid terminal (return/indirect).
    pub fn note_block(&mut self, frag: &Fragment, max_blocks: usize) -> Option<TraceStop> {
        let tag = frag.tag;
        if !self.blocks.is_empty() && tag == self.head {
            return Some(TraceStop::Loop);
        }
        if self.seen.contains(&tag) {
            return Some(TraceStop::Repeat);
        }
        if frag.test_flag(FragmentFlags::ENDS_IN_SYSCALL) {
            return Some(TraceStop::Syscall);
        }
        self.blocks.push(tag);
        self.seen.insert(tag);
        let terminal = frag.with_links(|links| {
            links.exits.iter().find_map(|e| match e.kind {
                ExitKind::Return => Some(TraceStop::Return),
                ExitKind::IndirectBranch => Some(TraceStop::Indirect),
                _ => None,
            })
        });
        if let Some(stop) = terminal {
            return Some(stop);
        }
        if self.blocks.len() >= max_blocks {
            return Some(TraceStop::Limit);
        }
        None
    }
}

/// Per-thread trace state, owned by the dispatch loop.
#[derive(Debug)]
pub enum TraceState {
    Idle,
    Recording(TraceRecording),
}

impl TraceState {
    pub fn is_recording(&self) -> bool {
        matches!(self, TraceState::Recording(_))
    }
}

impl Default for TraceState {
    fn default() -> TraceState {
        TraceState::Idle
    }
}

/// Process-wide arbitration of which thread records from which head.
/// First claim wins; the loser never starts (or lazily aborts) its
/// recording.
pub struct TraceControl {
    claims: Mutex<HashMap<AppPc, Tid>>,
}

impl TraceControl {
    pub fn new() -> TraceControl {
        TraceControl {
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_claim(&self, head: AppPc, tid: Tid) -> bool {
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(&head) {
            return false;
        }
        claims.insert(head, tid);
        log!(LogDebug, "tid {} claims trace head {}", tid, head);
        true
    }

    pub fn release(&self, head: AppPc, tid: Tid) {
        let mut claims = self.claims.lock().unwrap();
        if claims.get(&head) == Some(&tid) {
            claims.remove(&head);
        }
    }

    pub fn is_claimed(&self, head: AppPc) -> bool {
        self.claims.lock().unwrap().contains_key(&head)
    }
}

impl Default for TraceControl {
    fn default() -> TraceControl {
        TraceControl::new()
    }
}

/// Can this block ever become a trace head? Heads are marked
/// structurally — a block that is the target of a backward branch — and
/// the linker refuses to link into a head, so every head entry
/// round-trips dispatch and gets counted.
pub fn head_eligible(frag: &Fragment) -> bool {
    !frag.test_flag(FragmentFlags::IS_TRACE)
        && !frag.test_flag(FragmentFlags::FAULT_STUB)
        && !frag.test_flag(FragmentFlags::ENDS_IN_SYSCALL)
}

/// Counting check for a marked head, run on each dispatch entry.
/// Returns true when this execution crossed the tracing threshold.
pub fn head_ready_to_trace(frag: &Fragment, threshold: u32) -> bool {
    if !head_eligible(frag) {
        return false;
    }
    let count = frag.bump_hit_count();
    if count >= threshold {
        log!(LogDebug, "{} hot ({} head entries)", frag.id, count);
        true
    } else {
        false
    }
}
