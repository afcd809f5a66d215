//! The linker: flips fragment exits between "branch to my stub (and from
//! there to dispatch)" and "branch straight to the target fragment", and
//! maintains the incoming-link lists that make teardown possible. Every
//! flip is one aligned word store; a thread racing through the exit sees
//! either value, and both are correct destinations.

use crate::app_pc::AppPc;
use crate::cache_pc::CachePc;
use crate::fragment::{ExitState, Fragment, FragmentId, FragmentSlab, IncomingLink};
use crate::log::LogLevel::LogDebug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Atomically store a branch-target word in cache memory.
pub fn patch_word(addr: CachePc, value: usize) {
    debug_assert_eq!(addr.as_usize() % std::mem::size_of::<usize>(), 0);
    let slot = unsafe { &*(addr.as_usize() as *const AtomicUsize) };
    slot.store(value, Ordering::Release);
}

/// Atomically read a branch-target word (dispatch stubs, the simulated
/// executor, and link-state audits all go through this).
pub fn read_word(addr: CachePc) -> usize {
    debug_assert_eq!(addr.as_usize() % std::mem::size_of::<usize>(), 0);
    let slot = unsafe { &*(addr.as_usize() as *const AtomicUsize) };
    slot.load(Ordering::Acquire)
}

fn patch_addr(frag: &Fragment, patch_offset: u32) -> CachePc {
    frag.entry + patch_offset as usize
}

fn stub_addr(frag: &Fragment, stub_offset: u32) -> CachePc {
    frag.entry + stub_offset as usize
}

pub struct Linker {
    /// Direct exits waiting for a fragment at their target tag. Drained
    /// when that fragment commits. Stale sources (evicted since they were
    /// queued) simply fail to resolve and are dropped.
    pending: Mutex<HashMap<AppPc, Vec<IncomingLink>>>,
}

impl Linker {
    pub fn new() -> Linker {
        Linker {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Link exit `exit_index` of `source` to `target`: rewrite the exit's
    /// branch word from its stub to the target entry, record the
    /// back-reference. The two fragment locks are taken one at a time;
    /// the intermediate states are valid because the patch itself is
    /// atomic.
    pub fn link(
        &self,
        slab: &FragmentSlab,
        source_id: FragmentId,
        exit_index: u32,
        target_id: FragmentId,
    ) {
        let (source, target) = match (slab.get(source_id), slab.get(target_id)) {
            (Some(s), Some(t)) => (s, t),
            _ => return,
        };
        use crate::fragment::FragmentFlags;
        // Interposed targets must keep round-tripping through dispatch.
        if target.test_flag(FragmentFlags::NO_LINK)
            || target.test_flag(FragmentFlags::BEING_FLUSHED)
        {
            return;
        }
        // A basic block targeted by a backward branch is a trace-head
        // candidate; heads are never linked into, so every entry passes
        // through dispatch where it is counted.
        if !target.test_flag(FragmentFlags::IS_TRACE) && target.tag <= source.tag {
            if !target.test_flag(FragmentFlags::TRACE_HEAD)
                && crate::trace::head_eligible(&target)
            {
                target.set_flag(FragmentFlags::TRACE_HEAD);
                log!(LogDebug, "{} marked trace head ({})", target.id, target.tag);
            }
            return;
        }
        if target.test_flag(FragmentFlags::TRACE_HEAD) {
            return;
        }
        let patched = source.with_links(|links| {
            let exit = match links.exits.get_mut(exit_index as usize) {
                Some(e) => e,
                None => return false,
            };
            exit.state = ExitState::Linked(target_id);
            patch_word(
                patch_addr(&source, exit.patch_offset),
                target.entry.as_usize(),
            );
            true
        });
        if !patched {
            return;
        }
        target.with_links(|links| {
            links.incoming.push(IncomingLink {
                source: source_id,
                exit_index,
            });
        });
        log!(
            LogDebug,
            "linked {} exit {} -> {} ({})",
            source_id,
            exit_index,
            target_id,
            target.tag
        );
    }

    /// Restore one exit of `source` to its stub route.
    fn unlink_exit(&self, source: &Arc<Fragment>, exit_index: u32) {
        source.with_links(|links| {
            if let Some(exit) = links.exits.get_mut(exit_index as usize) {
                if let ExitState::Linked(_) = exit.state {
                    exit.state = ExitState::ToStub;
                    patch_word(
                        patch_addr(source, exit.patch_offset),
                        stub_addr(source, exit.stub_offset).as_usize(),
                    );
                }
            }
        });
    }

    /// Tear down every incoming link of `target`: each linking fragment's
    /// exit is restored to its stub. Must happen before `target` is
    /// evicted (observable ordering: a racing thread either reaches the
    /// still-valid target bytes or round-trips through dispatch).
    pub fn unlink_incoming(&self, slab: &FragmentSlab, target_id: FragmentId) {
        let target = match slab.get(target_id) {
            Some(t) => t,
            None => return,
        };
        let incoming = target.with_links(|links| std::mem::take(&mut links.incoming));
        for link in incoming {
            if let Some(source) = slab.get(link.source) {
                self.unlink_exit(&source, link.exit_index);
            }
        }
    }

    /// Sever `source`'s outgoing links: remove its back-references from
    /// every target and restore its exits to stubs. Part of evicting
    /// `source`.
    pub fn unlink_outgoing(&self, slab: &FragmentSlab, source_id: FragmentId) {
        let source = match slab.get(source_id) {
            Some(s) => s,
            None => return,
        };
        let linked: Vec<(u32, FragmentId)> = source.with_links(|links| {
            links
                .exits
                .iter()
                .enumerate()
                .filter_map(|(i, e)| match e.state {
                    ExitState::Linked(t) => Some((i as u32, t)),
                    ExitState::ToStub => None,
                })
                .collect()
        });
        for (exit_index, target_id) in linked {
            if let Some(target) = slab.get(target_id) {
                target.with_links(|links| {
                    links.incoming.retain(|l| {
                        !(l.source == source_id && l.exit_index == exit_index)
                    });
                });
            }
            self.unlink_exit(&source, exit_index);
        }
        // Drop any still-pending requests this fragment queued.
        let mut pending = self.pending.lock().unwrap();
        for waiters in pending.values_mut() {
            waiters.retain(|l| l.source != source_id);
        }
        pending.retain(|_, v| !v.is_empty());
    }

    /// Wire a freshly committed fragment into the graph: link its direct
    /// exits to already-present targets (else queue them), and satisfy
    /// exits elsewhere that were waiting for this tag.
    pub fn attach(
        &self,
        slab: &FragmentSlab,
        frag: &Arc<Fragment>,
        mut lookup: impl FnMut(AppPc) -> Option<FragmentId>,
    ) {
        let direct: Vec<(u32, AppPc)> = frag.with_links(|links| {
            links
                .exits
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.target.map(|t| (i as u32, t)))
                .collect()
        });
        for (exit_index, target_tag) in direct {
            match lookup(target_tag) {
                Some(target_id) => self.link(slab, frag.id, exit_index, target_id),
                None => {
                    self.pending
                        .lock()
                        .unwrap()
                        .entry(target_tag)
                        .or_insert_with(Vec::new)
                        .push(IncomingLink {
                            source: frag.id,
                            exit_index,
                        });
                }
            }
        }
        let waiters = self.pending.lock().unwrap().remove(&frag.tag);
        if let Some(waiters) = waiters {
            for link in waiters {
                self.link(slab, link.source, link.exit_index, frag.id);
            }
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().values().map(|v| v.len()).sum()
    }
}

impl Default for Linker {
    fn default() -> Linker {
        Linker::new()
    }
}
