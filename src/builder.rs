//! The fragment builder: decode one basic block of application code,
//! rewrite its control transfer through engine-managed exits ("mangling"),
//! emit the result into a scratch buffer with a translation table built
//! alongside, and commit it into the code cache.

use crate::app_pc::AppPc;
use crate::code_cache::{CacheError, CodeCache};
use crate::flags::Flags;
use crate::fragment::{
    Exit, ExitKind, ExitState, Fragment, FragmentFlags, FragmentSlab, Partition,
};
use crate::heap::ExecHeap;
use crate::isa::{
    CodeBuffer, DecodeError, IblChoice, Instr, InstrDecoder, InstrEncoder, InstrKind, PatchSite,
};
use crate::link;
use crate::log::LogLevel::LogDebug;
use crate::mcontext::{RegId, REG_IBL_TARGET};
use crate::os::Os;
use crate::translate::{RegLoc, RegRule, TranslationEntry, TranslationTable};
use std::fmt;
use std::sync::Arc;

/// Spill slot used by every indirect-branch mangling sequence.
pub const IBL_SPILL_SLOT: u8 = 0;

#[derive(Debug)]
pub enum BuildError {
    Cache(CacheError),
}

impl From<CacheError> for BuildError {
    fn from(e: CacheError) -> BuildError {
        BuildError::Cache(e)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::Cache(e) => write!(f, "{}", e),
        }
    }
}

/// Everything the builder borrows from its environment.
pub struct BuildInputs<'a> {
    pub os: &'a dyn Os,
    pub decoder: &'a dyn InstrDecoder,
    pub encoder: &'a dyn InstrEncoder,
    pub heap: &'a ExecHeap,
    pub slab: &'a FragmentSlab,
}

/// How a decoded block ends.
#[derive(Clone, Debug)]
pub enum Terminator {
    Jump {
        target: AppPc,
    },
    Cond {
        source: Instr,
        taken: AppPc,
        fallthrough: AppPc,
    },
    Call {
        target: AppPc,
        fallthrough: AppPc,
    },
    /// Indirect jump or call; a call also pushes its return address.
    Indirect {
        reg: RegId,
        push_ret: Option<AppPc>,
    },
    Return,
    Syscall {
        fallthrough: AppPc,
    },
    /// Decode stopped without a control transfer (instruction budget, or
    /// the next instruction is unreadable/invalid and will fault in its
    /// own fragment). Falls through to `next`.
    FallIntoNext {
        next: AppPc,
    },
    /// The first instruction itself is undecodable: the whole fragment
    /// is a synthetic fault re-raise.
    Fault(DecodeError),
}

#[derive(Debug)]
pub struct DecodedBlock {
    pub tag: AppPc,
    pub instrs: Vec<(AppPc, Instr)>,
    pub terminator: Terminator,
    pub app_len: u32,
}

/// Decode from `tag` to the first control transfer (or the instruction
/// budget). Application bytes are re-fetched per instruction, so a block
/// crossing into a page that went unreadable stops at the boundary.
pub fn decode_block(os: &dyn Os, decoder: &dyn InstrDecoder, tag: AppPc) -> DecodedBlock {
    let flags = Flags::get();
    let max_len = decoder.max_instr_len();
    let mut instrs: Vec<(AppPc, Instr)> = Vec::new();
    let mut pc = tag;
    loop {
        if instrs.len() >= flags.max_bb_instrs {
            return DecodedBlock {
                tag,
                app_len: pc.offset_from(tag) as u32,
                instrs,
                terminator: Terminator::FallIntoNext { next: pc },
            };
        }
        let mut bytes = vec![0u8; max_len];
        let got = match os.read_app(pc, &mut bytes) {
            Ok(n) => n,
            Err(_) => 0,
        };
        let decoded = decoder.decode(pc, &bytes[..got]);
        let instr = match decoded {
            Ok(i) => i,
            Err(err) => {
                let terminator = if instrs.is_empty() {
                    Terminator::Fault(err)
                } else {
                    // Executing this far is fine; the faulting tail gets
                    // its own synthetic fragment when reached.
                    Terminator::FallIntoNext { next: pc }
                };
                return DecodedBlock {
                    tag,
                    app_len: pc.offset_from(tag) as u32,
                    instrs,
                    terminator,
                };
            }
        };
        let len = instr.len as usize;
        let after = pc + len;
        let terminator = match instr.kind.clone() {
            InstrKind::Normal => {
                instrs.push((pc, instr));
                pc = after;
                continue;
            }
            InstrKind::DirectJump { target } => {
                // Forward branches only: a backward elision would loop
                // the builder, and backward targets are trace-head
                // material anyway.
                if flags.elide_jmp && target > after && instrs.len() + 1 < flags.max_bb_instrs {
                    pc = target;
                    continue;
                }
                Terminator::Jump { target }
            }
            InstrKind::CondJump { taken } => Terminator::Cond {
                source: instr,
                taken,
                fallthrough: after,
            },
            InstrKind::Call { target } => Terminator::Call {
                target,
                fallthrough: after,
            },
            InstrKind::IndirectJump { reg } => Terminator::Indirect {
                reg,
                push_ret: None,
            },
            InstrKind::IndirectCall { reg } => Terminator::Indirect {
                reg,
                push_ret: Some(after),
            },
            InstrKind::Return => Terminator::Return,
            InstrKind::Syscall | InstrKind::Interrupt { .. } => Terminator::Syscall {
                fallthrough: after,
            },
        };
        return DecodedBlock {
            tag,
            app_len: after.offset_from(tag) as u32,
            instrs,
            terminator,
        };
    }
}

/// An exit awaiting its stub, produced during body emission.
struct PendingExit {
    kind: ExitKind,
    target: Option<AppPc>,
    patch: PatchSite,
}

struct EmittedBody {
    buf: CodeBuffer,
    pending: Vec<PendingExit>,
    translation: TranslationTable,
    flags: FragmentFlags,
}

fn ibl_spill_rules() -> Vec<RegRule> {
    vec![RegRule {
        reg: REG_IBL_TARGET,
        loc: RegLoc::Spill(IBL_SPILL_SLOT),
    }]
}

fn emit_body(
    encoder: &dyn InstrEncoder,
    block: &DecodedBlock,
    ibl: IblChoice,
    base_flags: FragmentFlags,
) -> EmittedBody {
    let mut buf = CodeBuffer::new();
    let mut translation = TranslationTable::new();
    let mut pending = Vec::new();
    let mut flags = base_flags;

    for (pc, instr) in &block.instrs {
        translation.push(TranslationEntry {
            cache_offset: buf.len() as u32,
            app_offset: pc.offset_from(block.tag) as u32,
            restartable: true,
            rules: vec![],
        });
        // The decoder produced these from readable bytes; re-emission of
        // a normal instruction cannot fail in a correct encoder pair.
        if encoder.encode_app_instr(instr, *pc, &mut buf).is_err() {
            flags |= FragmentFlags::FAULT_STUB;
            encoder.emit_raise_fault(
                &mut buf,
                DecodeError::Invalid(*pc).as_fault(),
                *pc,
            );
            return EmittedBody {
                buf,
                pending: Vec::new(),
                translation,
                flags,
            };
        }
    }

    let term_app_off = block
        .instrs
        .last()
        .map(|(pc, i)| pc.offset_from(block.tag) + i.len as usize)
        .unwrap_or(0) as u32;
    let term_entry = |buf: &CodeBuffer, restartable: bool, rules: Vec<RegRule>| TranslationEntry {
        cache_offset: buf.len() as u32,
        app_offset: term_app_off,
        restartable,
        rules,
    };

    match &block.terminator {
        Terminator::Jump { target } => {
            translation.push(term_entry(&buf, true, vec![]));
            let patch = encoder.emit_branch(&mut buf, 0);
            pending.push(PendingExit {
                kind: ExitKind::DirectBranch,
                target: Some(*target),
                patch,
            });
        }
        Terminator::Cond {
            source,
            taken,
            fallthrough,
        } => {
            translation.push(term_entry(&buf, true, vec![]));
            // A decoder/encoder pair that can decode a conditional can
            // re-emit its condition; treat failure as an undecodable tail.
            match encoder.emit_cond_branch(&mut buf, source, 0) {
                Ok(patch) => {
                    pending.push(PendingExit {
                        kind: ExitKind::DirectBranch,
                        target: Some(*taken),
                        patch,
                    });
                    let patch = encoder.emit_branch(&mut buf, 0);
                    pending.push(PendingExit {
                        kind: ExitKind::Fallthrough,
                        target: Some(*fallthrough),
                        patch,
                    });
                }
                Err(_) => {
                    flags |= FragmentFlags::FAULT_STUB;
                    encoder.emit_raise_fault(
                        &mut buf,
                        DecodeError::Invalid(block.tag + term_app_off as usize).as_fault(),
                        block.tag + term_app_off as usize,
                    );
                }
            }
        }
        Terminator::Call {
            target,
            fallthrough,
        } => {
            translation.push(term_entry(&buf, true, vec![]));
            encoder.emit_push_const(&mut buf, fallthrough.as_usize());
            // Between the push and the transfer the call is half done;
            // translation snaps back to the call instruction.
            translation.push(term_entry(&buf, false, vec![]));
            let patch = encoder.emit_branch(&mut buf, 0);
            pending.push(PendingExit {
                kind: ExitKind::DirectBranch,
                target: Some(*target),
                patch,
            });
        }
        Terminator::Indirect { reg, push_ret } => {
            translation.push(term_entry(&buf, true, vec![]));
            if let Some(ret) = push_ret {
                encoder.emit_push_const(&mut buf, ret.as_usize());
                translation.push(term_entry(&buf, false, vec![]));
            }
            encoder.emit_spill(&mut buf, REG_IBL_TARGET, IBL_SPILL_SLOT);
            translation.push(term_entry(&buf, false, ibl_spill_rules()));
            encoder.emit_move_reg(&mut buf, REG_IBL_TARGET, *reg);
            translation.push(term_entry(&buf, false, ibl_spill_rules()));
            encoder.emit_ibl_probe(&mut buf, REG_IBL_TARGET, ibl);
            pending.push(PendingExit {
                kind: ExitKind::IndirectBranch,
                target: None,
                patch: PatchSite { offset: 0 },
            });
        }
        Terminator::Return => {
            translation.push(term_entry(&buf, true, vec![]));
            encoder.emit_spill(&mut buf, REG_IBL_TARGET, IBL_SPILL_SLOT);
            translation.push(term_entry(&buf, false, ibl_spill_rules()));
            encoder.emit_pop_reg(&mut buf, REG_IBL_TARGET);
            translation.push(term_entry(&buf, false, ibl_spill_rules()));
            encoder.emit_ibl_probe(&mut buf, REG_IBL_TARGET, ibl);
            pending.push(PendingExit {
                kind: ExitKind::Return,
                target: None,
                patch: PatchSite { offset: 0 },
            });
        }
        Terminator::Syscall { fallthrough } => {
            flags |= FragmentFlags::ENDS_IN_SYSCALL;
            translation.push(term_entry(&buf, true, vec![]));
            let patch = encoder.emit_branch(&mut buf, 0);
            pending.push(PendingExit {
                kind: ExitKind::Syscall,
                target: Some(*fallthrough),
                patch,
            });
        }
        Terminator::FallIntoNext { next } => {
            translation.push(term_entry(&buf, true, vec![]));
            let patch = encoder.emit_branch(&mut buf, 0);
            pending.push(PendingExit {
                kind: ExitKind::Fallthrough,
                target: Some(*next),
                patch,
            });
        }
        Terminator::Fault(err) => {
            flags |= FragmentFlags::FAULT_STUB;
            translation.push(TranslationEntry {
                cache_offset: buf.len() as u32,
                app_offset: 0,
                restartable: true,
                rules: vec![],
            });
            encoder.emit_raise_fault(&mut buf, err.as_fault(), block.tag);
        }
    }

    EmittedBody {
        buf,
        pending,
        translation,
        flags,
    }
}

/// Emit stubs, resolve placeholder branch words, place the body in the
/// cache, and register the fragment in the slab. Table registration and
/// linking are the caller's side of commit.
fn commit_body(
    inp: &BuildInputs,
    cache: &mut CodeCache,
    partition: Partition,
    tag: AppPc,
    app_len: u32,
    mut body: EmittedBody,
) -> Result<Arc<Fragment>, BuildError> {
    // Stub pass: one stub per pending exit, in exit order.
    let mut exits = Vec::with_capacity(body.pending.len());
    let mut id_patches = Vec::new();
    for (i, pending) in body.pending.iter().enumerate() {
        let has_stub = pending.patch.offset != 0;
        let (stub_offset, patch_offset) = if has_stub {
            let site = if pending.kind == ExitKind::Syscall {
                inp.encoder.emit_syscall_gate(&mut body.buf, i as u32)
            } else {
                inp.encoder.emit_exit_stub(&mut body.buf, i as u32)
            };
            id_patches.push(site.id_patch);
            (site.stub_offset as u32, pending.patch.offset as u32)
        } else {
            // Indirect exits leave through the lookup routine, not a stub.
            (0, 0)
        };
        exits.push(Exit {
            kind: pending.kind,
            target: pending.target,
            stub_offset,
            patch_offset,
            state: ExitState::ToStub,
        });
    }

    let placement = cache.allocate(inp.heap, body.buf.len())?;

    // Resolve placeholder branch words now that the entry address is
    // known: every stub-routed exit initially branches to its stub.
    for exit in &exits {
        if exit.patch_offset != 0 {
            body.buf.write_word_at(
                PatchSite {
                    offset: exit.patch_offset as usize,
                },
                placement.pc.as_usize() + exit.stub_offset as usize,
            );
        }
    }

    cache.install(placement, body.buf.bytes());

    let fragment = Fragment::new(
        tag,
        partition,
        placement.unit,
        placement.pc,
        body.buf.len() as u32,
        app_len,
        body.translation,
        body.flags,
        exits,
    );
    let (id, arc) = inp.slab.insert(fragment);

    // Stamp the owning id into each stub so a cache exit can identify
    // its source without any side lookup.
    for site in id_patches {
        link::patch_word(placement.pc + site.offset, id.as_u64() as usize);
    }
    cache.note_fragment(placement.unit, id, body.buf.len() as u32);
    log!(
        LogDebug,
        "built {} for {} ({} bytes, {:?})",
        id,
        tag,
        body.buf.len(),
        arc.flags()
    );
    Ok(arc)
}

/// Build one basic-block fragment for `tag`.
pub fn build_bb(
    inp: &BuildInputs,
    cache: &mut CodeCache,
    partition: Partition,
    tag: AppPc,
) -> Result<Arc<Fragment>, BuildError> {
    let shared = partition != Partition::PrivateBb;
    let ibl = if shared {
        IblChoice::Shared
    } else {
        IblChoice::Private
    };
    let base_flags = if shared {
        FragmentFlags::SHARED
    } else {
        FragmentFlags::empty()
    };
    let block = decode_block(inp.os, inp.decoder, tag);
    let body = emit_body(inp.encoder, &block, ibl, base_flags);
    commit_body(inp, cache, partition, tag, block.app_len.max(1), body)
}

/// Build a trace fragment from a recorded sequence of block tags.
/// Internal direct transitions are elided; conditional branches become
/// side exits; the final block's terminator is mangled normally.
pub fn build_trace(
    inp: &BuildInputs,
    cache: &mut CodeCache,
    blocks: &[AppPc],
) -> Result<Arc<Fragment>, BuildError> {
    debug_assert!(!blocks.is_empty());
    let head = blocks[0];
    let mut buf = CodeBuffer::new();
    let mut translation = TranslationTable::new();
    let mut pending: Vec<PendingExit> = Vec::new();
    let mut internal: Vec<(PatchSite, usize)> = Vec::new(); // site -> body offset

    for (bi, &btag) in blocks.iter().enumerate() {
        let block = decode_block(inp.os, inp.decoder, btag);
        let next_tag = blocks.get(bi + 1).copied();
        // Constituent blocks may sit below the head in the address
        // space; translation offsets are signed displacements from the
        // head tag.
        for (pc, instr) in &block.instrs {
            translation.push(TranslationEntry {
                cache_offset: buf.len() as u32,
                app_offset: rel32(head, *pc),
                restartable: true,
                rules: vec![],
            });
            if inp.encoder.encode_app_instr(instr, *pc, &mut buf).is_err() {
                break;
            }
        }
        let term_off = block
            .instrs
            .last()
            .map(|(pc, i)| rel32(head, *pc).wrapping_add(i.len as u32))
            .unwrap_or_else(|| rel32(head, btag));
        let is_last = next_tag.is_none();
        match &block.terminator {
            Terminator::Jump { target } => {
                if !is_last && Some(*target) == next_tag {
                    // Elided: execution falls through to the next block.
                } else {
                    translation.push(TranslationEntry {
                        cache_offset: buf.len() as u32,
                        app_offset: term_off,
                        restartable: true,
                        rules: vec![],
                    });
                    let patch = inp.encoder.emit_branch(&mut buf, 0);
                    pending.push(PendingExit {
                        kind: ExitKind::DirectBranch,
                        target: Some(*target),
                        patch,
                    });
                }
            }
            Terminator::Cond {
                source,
                taken,
                fallthrough,
            } => {
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: true,
                    rules: vec![],
                });
                if Some(*taken) == next_tag {
                    // Trace continues on the taken side: the condition
                    // hops over a side exit to the fall-through.
                    if let Ok(cond_site) = inp.encoder.emit_cond_branch(&mut buf, source, 0) {
                        let patch = inp.encoder.emit_branch(&mut buf, 0);
                        pending.push(PendingExit {
                            kind: ExitKind::Fallthrough,
                            target: Some(*fallthrough),
                            patch,
                        });
                        internal.push((cond_site, buf.len()));
                    }
                } else {
                    // Trace continues on the fall-through: taken side is
                    // the side exit.
                    if let Ok(patch) = inp.encoder.emit_cond_branch(&mut buf, source, 0) {
                        pending.push(PendingExit {
                            kind: ExitKind::DirectBranch,
                            target: Some(*taken),
                            patch,
                        });
                    }
                    if is_last {
                        let patch = inp.encoder.emit_branch(&mut buf, 0);
                        pending.push(PendingExit {
                            kind: ExitKind::Fallthrough,
                            target: Some(*fallthrough),
                            patch,
                        });
                    }
                }
            }
            Terminator::Call {
                target,
                fallthrough,
            } => {
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: true,
                    rules: vec![],
                });
                inp.encoder.emit_push_const(&mut buf, fallthrough.as_usize());
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: false,
                    rules: vec![],
                });
                if !is_last && Some(*target) == next_tag {
                    // Elided call transfer.
                } else {
                    let patch = inp.encoder.emit_branch(&mut buf, 0);
                    pending.push(PendingExit {
                        kind: ExitKind::DirectBranch,
                        target: Some(*target),
                        patch,
                    });
                }
            }
            Terminator::Indirect { reg, push_ret } => {
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: true,
                    rules: vec![],
                });
                if let Some(ret) = push_ret {
                    inp.encoder.emit_push_const(&mut buf, ret.as_usize());
                }
                inp.encoder.emit_spill(&mut buf, REG_IBL_TARGET, IBL_SPILL_SLOT);
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: false,
                    rules: ibl_spill_rules(),
                });
                inp.encoder.emit_move_reg(&mut buf, REG_IBL_TARGET, *reg);
                inp.encoder
                    .emit_ibl_probe(&mut buf, REG_IBL_TARGET, IblChoice::Shared);
                pending.push(PendingExit {
                    kind: ExitKind::IndirectBranch,
                    target: None,
                    patch: PatchSite { offset: 0 },
                });
            }
            Terminator::Return => {
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: true,
                    rules: vec![],
                });
                inp.encoder.emit_spill(&mut buf, REG_IBL_TARGET, IBL_SPILL_SLOT);
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: false,
                    rules: ibl_spill_rules(),
                });
                inp.encoder.emit_pop_reg(&mut buf, REG_IBL_TARGET);
                inp.encoder
                    .emit_ibl_probe(&mut buf, REG_IBL_TARGET, IblChoice::Shared);
                pending.push(PendingExit {
                    kind: ExitKind::Return,
                    target: None,
                    patch: PatchSite { offset: 0 },
                });
            }
            Terminator::Syscall { fallthrough } => {
                translation.push(TranslationEntry {
                    cache_offset: buf.len() as u32,
                    app_offset: term_off,
                    restartable: true,
                    rules: vec![],
                });
                let patch = inp.encoder.emit_branch(&mut buf, 0);
                pending.push(PendingExit {
                    kind: ExitKind::Syscall,
                    target: Some(*fallthrough),
                    patch,
                });
            }
            Terminator::FallIntoNext { next } => {
                if !is_last && Some(*next) == next_tag {
                    // Natural fall-through inside the trace.
                } else {
                    translation.push(TranslationEntry {
                        cache_offset: buf.len() as u32,
                        app_offset: term_off,
                        restartable: true,
                        rules: vec![],
                    });
                    let patch = inp.encoder.emit_branch(&mut buf, 0);
                    pending.push(PendingExit {
                        kind: ExitKind::Fallthrough,
                        target: Some(*next),
                        patch,
                    });
                }
            }
            Terminator::Fault(err) => {
                inp.encoder.emit_raise_fault(&mut buf, err.as_fault(), btag);
            }
        }
    }

    let body = EmittedBody {
        buf,
        pending,
        translation,
        flags: FragmentFlags::SHARED | FragmentFlags::IS_TRACE,
    };
    // Traces are looked up by head tag only.
    let arc = commit_body(inp, cache, Partition::Trace, head, 1, body)?;
    // Intra-trace hops need the entry address, so they resolve after
    // placement.
    for (site, body_offset) in internal {
        link::patch_word(arc.entry + site.offset, arc.entry.as_usize() + body_offset);
    }
    Ok(arc)
}

/// Signed 32-bit displacement from `from` to `to`, stored in the
/// translation table's offset field.
fn rel32(from: AppPc, to: AppPc) -> u32 {
    to.as_usize().wrapping_sub(from.as_usize()) as u32
}
