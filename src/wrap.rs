//! The wrap/replace layer: deterministic pre/post callbacks around
//! application functions, and atomic function replacement. Pairing of pre
//! and post callbacks survives longjmp- and exception-style nonlocal
//! exits through per-thread wrap frames carrying stack-pointer
//! watermarks; the unwind check runs at every cache exit and costs
//! O(frames actually popped).

use crate::app_pc::AppPc;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::mcontext::{arg_reg, Mcontext};
use crate::os::Os;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

bitflags! {
    pub struct WrapFlags: u32 {
        /// Invoke the post callback when the frame is popped by an
        /// abnormal unwind instead of a normal return.
        const POST_ON_UNWIND = 0b01;
    }
}

impl Default for WrapFlags {
    fn default() -> WrapFlags {
        WrapFlags::POST_ON_UNWIND
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WrapId(u64);

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WrapError {
    /// A replacement already exists and override was not requested.
    AlreadyReplaced(AppPc),
    /// No replacement/wrap registered at this address.
    NotRegistered(AppPc),
}

impl fmt::Display for WrapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WrapError::AlreadyReplaced(pc) => write!(f, "{} already replaced", pc),
            WrapError::NotRegistered(pc) => write!(f, "nothing registered at {}", pc),
        }
    }
}

pub type PreCallback = Arc<dyn Fn(&mut PreContext) + Send + Sync>;
pub type PostCallback = Arc<dyn Fn(&mut PostContext) + Send + Sync>;

#[derive(Clone)]
pub struct WrapRecord {
    pub id: WrapId,
    pub pre: Option<PreCallback>,
    pub post: Option<PostCallback>,
    pub flags: WrapFlags,
    pub user_seed: usize,
}

/// Context handed to pre callbacks, live for the duration of one call.
pub struct PreContext<'a> {
    pub(crate) os: &'a dyn Os,
    pub(crate) mc: &'a mut Mcontext,
    pub(crate) func: AppPc,
    pub(crate) retaddr: AppPc,
    pub(crate) user_data: usize,
    pub(crate) skip: Option<SkipCall>,
}

#[derive(Copy, Clone, Debug)]
pub struct SkipCall {
    pub retval: usize,
    /// Extra callee-popped stack bytes (stdcall conventions).
    pub stdcall_bytes: usize,
}

impl<'a> PreContext<'a> {
    pub fn func(&self) -> AppPc {
        self.func
    }

    pub fn get_arg(&self, i: usize) -> usize {
        match arg_reg(i) {
            Some(reg) => self.mc.gpr(reg),
            None => {
                let slot = self.stack_arg_addr(i);
                let mut buf = [0u8; 8];
                match self.os.read_app(AppPc::new(slot), &mut buf) {
                    Ok(8) => usize::from_le_bytes(buf),
                    _ => 0,
                }
            }
        }
    }

    pub fn set_arg(&mut self, i: usize, value: usize) {
        match arg_reg(i) {
            Some(reg) => self.mc.set_gpr(reg, value),
            None => {
                let slot = self.stack_arg_addr(i);
                let _ = self
                    .os
                    .write_app(AppPc::new(slot), &value.to_le_bytes());
            }
        }
    }

    fn stack_arg_addr(&self, i: usize) -> usize {
        // At function entry sp points at the return address; stack args
        // follow it.
        self.mc.sp() + 8 + 8 * (i - crate::mcontext::NUM_REG_ARGS)
    }

    pub fn get_retaddr(&self) -> AppPc {
        self.retaddr
    }

    pub fn get_mcontext(&self) -> &Mcontext {
        self.mc
    }

    pub fn set_mcontext(&mut self, mc: &Mcontext) {
        *self.mc = *mc;
    }

    pub fn user_data(&self) -> usize {
        self.user_data
    }

    pub fn set_user_data(&mut self, value: usize) {
        self.user_data = value;
    }

    /// Skip the wrapped call entirely: control resumes at the caller with
    /// `retval` in the return register. The matching post callback is not
    /// invoked.
    pub fn skip_call(&mut self, retval: usize, stdcall_bytes: usize) {
        self.skip = Some(SkipCall {
            retval,
            stdcall_bytes,
        });
    }
}

/// Context handed to post callbacks.
pub struct PostContext<'a> {
    pub(crate) mc: &'a mut Mcontext,
    pub(crate) func: AppPc,
    pub(crate) abnormal: bool,
    pub(crate) user_data: usize,
}

impl<'a> PostContext<'a> {
    pub fn func(&self) -> AppPc {
        self.func
    }

    /// True when this invocation pairs a pre whose frame was popped by a
    /// nonlocal exit; registers and return value are not valid.
    pub fn is_abnormal(&self) -> bool {
        self.abnormal
    }

    pub fn get_retval(&self) -> Option<usize> {
        if self.abnormal {
            log!(LogWarn, "get_retval in abnormal post callback ignored");
            return None;
        }
        Some(self.mc.retval())
    }

    pub fn set_retval(&mut self, value: usize) {
        if self.abnormal {
            log!(LogWarn, "set_retval in abnormal post callback ignored");
            return;
        }
        self.mc.set_retval(value);
    }

    pub fn get_mcontext(&self) -> &Mcontext {
        self.mc
    }

    pub fn set_mcontext(&mut self, mc: &Mcontext) {
        if self.abnormal {
            log!(LogWarn, "set_mcontext in abnormal post callback ignored");
            return;
        }
        *self.mc = *mc;
    }

    pub fn user_data(&self) -> usize {
        self.user_data
    }
}

/// One entry of a live wrap frame: the post half of a record plus the
/// user datum its pre produced.
#[derive(Clone)]
struct FramePost {
    post: Option<PostCallback>,
    flags: WrapFlags,
    user_data: usize,
    func: AppPc,
}

/// Per-thread record of one entered-but-not-yet-returned wrapped call.
pub struct WrapFrame {
    pub func: AppPc,
    pub retaddr: AppPc,
    /// Application stack pointer at function entry. With a
    /// downward-growing stack, `sp > watermark` means the frame is gone.
    pub watermark: usize,
    posts: Vec<FramePost>,
}

/// Outcome of intercepting a dispatch target through the wrap layer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WrapDisposition {
    /// Continue to this tag (identity unless replaced).
    Proceed(AppPc),
    /// skip_call: resume at the caller; mcontext already updated.
    Redirect(AppPc),
}

pub struct WrapRegistry {
    wraps: Mutex<HashMap<AppPc, Vec<WrapRecord>>>,
    replaces: Mutex<HashMap<AppPc, AppPc>>,
    next_id: Mutex<u64>,
}

impl WrapRegistry {
    pub fn new() -> WrapRegistry {
        WrapRegistry {
            wraps: Mutex::new(HashMap::new()),
            replaces: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Register a pre/post pair for `func`. Registration order defines
    /// pre order; post order is the reverse.
    pub fn wrap(
        &self,
        func: AppPc,
        pre: Option<PreCallback>,
        post: Option<PostCallback>,
        flags: WrapFlags,
        user_seed: usize,
    ) -> WrapId {
        let mut next = self.next_id.lock().unwrap();
        let id = WrapId(*next);
        *next += 1;
        self.wraps
            .lock()
            .unwrap()
            .entry(func)
            .or_insert_with(Vec::new)
            .push(WrapRecord {
                id,
                pre,
                post,
                flags,
                user_seed,
            });
        log!(LogDebug, "wrapped {} as {:?}", func, id);
        id
    }

    pub fn unwrap_id(&self, func: AppPc, id: WrapId) -> Result<(), WrapError> {
        let mut wraps = self.wraps.lock().unwrap();
        let records = wraps.get_mut(&func).ok_or(WrapError::NotRegistered(func))?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(WrapError::NotRegistered(func));
        }
        if records.is_empty() {
            wraps.remove(&func);
        }
        Ok(())
    }

    pub fn is_wrapped(&self, func: AppPc) -> bool {
        self.wraps.lock().unwrap().contains_key(&func)
    }

    fn records_for(&self, func: AppPc) -> Option<Vec<WrapRecord>> {
        self.wraps.lock().unwrap().get(&func).cloned()
    }

    /// Install a replacement for `orig`. A second installation fails
    /// unless `override_existing`.
    pub fn replace(
        &self,
        orig: AppPc,
        repl: Option<AppPc>,
        override_existing: bool,
    ) -> Result<(), WrapError> {
        let mut replaces = self.replaces.lock().unwrap();
        match repl {
            Some(repl) => {
                if replaces.contains_key(&orig) && !override_existing {
                    return Err(WrapError::AlreadyReplaced(orig));
                }
                replaces.insert(orig, repl);
                Ok(())
            }
            None => {
                if replaces.remove(&orig).is_none() && !override_existing {
                    return Err(WrapError::NotRegistered(orig));
                }
                Ok(())
            }
        }
    }

    /// Resolve a dispatch target through the replacement map.
    pub fn resolve_replacement(&self, tag: AppPc) -> AppPc {
        self.replaces
            .lock()
            .unwrap()
            .get(&tag)
            .copied()
            .unwrap_or(tag)
    }

    pub fn replacement_count(&self) -> usize {
        self.replaces.lock().unwrap().len()
    }
}

impl Default for WrapRegistry {
    fn default() -> WrapRegistry {
        WrapRegistry::new()
    }
}

fn read_retaddr(os: &dyn Os, sp: usize) -> AppPc {
    let mut buf = [0u8; 8];
    match os.read_app(AppPc::new(sp), &mut buf) {
        Ok(8) => AppPc::new(usize::from_le_bytes(buf) as usize),
        _ => AppPc::null(),
    }
}

/// Intercept a dispatch target: apply replacement, then run pre
/// callbacks if the (replaced) target is wrapped, pushing a wrap frame.
/// `wrap_stack` is the calling thread's stack.
pub fn enter_target(
    registry: &WrapRegistry,
    os: &dyn Os,
    mc: &mut Mcontext,
    wrap_stack: &mut Vec<WrapFrame>,
    tag: AppPc,
) -> WrapDisposition {
    let tag = registry.resolve_replacement(tag);
    let records = match registry.records_for(tag) {
        Some(r) => r,
        None => return WrapDisposition::Proceed(tag),
    };

    let sp = mc.sp();
    let retaddr = read_retaddr(os, sp);
    let mut posts = Vec::with_capacity(records.len());
    let mut skip: Option<SkipCall> = None;
    for record in &records {
        let mut ctx = PreContext {
            os,
            mc: &mut *mc,
            func: tag,
            retaddr,
            user_data: record.user_seed,
            skip: None,
        };
        if let Some(pre) = &record.pre {
            pre(&mut ctx);
        }
        if skip.is_none() {
            skip = ctx.skip;
        }
        posts.push(FramePost {
            post: record.post.clone(),
            flags: record.flags,
            user_data: ctx.user_data,
            func: tag,
        });
    }

    if let Some(sk) = skip {
        // Undo the call: pop the return address (plus any callee-popped
        // bytes), place the return value, resume at the caller. No post
        // callbacks fire for a skipped call.
        mc.set_retval(sk.retval);
        mc.set_sp(sp + 8 + sk.stdcall_bytes);
        log!(LogDebug, "skip_call at {} -> {}", tag, retaddr);
        return WrapDisposition::Redirect(retaddr);
    }

    wrap_stack.push(WrapFrame {
        func: tag,
        retaddr,
        watermark: sp,
        posts,
    });
    WrapDisposition::Proceed(tag)
}

fn run_posts(frame: WrapFrame, mc: &mut Mcontext, abnormal: bool) {
    // Reverse registration order.
    for fp in frame.posts.into_iter().rev() {
        if abnormal && !fp.flags.contains(WrapFlags::POST_ON_UNWIND) {
            continue;
        }
        if let Some(post) = fp.post {
            let mut ctx = PostContext {
                mc: &mut *mc,
                func: fp.func,
                abnormal,
                user_data: fp.user_data,
            };
            post(&mut ctx);
        }
    }
}

/// The cache-exit check: pop every frame whose watermark shows it has
/// been unwound. A frame whose recorded return address equals the
/// current dispatch target returned normally; anything else popped here
/// was bypassed (longjmp, exception) and gets the abnormal post.
pub fn check_unwind(wrap_stack: &mut Vec<WrapFrame>, mc: &mut Mcontext, next_tag: AppPc) {
    loop {
        let pop_normal = match wrap_stack.last() {
            None => return,
            Some(top) => {
                if mc.sp() <= top.watermark {
                    // Frame still live (stack grows down).
                    return;
                }
                next_tag == top.retaddr
            }
        };
        let frame = wrap_stack.pop().expect("checked non-empty");
        if pop_normal {
            log!(LogDebug, "normal return from wrapped {}", frame.func);
            run_posts(frame, mc, false);
            // Only the frame actually returning pops normally; anything
            // beneath it with a higher watermark is handled next round.
        } else {
            log!(LogDebug, "abnormal unwind of wrapped {}", frame.func);
            run_posts(frame, mc, true);
        }
    }
}

/// Detach/teardown policy: every outstanding frame gets its abnormal
/// post so the pre/post pairing invariant holds to the very end.
pub fn drain_all(wrap_stack: &mut Vec<WrapFrame>, mc: &mut Mcontext) {
    while let Some(frame) = wrap_stack.pop() {
        run_posts(frame, mc, true);
    }
}
