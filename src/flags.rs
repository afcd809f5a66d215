use crate::log::LogLevel;
use std::sync::Mutex;

lazy_static! {
    static ref STAGED: Mutex<Option<Flags>> = Mutex::new(None);
    static ref FLAGS: Flags = STAGED.lock().unwrap().take().unwrap_or_default();
}

/// Process-wide engine options. Staged once at startup (from the CLI or the
/// injector's option string), frozen at first use.
#[derive(Clone)]
pub struct Flags {
    /// Attempt to take over child processes at creation time.
    pub follow_children: bool,
    /// Take over before the loader runs rather than after.
    pub early_inject: bool,
    /// Named takeover point when `early_inject` is off.
    pub inject_location: Option<String>,
    /// Use frozen per-module fragment caches when present.
    pub use_persisted: bool,
    /// Allow freezing filled units into per-module cache files.
    pub coarse_enable_freeze: bool,
    /// Execution count at which a basic block becomes a trace head.
    pub trace_threshold: u32,
    /// Permit runtime detach via nudge.
    pub detach_allowed: bool,
    /// On fatal error, attempt an in-process memory snapshot.
    pub live_dump: bool,
    /// On fatal error, spawn this external dump tool instead.
    pub external_dump: Option<String>,
    /// When false, thread-creation interception is delayed until the first
    /// OS-level thread-attach notification.
    pub asynch: bool,
    /// Active log level.
    pub log_level: LogLevel,
    /// Size of one code-cache unit.
    pub cache_unit_size: usize,
    /// Per-partition cache budgets. Eviction starts above the high
    /// watermark fraction of the budget.
    pub private_cache_budget: usize,
    pub shared_cache_budget: usize,
    pub trace_cache_budget: usize,
    /// Percentage of the budget at which eviction of the oldest unit starts.
    pub cache_high_watermark_pct: u32,
    /// Maximum instructions decoded into one basic block.
    pub max_bb_instrs: usize,
    /// Continue block building across unconditional direct branches.
    pub elide_jmp: bool,
    /// Maximum basic blocks stitched into one trace.
    pub max_trace_blocks: usize,
    /// Cooperative synchall wait before escalating to forced suspension.
    pub synchall_timeout_ms: u64,
    /// log2 of indirect-branch lookup table capacity.
    pub ibl_table_bits: u32,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            follow_children: false,
            early_inject: true,
            inject_location: None,
            use_persisted: false,
            coarse_enable_freeze: false,
            trace_threshold: 50,
            detach_allowed: false,
            live_dump: false,
            external_dump: None,
            asynch: true,
            log_level: LogLevel::LogWarn,
            cache_unit_size: 64 * 1024,
            private_cache_budget: 512 * 1024,
            shared_cache_budget: 4 * 1024 * 1024,
            trace_cache_budget: 2 * 1024 * 1024,
            cache_high_watermark_pct: 80,
            max_bb_instrs: 256,
            elide_jmp: false,
            max_trace_blocks: 128,
            synchall_timeout_ms: 500,
            ibl_table_bits: 9,
        }
    }
}

impl Flags {
    /// Stage the process flags. Must happen before the first `get()`;
    /// later calls have no effect on the frozen value.
    pub fn stage(flags: Flags) {
        *STAGED.lock().unwrap() = Some(flags);
    }

    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}
