use crate::flags::Flags;
use crate::log;
use crate::log::LogLevel;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, StructOpt)]
#[structopt(
    name = "drio",
    about = "In-process code-cache virtualization engine tools"
)]
pub struct DrOptions {
    /// Log level: fatal, error, warn, info, debug.
    #[structopt(long, default_value = "warn")]
    pub log_level: String,

    /// Counter value at which a basic block becomes a trace head.
    #[structopt(long)]
    pub trace_threshold: Option<u32>,

    /// Attempt to take over child processes at creation time.
    #[structopt(long)]
    pub follow_children: bool,

    /// Use frozen per-module fragment caches when present.
    #[structopt(long)]
    pub use_persisted: bool,

    /// Permit runtime detach via nudge.
    #[structopt(long)]
    pub detach_allowed: bool,

    /// On fatal error, attempt an in-process memory snapshot.
    #[structopt(long)]
    pub live_dump: bool,

    #[structopt(subcommand)]
    pub cmd: DrSubCommand,
}

#[derive(Clone, StructOpt)]
pub enum DrSubCommand {
    /// Print engine version and effective options as JSON.
    Info,
    /// Inspect a frozen per-module fragment cache file.
    PcacheInfo {
        /// Path to the .drpc file.
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
}

impl DrOptions {
    /// Fold the parsed options into the process flags.
    pub fn to_flags(&self) -> Flags {
        let mut flags = Flags::default();
        if let Some(level) = log::level_from_str(&self.log_level) {
            flags.log_level = level;
        } else {
            flags.log_level = LogLevel::LogWarn;
        }
        if let Some(t) = self.trace_threshold {
            flags.trace_threshold = t;
        }
        flags.follow_children = self.follow_children;
        flags.use_persisted = self.use_persisted;
        flags.detach_allowed = self.detach_allowed;
        flags.live_dump = self.live_dump;
        flags
    }
}
