use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Crate-local logging. Levels are ordered; the active level is set once
/// from the engine flags during init and read on every log! call site.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    LogFatal = 0,
    LogError = 1,
    LogWarn = 2,
    LogInfo = 3,
    LogDebug = 4,
}

static ACTIVE_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::LogWarn as u8);

pub fn set_level(level: LogLevel) {
    ACTIVE_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= ACTIVE_LEVEL.load(Ordering::Relaxed)
}

pub fn level_from_str(s: &str) -> Option<LogLevel> {
    match s {
        "fatal" => Some(LogLevel::LogFatal),
        "error" => Some(LogLevel::LogError),
        "warn" => Some(LogLevel::LogWarn),
        "info" => Some(LogLevel::LogInfo),
        "debug" => Some(LogLevel::LogDebug),
        _ => None,
    }
}

#[doc(hidden)]
pub fn write_record(level: LogLevel, module: &str, args: std::fmt::Arguments) {
    let tag = match level {
        LogLevel::LogFatal => "FATAL",
        LogLevel::LogError => "ERROR",
        LogLevel::LogWarn => "WARN",
        LogLevel::LogInfo => "INFO",
        LogLevel::LogDebug => "DEBUG",
    };
    let stderr = std::io::stderr();
    let mut lock = stderr.lock();
    // A failed write to stderr is not actionable; ignore it.
    let _ = writeln!(lock, "[{} {}] {}", tag, module, args);
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {{
        let lvl = $level;
        if $crate::log::level_enabled(lvl) {
            $crate::log::write_record(lvl, module_path!(), format_args!($($arg)+));
        }
    }};
}

/// Log at LogFatal, emit a diagnostic record, and terminate the process.
/// Never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        $crate::log::write_record(
            $crate::log::LogLevel::LogFatal,
            module_path!(),
            format_args!($($arg)+),
        );
        $crate::diagnostics::fatal_exit(format!($($arg)+));
    }};
}

/// Assertion carrying thread identity, for invariant checks that implicate
/// a specific thread's state. `$tid` is anything that formats as the thread.
#[macro_export]
macro_rules! engine_assert {
    ($tid:expr, $cond:expr) => {{
        if !$cond {
            fatal!("[tid {}] assertion failed: {}", $tid, stringify!($cond));
        }
    }};
    ($tid:expr, $cond:expr, $($arg:tt)+) => {{
        if !$cond {
            fatal!("[tid {}] assertion failed: {}", $tid, format_args!($($arg)+));
        }
    }};
}
