//! Fatal-error reporting: when the engine reaches a state it cannot
//! recover from, it emits one machine-readable diagnostic record to the
//! configured sink and terminates the process with a distinguishing exit
//! code. Threads register themselves at birth so the record can carry a
//! compact thread dump without touching engine structures that may be the
//! thing that broke.

use crate::flags::Flags;
use crate::os::Tid;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Exit status of a fatal engine termination, distinct from anything the
/// application is likely to exit with.
pub const FATAL_EXIT_CODE: i32 = 118;

#[derive(Clone, Debug, Serialize)]
pub struct ThreadDump {
    pub tid: Tid,
    pub note: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticRecord {
    pub timestamp_secs: u64,
    pub pid: u32,
    pub engine_version: &'static str,
    pub reason: String,
    pub threads: Vec<ThreadDump>,
}

lazy_static! {
    static ref THREAD_NOTES: Mutex<HashMap<Tid, String>> = Mutex::new(HashMap::new());
}

/// Record this thread's presence (and current activity) for the fatal
/// thread dump. Cheap; called at thread birth and updated at coarse
/// state changes.
pub fn note_thread(tid: Tid, note: &str) {
    THREAD_NOTES.lock().unwrap().insert(tid, note.to_string());
}

pub fn forget_thread(tid: Tid) {
    THREAD_NOTES.lock().unwrap().remove(&tid);
}

pub fn build_record(reason: String) -> DiagnosticRecord {
    let threads = THREAD_NOTES
        .lock()
        .map(|notes| {
            let mut dump: Vec<ThreadDump> = notes
                .iter()
                .map(|(&tid, note)| ThreadDump {
                    tid,
                    note: note.clone(),
                })
                .collect();
            dump.sort_by_key(|t| t.tid);
            dump
        })
        .unwrap_or_default();
    DiagnosticRecord {
        timestamp_secs: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        pid: std::process::id(),
        engine_version: env!("CARGO_PKG_VERSION"),
        reason,
        threads,
    }
}

fn emit_record(record: &DiagnosticRecord) {
    let serialized = serde_json::to_string(record)
        .unwrap_or_else(|_| format!("{{\"reason\":{:?}}}", record.reason));
    let stderr = std::io::stderr();
    let mut lock = stderr.lock();
    let _ = writeln!(lock, "{}", serialized);
}

/// The central fatal-exit routine. Snapshots state, emits the diagnostic
/// record, optionally captures an in-process dump, and terminates.
pub fn fatal_exit(reason: String) -> ! {
    let record = build_record(reason);
    emit_record(&record);
    if Flags::get().live_dump {
        // The backtrace of the failing thread is the cheapest useful
        // in-process snapshot.
        let bt = backtrace::Backtrace::new();
        let stderr = std::io::stderr();
        let mut lock = stderr.lock();
        let _ = writeln!(lock, "{:?}", bt);
    }
    if let Some(tool) = &Flags::get().external_dump {
        let _ = std::process::Command::new(tool)
            .arg(std::process::id().to_string())
            .spawn();
    }
    std::process::exit(FATAL_EXIT_CODE);
}
