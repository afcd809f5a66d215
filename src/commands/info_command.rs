use crate::commands::dr_options::{DrOptions, DrSubCommand};
use crate::commands::DrCommand;
use crate::flags::Flags;
use serde::Serialize;
use std::io;

pub struct InfoCommand;

impl InfoCommand {
    pub fn new(options: &DrOptions) -> InfoCommand {
        match options.cmd {
            DrSubCommand::Info => InfoCommand,
            _ => panic!("Unexpected DrSubCommand variant. Not an `Info` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineInfo {
    version: &'static str,
    trace_threshold: u32,
    cache_unit_size: usize,
    shared_cache_budget: usize,
    trace_cache_budget: usize,
    max_bb_instrs: usize,
    max_trace_blocks: usize,
    synchall_timeout_ms: u64,
    use_persisted: bool,
    follow_children: bool,
    detach_allowed: bool,
}

impl DrCommand for InfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let flags = Flags::get();
        let info = EngineInfo {
            version: env!("CARGO_PKG_VERSION"),
            trace_threshold: flags.trace_threshold,
            cache_unit_size: flags.cache_unit_size,
            shared_cache_budget: flags.shared_cache_budget,
            trace_cache_budget: flags.trace_cache_budget,
            max_bb_instrs: flags.max_bb_instrs,
            max_trace_blocks: flags.max_trace_blocks,
            synchall_timeout_ms: flags.synchall_timeout_ms,
            use_persisted: flags.use_persisted,
            follow_children: flags.follow_children,
            detach_allowed: flags.detach_allowed,
        };
        let serialized = serde_json::to_string(&info)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        println!("{}", serialized);
        Ok(())
    }
}
