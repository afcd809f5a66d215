use crate::commands::dr_options::{DrOptions, DrSubCommand};
use crate::commands::DrCommand;
use crate::persist::{read_module_cache, PersistEntry};
use serde::Serialize;
use std::io;
use std::path::PathBuf;

pub struct PcacheInfoCommand {
    file: PathBuf,
}

impl PcacheInfoCommand {
    pub fn new(options: &DrOptions) -> PcacheInfoCommand {
        match options.cmd.clone() {
            DrSubCommand::PcacheInfo { file } => PcacheInfoCommand { file },
            _ => panic!("Unexpected DrSubCommand variant. Not a `PcacheInfo` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PcacheHeader {
    module_path: String,
    digest: u64,
    entry_count: usize,
    cache_bytes: usize,
    entries: Vec<PersistEntry>,
}

impl DrCommand for PcacheInfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let module = read_module_cache(&self.file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let header = PcacheHeader {
            module_path: module.identity.path.clone(),
            digest: module.identity.digest,
            entry_count: module.entries.len(),
            cache_bytes: module.bytes.len(),
            entries: module.entries,
        };
        let serialized = serde_json::to_string(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        println!("{}", serialized);
        Ok(())
    }
}
