use std::io;

pub mod dr_options;
pub mod info_command;
pub mod pcache_info_command;

pub trait DrCommand {
    fn run(&mut self) -> io::Result<()>;
}
