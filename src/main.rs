use drio::commands::dr_options::{DrOptions, DrSubCommand};
use drio::commands::info_command::InfoCommand;
use drio::commands::pcache_info_command::PcacheInfoCommand;
use drio::commands::DrCommand;
use drio::flags::Flags;
use structopt::StructOpt;

fn main() {
    let options = DrOptions::from_args();
    Flags::stage(options.to_flags());
    drio::log::set_level(Flags::get().log_level);

    let mut command: Box<dyn DrCommand> = match &options.cmd {
        DrSubCommand::Info => Box::new(InfoCommand::new(&options)),
        DrSubCommand::PcacheInfo { .. } => Box::new(PcacheInfoCommand::new(&options)),
    };
    if let Err(e) = command.run() {
        eprintln!("drio: {}", e);
        std::process::exit(1);
    }
}
