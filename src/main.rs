use gcr::commands::{
    drain_command::DrainCommand,
    gcr_options::{GcrOptions, GcrSubCommand},
    info_command::InfoCommand,
    restore_command::RestoreCommand,
    GcrCommand,
};
use std::io;
use structopt::StructOpt;

fn main() -> io::Result<()> {
    let options = GcrOptions::from_args();

    match &options.cmd {
        GcrSubCommand::Info { .. } => {
            InfoCommand::new(&options).run()?;
        }
        GcrSubCommand::Restore { .. } => {
            RestoreCommand::new(&options).run()?;
        }
        GcrSubCommand::Drain { .. } => {
            DrainCommand::new(&options).run()?;
        }
    }

    Ok(())
}
