use std::io;

pub mod drain_command;
pub mod gcr_options;
pub mod info_command;
pub mod restore_command;

pub trait GcrCommand {
    fn run(&mut self) -> io::Result<()>;
}
