use crate::{
    capture::check_drain,
    commands::{
        gcr_options::{GcrOptions, GcrSubCommand},
        GcrCommand,
    },
    flags::Flags,
    handle_map::{CommandListHandle, Handle},
    session::Session,
    snapshot::CapturedState,
    state::objects::CommandListState,
};
use std::{io, path::PathBuf};

pub struct DrainCommand {
    flags: Flags,
    snapshot: PathBuf,
    lists: Vec<u64>,
}

impl DrainCommand {
    pub fn new(options: &GcrOptions) -> DrainCommand {
        match options.cmd.clone() {
            GcrSubCommand::Drain { snapshot, lists } => DrainCommand {
                flags: Flags::from_options(options),
                snapshot,
                lists,
            },
            _ => panic!("Unexpected GcrSubCommand variant. Not a `Drain` variant!"),
        }
    }
}

impl GcrCommand for DrainCommand {
    fn run(&mut self) -> io::Result<()> {
        let captured = CapturedState::load(&self.snapshot)?;
        let session = Session::from_captured(self.flags.clone(), captured);
        let targets: Vec<CommandListHandle> = if self.lists.is_empty() {
            session
                .registry()
                .table::<CommandListState>()
                .ordered()
                .into_iter()
                .filter(|(_, l)| l.is_pending())
                .map(|(h, _)| h)
                .collect()
        } else {
            self.lists.iter().map(|&l| Handle::from_raw(l)).collect()
        };
        let decision = check_drain(&session, &targets)?;
        println!("{}", serde_json::to_string(&decision)?);
        Ok(())
    }
}
