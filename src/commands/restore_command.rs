use crate::{
    commands::{
        gcr_options::{GcrOptions, GcrSubCommand},
        GcrCommand,
    },
    driver::recording_driver::RecordingDriver,
    flags::Flags,
    log::LogLevel::LogInfo,
    session::Session,
    snapshot::CapturedState,
    state_restore::{restore_state, teardown, CategoryCounts, RestoreSummary},
};
use serde::Serialize;
use std::{
    cmp::max,
    io::{self, stdout, BufWriter, Write},
    path::PathBuf,
};

pub struct RestoreCommand {
    flags: Flags,
    snapshot: PathBuf,
    teardown: bool,
    quiet: bool,
    drivers: Option<usize>,
    devices: Option<usize>,
    sub_devices: Option<usize>,
}

impl RestoreCommand {
    pub fn new(options: &GcrOptions) -> RestoreCommand {
        match options.cmd.clone() {
            GcrSubCommand::Restore {
                teardown,
                quiet,
                drivers,
                devices,
                sub_devices,
                snapshot,
            } => RestoreCommand {
                flags: Flags::from_options(options),
                snapshot,
                teardown,
                quiet,
                drivers,
                devices,
                sub_devices,
            },
            _ => panic!("Unexpected GcrSubCommand variant. Not a `Restore` variant!"),
        }
    }
}

/// Smallest (drivers, devices per driver, sub-devices per device) the
/// snapshot's enumeration ordinals fit into.
fn needed_topology(captured: &CapturedState) -> (usize, usize, usize) {
    let drivers = captured
        .drivers
        .iter()
        .fold(1, |n, e| max(n, e.state.ordinal as usize + 1));
    let (mut devices, mut sub_devices) = (1, 0);
    for e in &captured.devices {
        let needed = e.state.ordinal as usize + 1;
        match e.state.parent {
            None => devices = max(devices, needed),
            Some(_) => sub_devices = max(sub_devices, needed),
        }
    }
    (drivers, devices, sub_devices)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreReport {
    summary: RestoreSummary,
    torn_down: Option<CategoryCounts>,
    driver_calls: usize,
}

impl GcrCommand for RestoreCommand {
    fn run(&mut self) -> io::Result<()> {
        let captured = CapturedState::load(&self.snapshot)?;
        let (drivers, devices, sub_devices) = needed_topology(&captured);
        let mut driver = RecordingDriver::with_topology(
            self.drivers.unwrap_or(drivers),
            self.devices.unwrap_or(devices),
            self.sub_devices.unwrap_or(sub_devices),
        );
        let mut session = Session::from_captured(self.flags.clone(), captured);
        log!(LogInfo, "restoring {:?} with {:?}", self.snapshot, self.flags);

        let summary = match restore_state(&mut session, &mut driver) {
            Ok(summary) => summary,
            Err(e) => clean_fatal!("cannot restore {:?}: {}", self.snapshot, e),
        };
        let torn_down = if self.teardown {
            Some(teardown(&mut session, &mut driver)?)
        } else {
            None
        };

        let mut out = BufWriter::new(stdout());
        if !self.quiet {
            for call in driver.calls() {
                writeln!(out, "{}", call)?;
            }
        }
        let report = RestoreReport {
            summary,
            torn_down,
            driver_calls: driver.calls().len(),
        };
        writeln!(out, "{}", serde_json::to_string(&report)?)?;
        out.flush()
    }
}
