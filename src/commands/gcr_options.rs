use crate::flags::{KernelRange, RestoreMode};
use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "gcr",
    about = "Inspect and restore captured GPU driver state",
    after_help = "Use GCR_LOG to control logging; e.g. GCR_LOG=all:warn,state_restore:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct GcrOptions {
    #[structopt(
        short = "C",
        long,
        help = "Verify each memory snapshot against the CRC32 taken at capture time before uploading it."
    )]
    pub checksum: bool,

    #[structopt(
        short = "E",
        long,
        help = "Any warning or error that is printed is treated as fatal."
    )]
    pub fatal_errors: bool,

    /// Search snapshotted memory for values that look like pointers into tracked allocations
    /// and translate them too.
    #[structopt(long)]
    pub scan_indirect_pointers: bool,

    /// Split uploads into pieces of at most this many bytes.
    #[structopt(long, parse(try_from_str = parse_chunk_size))]
    pub max_upload_chunk: Option<usize>,

    /// Where <restore-mode> := `full` | `per-kernel`. In `per-kernel` mode events are left
    /// unsignaled and re-issued dispatches produce the signals.
    #[structopt(short = "m", long)]
    pub restore_mode: Option<RestoreMode>,

    /// Re-issue recorded dispatches whose kernel number is in this range. Either a kernel
    /// number like `12`, or a range like `10-20`. By default nothing is re-issued
    #[structopt(short = "k", long)]
    pub kernel_range: Option<KernelRange>,

    #[structopt(subcommand)]
    pub cmd: GcrSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum GcrSubCommand {
    /// Dump a summary of a snapshot in JSON format.
    #[structopt(name = "info")]
    Info {
        /// The snapshot file
        snapshot: PathBuf,
    },

    /// Restore a snapshot against a recording driver and list every driver call it makes.
    #[structopt(name = "restore")]
    Restore {
        /// Destroy everything again after restoring
        #[structopt(short = "t", long)]
        teardown: bool,

        /// Don't list driver calls, only print the summary
        #[structopt(short = "q", long)]
        quiet: bool,

        /// Number of drivers to expose. Defaults to what the snapshot needs
        #[structopt(long)]
        drivers: Option<usize>,

        /// Number of root devices per driver. Defaults to what the snapshot needs
        #[structopt(long)]
        devices: Option<usize>,

        /// Number of sub-devices per root device. Defaults to what the snapshot needs
        #[structopt(long)]
        sub_devices: Option<usize>,

        /// The snapshot file
        snapshot: PathBuf,
    },

    /// Decide whether command lists could be drained, by simulating their recorded event
    /// waits and signals.
    #[structopt(name = "drain")]
    Drain {
        /// The snapshot file
        snapshot: PathBuf,

        /// Capture time handles of the lists to drain, decimal or 0x-prefixed hex. All
        /// pending lists if omitted
        #[structopt(parse(try_from_str = parse_handle))]
        lists: Vec<u64>,
    },
}

fn parse_chunk_size(maybe_size: &str) -> Result<usize, Box<dyn Error>> {
    let size = maybe_size.trim().parse::<usize>()?;
    if size == 0 {
        Err(Box::new(clap::Error::with_description(
            "Please provide a number greater than 0",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(size)
    }
}

fn parse_handle(maybe_handle: &str) -> Result<u64, Box<dyn Error>> {
    let s = maybe_handle.trim();
    let h = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse::<u64>()?,
    };
    if h == 0 {
        Err(Box::new(clap::Error::with_description(
            "A null handle names no command list",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(h)
    }
}
