use crate::commands::gcr_options::GcrOptions;
use serde::Serialize;
use std::str::FromStr;

/// Default single-call upload size limit.
pub const DEFAULT_MAX_UPLOAD_CHUNK: usize = 64 << 20;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub enum RestoreMode {
    /// Restore everything, event signal states included.
    Full,
    /// Resume at kernel granularity. Events come back unsignaled; the
    /// re-issued dispatches produce their signals.
    PerKernel,
}

impl Default for RestoreMode {
    fn default() -> Self {
        RestoreMode::Full
    }
}

impl FromStr for RestoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RestoreMode::Full),
            "per-kernel" => Ok(RestoreMode::PerKernel),
            _ => Err(format!(
                "`{}' is not a restore mode. Use `full' or `per-kernel'",
                s
            )),
        }
    }
}

/// Inclusive range of kernel numbers: the resumption window.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub struct KernelRange {
    pub first: u32,
    pub last: u32,
}

impl KernelRange {
    pub fn contains(&self, kernel_number: u32) -> bool {
        self.first <= kernel_number && kernel_number <= self.last
    }
}

/// `7` or `7-12`.
impl FromStr for KernelRange {
    type Err = String;

    fn from_str(range_or_single: &str) -> Result<Self, Self::Err> {
        let number = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|e| format!("`{}' is not a kernel number: {}", s, e))
        };
        let args: Vec<&str> = range_or_single.splitn(2, '-').collect();
        let first = number(args[0])?;
        let mut last = first;
        if args.len() == 2 {
            last = number(args[1])?;
        }
        if first > last {
            return Err(format!(
                "kernel range `{}' ends before it starts",
                range_or_single
            ));
        }
        Ok(KernelRange { first, last })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Flags {
    /// Verify each memory snapshot against its capture time CRC32 before upload.
    pub checksum: bool,
    /// Any warning the engine can attribute to the application is fatal.
    pub fatal_errors_and_warnings: bool,
    /// Scan snapshotted memory for pointer-like values into tracked allocations.
    pub scan_indirect_pointers: bool,
    /// Uploads larger than this are split.
    pub max_upload_chunk: usize,
    pub restore_mode: RestoreMode,
    /// Dispatches are re-issued only for kernel numbers in this range.
    pub kernel_range: Option<KernelRange>,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            checksum: false,
            fatal_errors_and_warnings: false,
            scan_indirect_pointers: false,
            max_upload_chunk: DEFAULT_MAX_UPLOAD_CHUNK,
            restore_mode: RestoreMode::Full,
            kernel_range: None,
        }
    }
}

impl Flags {
    pub fn from_options(options: &GcrOptions) -> Flags {
        Flags {
            checksum: options.checksum,
            fatal_errors_and_warnings: options.fatal_errors,
            scan_indirect_pointers: options.scan_indirect_pointers,
            max_upload_chunk: options
                .max_upload_chunk
                .filter(|&c| c > 0)
                .unwrap_or(DEFAULT_MAX_UPLOAD_CHUNK),
            restore_mode: options.restore_mode.unwrap_or_default(),
            kernel_range: options.kernel_range,
        }
    }
}
