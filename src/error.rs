use crate::{driver::DriverStatus, state::ObjectCategory};
use std::{
    fmt::{Display, Formatter},
    io,
};
use thiserror::Error;

pub type GcrResult<T> = Result<T, GcrError>;

/// Hard failures. Translation misses and simulator deadlocks are ordinary
/// return values and never show up here.
#[derive(Debug, Error)]
pub enum GcrError {
    /// A handle, allocation or object has no entry. Always a broken invariant:
    /// stream corruption, an ordering bug or a resumption point that refers to
    /// something never captured.
    #[error("{what} {id:#x} not found")]
    NotFound { what: &'static str, id: u64 },

    /// The replay target could not represent the captured state.
    #[error("restore of {category} {id:#x} failed in {api}: {reason}")]
    ReconstructionFailure {
        category: ObjectCategory,
        id: u64,
        api: &'static str,
        reason: RestoreFailReason,
    },

    /// A driver call the engine issued on its own while capturing failed.
    #[error("{api} failed: {status}")]
    DriverCall {
        api: &'static str,
        status: DriverStatus,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl GcrError {
    pub fn not_found(what: &'static str, id: u64) -> GcrError {
        GcrError::NotFound { what, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GcrError::NotFound { .. })
    }

    pub fn driver_call(api: &'static str, status: DriverStatus) -> GcrError {
        GcrError::DriverCall { api, status }
    }

    pub fn is_reconstruction_failure(&self) -> bool {
        matches!(self, GcrError::ReconstructionFailure { .. })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RestoreFailReason {
    /// The driver call returned something other than success.
    Status(DriverStatus),
    /// Fewer devices (or sub-device partitions) than at capture time.
    MissingDevice { ordinal: u32, available: usize },
    /// The snapshot bytes don't match the checksum taken at capture time.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl Display for RestoreFailReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreFailReason::Status(s) => write!(f, "driver returned {}", s),
            RestoreFailReason::MissingDevice { ordinal, available } => write!(
                f,
                "device ordinal {} requested but only {} available",
                ordinal, available
            ),
            RestoreFailReason::ChecksumMismatch { expected, actual } => write!(
                f,
                "snapshot checksum mismatch (expected {:#010x}, got {:#010x})",
                expected, actual
            ),
        }
    }
}

impl From<GcrError> for io::Error {
    fn from(e: GcrError) -> io::Error {
        match e {
            GcrError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
