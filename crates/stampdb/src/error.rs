//! Error and Result types for StampDB operations.

use crate::block::SeriesId;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for StampDB operations.
pub type Result<T> = std::result::Result<T, StampError>;

/// Stable status codes exposed to binding layers.
///
/// The discriminants are part of the external contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Operation succeeded.
    Ok = 0,
    /// Bad series, range, or configuration.
    InvalidArgument = 1,
    /// Operation cannot proceed right now (GC could not free space).
    Busy = 2,
    /// Log region exhausted and unreclaimable.
    NoSpace = 3,
    /// A page failed its integrity check.
    CrcMismatch = 4,
    /// The underlying region or metadata store failed.
    IoError = 5,
    /// No data for the series.
    NotFound = 6,
    /// The workspace cannot hold state for one more series.
    Capacity = 7,
}

/// The error type for StampDB operations.
#[derive(Debug, Error)]
pub enum StampError {
    /// A caller-supplied argument or configuration value is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Garbage collection could not reclaim the oldest segment in time.
    #[error("Busy: {0}")]
    Busy(String),

    /// The log region holds no reclaimable space.
    #[error("No space left in log region ({segments} segments in use)")]
    NoSpace {
        /// Number of segments currently retained.
        segments: u32,
    },

    /// Page checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC32 stored alongside the data.
        expected: u32,
        /// CRC32 computed over the data read back.
        actual: u32,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The series has never been committed to the log.
    #[error("Series not found: {0}")]
    NotFound(SeriesId),

    /// The workspace has no room for another series slot.
    #[error("Workspace capacity exhausted: {series_slots} series slots in use")]
    Capacity {
        /// Number of series slots carved out of the workspace.
        series_slots: usize,
    },

    /// A block or metadata record could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl StampError {
    /// Maps the error onto its stable status code.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::Busy(_) => Status::Busy,
            Self::NoSpace { .. } => Status::NoSpace,
            Self::CrcMismatch { .. } | Self::Codec(_) => Status::CrcMismatch,
            Self::Io(_) => Status::IoError,
            Self::NotFound(_) => Status::NotFound,
            Self::Capacity { .. } => Status::Capacity,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
