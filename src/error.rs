//! Crate-wide error type.
//!
//! Per-cycle register access is infallible by design: out-of-range reads
//! return 0xFF, out-of-range writes are dropped, and SD/I2C protocol errors
//! are communicated through response bytes or NACKs rather than `Result`.
//! `PeripheralError` is reserved for setup-time failures that the system
//! integrator must react to before the bus can run.

use std::io;

/// A disjoint half-open `[start, end]` address range, used in error payloads
/// so callers can see exactly which two ranges collided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u16,
    pub end: u16,
}

impl AddressRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}..=0x{:04X}", self.start, self.end)
    }
}

/// Errors the peripheral core can report.
#[derive(Debug, thiserror::Error)]
pub enum PeripheralError {
    /// Two devices were registered with overlapping address ranges.
    #[error("device range {new} overlaps existing device range {existing}")]
    AddressRangeOverlap {
        new: AddressRange,
        existing: AddressRange,
    },

    /// The backing disk image could not be opened or created.
    #[error("failed to mount disk image at {path}: {source}")]
    MountFailed {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing disk image exceeds the largest image the SD-card target
    /// can address.
    #[error("disk image at {path} is {len} bytes, exceeding the {max}-byte limit")]
    ImageTooLarge {
        path: std::path::PathBuf,
        len: u64,
        max: u64,
    },

    /// A disk I/O operation failed mid-transfer.
    #[error("disk I/O error on sector {sector}: {source}")]
    DiskIo {
        sector: u32,
        #[source]
        source: io::Error,
    },
}
