//! System configuration.
//!
//! A plain `Copy`/`Default` struct the system integrator fills in after
//! parsing its own CLI arguments, which this core never touches directly.

use std::path::PathBuf;

/// How to open the SD-card backing image.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Path to the raw, 512-byte-sector disk image.
    pub path: PathBuf,
    /// Create the file (zero-filled) if it does not already exist.
    pub create_if_missing: bool,
}

impl MountOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: false,
        }
    }

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }
}

/// Top-level configuration for the peripheral core.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConfig {
    /// Initial millisecond offset applied to the host wall clock when the
    /// RTC computes BCD time registers. Zero means "use the host clock
    /// as-is".
    pub rtc_offset_ms: i64,
}
