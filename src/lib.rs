//! Second-stage loader for resource-constrained microcontrollers.
//!
//! Picks one of several installed application slots, makes sure it is mapped at the address it was
//! built to run from, verifies it and hands off to it. Updates are applied through an A/B (plus
//! factory) slot scheme with automatic rollback when the new image never commits itself.
//!
//! Every mutation of the persisted [`state::BootConfig`] happens at a stable checkpoint, so a reset
//! at any instruction boundary resumes where it left off instead of leaving a half-written slot
//! behind.
#![no_std]

pub mod boot;
pub mod device;
pub mod engine;
pub mod loader;
pub mod state;
pub mod strategies;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

pub use device::{DeviceHandle, DeviceName, EraseSizes, Registry, StorageDevice};
pub use engine::Watchdog;
pub use loader::{Loader, Platform};
pub use state::{BootConfig, ConfigManager, ConfigStore, SlotIndex};

/// Everything that can go wrong while deciding what to boot.
///
/// None of these are recoverable within a single boot attempt: the loader reports the cause and
/// halts, relying on the watchdog or an operator to reset the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A storage device failed to read.
    Read,
    /// A storage device failed to program.
    Write,
    /// A storage device failed to erase, for every candidate erase size.
    Erase,
    /// No device with the requested name is registered.
    DeviceNotFound,
    /// Device names are limited to [`device::DEVICE_NAME_LEN`] printable ASCII bytes.
    InvalidDeviceName,
    /// Teardown found handles that were never released.
    DevicesInUse,
    /// Computed CRC differs from the recorded one.
    ChecksumMismatch,
    /// The slot to boot has no CRC recorded, so it cannot be verified.
    NoChecksum,
    /// The slot to boot holds no image.
    EmptyImage,
    /// The image vector table points outside of the platform memory layout.
    InvalidVectors,
    /// No slot is mapped at the address the active image must run from.
    NoBootableSlot,
    /// No slot is available to hold an image temporarily during a swap.
    NoTempSlot,
    /// A slot index outside of the configured slots.
    InvalidSlot,
    /// Attempted to copy an image into a read-only slot.
    SlotNotWriteable,
    /// Stored configuration failed its magic, version, CRC or range checks.
    CorruptConfig,
    /// A serialization buffer was too small for the configuration record.
    ConfigBufferTooSmall,
    /// The configuration store backend failed.
    Storage,
}

impl Error {
    /// Transient device errors, as opposed to integrity or configuration errors.
    pub const fn is_io(&self) -> bool {
        matches!(self, Error::Read | Error::Write | Error::Erase)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::Read => "device read failed",
            Error::Write => "device write failed",
            Error::Erase => "device erase failed",
            Error::DeviceNotFound => "device not found",
            Error::InvalidDeviceName => "invalid device name",
            Error::DevicesInUse => "devices still in use",
            Error::ChecksumMismatch => "checksum mismatch",
            Error::NoChecksum => "no checksum recorded",
            Error::EmptyImage => "empty image",
            Error::InvalidVectors => "invalid vector table",
            Error::NoBootableSlot => "no bootable slot",
            Error::NoTempSlot => "no temp slot",
            Error::InvalidSlot => "invalid slot",
            Error::SlotNotWriteable => "slot not writeable",
            Error::CorruptConfig => "corrupt config",
            Error::ConfigBufferTooSmall => "config buffer too small",
            Error::Storage => "config storage failed",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
pub(crate) mod log {
    pub(crate) use defmt::{debug, error, info, trace, warn};
}

#[cfg(all(feature = "log", not(feature = "defmt")))]
#[allow(unused_imports)]
pub(crate) mod log {
    pub(crate) use ::log::{debug, error, info, trace, warn};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
#[allow(unused_imports, unused_macros)]
pub(crate) mod log {
    macro_rules! trace {
        ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
    }
    pub(crate) use trace;
    macro_rules! debug {
        ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
    }
    pub(crate) use debug;
    macro_rules! info {
        ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
    }
    pub(crate) use info;
    macro_rules! warner {
        ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
    }
    pub(crate) use error;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn io_errors() {
        assert!(Error::Read.is_io());
        assert!(Error::Erase.is_io());
        assert!(!Error::ChecksumMismatch.is_io());
        assert!(!Error::CorruptConfig.is_io());
        assert_eq!(Error::NoTempSlot.to_string(), "no temp slot");
    }
}
