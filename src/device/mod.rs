//! Storage devices as seen by the loader.
//!
//! The loader only ever talks to a [`StorageDevice`]: internal flash, a partition of an external
//! SPI flash, a RAM region or an encrypting overlay all look the same. Devices are looked up by
//! [`DeviceName`] in a [`Registry`], which hands out scoped [`DeviceHandle`]s.

use serde::{Deserialize, Serialize};

use crate::Error;

mod nor_flash;
mod registry;

pub use nor_flash::NorFlashDevice;
pub use registry::{DeviceHandle, Registry};

/// Maximum length of a device name, as persisted in the boot configuration.
pub const DEVICE_NAME_LEN: usize = 8;

/// Maximum number of distinct erase sizes a device may report.
pub const MAX_ERASE_SIZES: usize = 4;

/// Block-like storage with erase-before-write semantics.
///
/// Offsets are relative to the start of the device.
#[allow(async_fn_in_trait)]
pub trait StorageDevice {
    /// Read `buf.len()` bytes starting at `offset`.
    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Program `data` at `offset`. The range must have been erased.
    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error>;

    /// Erase `len` bytes starting at `offset`.
    ///
    /// Devices with a non-uniform layout reject sizes that do not match the block at `offset`.
    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error>;

    /// Size of the device in bytes.
    fn size(&self) -> u32;

    /// Erase block sizes supported by this device.
    fn erase_sizes(&self) -> EraseSizes;
}

/// Ordered set of erase block sizes, smallest first.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EraseSizes {
    sizes: [u32; MAX_ERASE_SIZES],
    len: u8,
}

impl EraseSizes {
    pub const fn single(size: u32) -> Self {
        let mut sizes = [0; MAX_ERASE_SIZES];
        sizes[0] = size;
        Self {
            sizes,
            len: if size > 0 { 1 } else { 0 },
        }
    }

    /// Build from an arbitrary list. Zeroes and duplicates are dropped; if more than
    /// [`MAX_ERASE_SIZES`] remain, the largest ones are discarded.
    pub fn new(sizes: &[u32]) -> Self {
        let mut res = Self::default();
        for &size in sizes {
            res.insert(size);
        }
        res
    }

    fn insert(&mut self, size: u32) {
        if size == 0 || self.as_slice().contains(&size) {
            return;
        }

        let len = self.len as usize;
        let pos = self.as_slice().partition_point(|s| *s < size);
        if pos == MAX_ERASE_SIZES {
            return;
        }

        let end = usize::min(len + 1, MAX_ERASE_SIZES);
        self.sizes.copy_within(pos..end - 1, pos + 1);
        self.sizes[pos] = size;
        self.len = end as u8;
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.sizes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn smallest(&self) -> Option<u32> {
        self.as_slice().first().copied()
    }
}

/// Name of a registered storage device.
///
/// Stored as up to [`DEVICE_NAME_LEN`] printable ASCII bytes, NUL padded. The all-NUL name is
/// the empty name, used for "no device" (a slot without a filesystem, for example).
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "[u8; DEVICE_NAME_LEN]", into = "[u8; DEVICE_NAME_LEN]")]
pub struct DeviceName([u8; DEVICE_NAME_LEN]);

impl DeviceName {
    pub const EMPTY: DeviceName = DeviceName([0; DEVICE_NAME_LEN]);

    pub const fn new(name: &str) -> Result<Self, Error> {
        let bytes = name.as_bytes();
        if bytes.len() > DEVICE_NAME_LEN {
            return Err(Error::InvalidDeviceName);
        }

        let mut res = [0u8; DEVICE_NAME_LEN];
        let mut i = 0;
        while i < bytes.len() {
            if !bytes[i].is_ascii_graphic() {
                return Err(Error::InvalidDeviceName);
            }
            res[i] = bytes[i];
            i += 1;
        }

        Ok(DeviceName(res))
    }

    /// Validate a raw, NUL padded name as found in persisted configuration.
    pub fn from_bytes(bytes: [u8; DEVICE_NAME_LEN]) -> Result<Self, Error> {
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(DEVICE_NAME_LEN);
        let (name, padding) = bytes.split_at(len);
        if !name.iter().all(u8::is_ascii_graphic) || padding.iter().any(|b| *b != 0) {
            return Err(Error::InvalidDeviceName);
        }
        Ok(DeviceName(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; DEVICE_NAME_LEN] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.iter().position(|b| *b == 0).unwrap_or(DEVICE_NAME_LEN)
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn as_str(&self) -> &str {
        // Only printable ASCII gets in, so this never falls back.
        core::str::from_utf8(&self.0[..self.len()]).unwrap_or_default()
    }
}

impl TryFrom<[u8; DEVICE_NAME_LEN]> for DeviceName {
    type Error = Error;

    fn try_from(bytes: [u8; DEVICE_NAME_LEN]) -> Result<Self, Self::Error> {
        DeviceName::from_bytes(bytes)
    }
}

impl From<DeviceName> for [u8; DEVICE_NAME_LEN] {
    fn from(name: DeviceName) -> Self {
        name.0
    }
}

impl core::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DeviceName {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=str}", self.as_str())
    }
}
