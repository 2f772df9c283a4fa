//! Streaming primitives that move and verify images between devices.
//!
//! All I/O goes through a single fixed-size chunk, [`IO_SIZE`], which satisfies block cipher
//! alignment of encrypting devices and matches common NAND page sizes while bounding RAM use.

use crate::{
    Error,
    device::{DeviceName, Registry, StorageDevice},
};

mod checksum;
mod copy;

pub use checksum::checksum;
pub(crate) use checksum::CRC32;
pub use copy::{copy, erase_region};

/// Size of every read and write issued by the engine, even for a final short chunk.
pub const IO_SIZE: usize = 2048;

/// Progress is reported every this many bytes.
pub const PROGRESS_INTERVAL: u32 = 65536;

/// Hardware watchdog, fed during long-running loops so it does not reset us mid-copy.
pub trait Watchdog {
    fn enable(&mut self) {}

    fn set_timeout(&mut self, _seconds: u32) {}

    fn feed(&mut self);
}

/// No watchdog.
impl Watchdog for () {
    fn feed(&mut self) {}
}

impl<W: Watchdog> Watchdog for &mut W {
    fn enable(&mut self) {
        (**self).enable()
    }

    fn set_timeout(&mut self, seconds: u32) {
        (**self).set_timeout(seconds)
    }

    fn feed(&mut self) {
        (**self).feed()
    }
}

/// Device registry plus the watchdog to feed while doing I/O on it.
pub struct Io<'r, D, W, const N: usize> {
    pub registry: &'r Registry<D, N>,
    pub watchdog: W,
}

impl<'r, D: StorageDevice, W: Watchdog, const N: usize> Io<'r, D, W, N> {
    pub const fn new(registry: &'r Registry<D, N>, watchdog: W) -> Self {
        Self { registry, watchdog }
    }

    /// CRC-32 of the first `len` bytes of the named device.
    pub async fn checksum(&mut self, name: &DeviceName, len: u32) -> Result<u32, Error> {
        let dev = self.registry.open(name)?;
        checksum(&dev, len, &mut self.watchdog).await
    }

    /// Copy the first `len` bytes of `src` to `dst`.
    pub async fn copy(
        &mut self,
        src: &DeviceName,
        dst: &DeviceName,
        len: u32,
    ) -> Result<(), Error> {
        let src = self.registry.open(src)?;
        let dst = self.registry.open(dst)?;
        copy(&src, &dst, len, &mut self.watchdog).await
    }
}

/// `len` rounded up to whole I/O chunks.
pub(crate) const fn padded_len(len: u32) -> u32 {
    len.div_ceil(IO_SIZE as u32) * IO_SIZE as u32
}
