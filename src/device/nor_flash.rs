use embedded_storage_async::nor_flash::NorFlash;

use crate::{
    Error,
    device::{EraseSizes, StorageDevice},
    log::debug,
};

/// Exposes any `embedded-storage-async` NOR flash (or partition thereof) as a [`StorageDevice`].
///
/// NOR flash has a single uniform erase size, reported as the only entry of
/// [`StorageDevice::erase_sizes`].
pub struct NorFlashDevice<F> {
    flash: F,
}

impl<F: NorFlash> NorFlashDevice<F> {
    pub const fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: NorFlash> StorageDevice for NorFlashDevice<F> {
    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.flash.read(offset, buf).await.map_err(|_| {
            debug!("nor read failed @ {}", offset);
            Error::Read
        })
    }

    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.flash.write(offset, data).await.map_err(|_| {
            debug!("nor write failed @ {}", offset);
            Error::Write
        })
    }

    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error> {
        let end = offset.checked_add(len).ok_or(Error::Erase)?;
        self.flash.erase(offset, end).await.map_err(|_| {
            debug!("nor erase failed @ {}", offset);
            Error::Erase
        })
    }

    fn size(&self) -> u32 {
        self.flash.capacity() as u32
    }

    fn erase_sizes(&self) -> EraseSizes {
        EraseSizes::single(F::ERASE_SIZE as u32)
    }
}
