//! Simple straightforward implementation of keeping the configuration.
//!
//! This implementation focusses on correctness and ease, contrary to efficiency and code size.
//! Leverages `sequential-storage` and `postcard` to journal the configuration on a NOR flash
//! range, with wear spread across all of its pages. `sequential-storage` keeps the previous item
//! valid until the new one is completely written, so a store is power-loss safe.

use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::{
    cache::KeyPointerCache,
    map::{SerializationError, Value},
};

use crate::{
    Error,
    log::{debug, warn},
    state::{BootConfig, ConfigStore},
};

/// Upper bound of a postcard encoded [`BootConfig`].
pub const MAX_SERIALIZED_SIZE: usize = 256;

impl<'a> Value<'a> for BootConfig {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let buffer = postcard::to_slice(self, buffer).map_err(|e| match e {
            postcard::Error::SerializeBufferFull => SerializationError::BufferTooSmall,
            // Unmapped error.
            _ => SerializationError::Custom(0),
        })?;

        Ok(buffer.len())
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        postcard::from_bytes(buffer).map_err(|e| match e {
            postcard::Error::DeserializeUnexpectedEnd => SerializationError::BufferTooSmall,
            // Stored item does not match the current layout.
            postcard::Error::DeserializeBadVarint
            | postcard::Error::DeserializeBadBool
            | postcard::Error::DeserializeBadChar
            | postcard::Error::DeserializeBadUtf8
            | postcard::Error::DeserializeBadOption
            | postcard::Error::DeserializeBadEnum
            | postcard::Error::DeserializeBadEncoding => SerializationError::InvalidFormat,
            // Unmapped error, for example an invalid device name.
            _ => SerializationError::Custom(0),
        })
    }
}

fn map_err<E>(e: sequential_storage::Error<E>) -> Error {
    match e {
        sequential_storage::Error::Corrupted { .. }
        | sequential_storage::Error::SerializationError(_) => Error::CorruptConfig,
        sequential_storage::Error::BufferTooSmall(_) | sequential_storage::Error::ItemTooBig => {
            Error::ConfigBufferTooSmall
        }
        _ => Error::Storage,
    }
}

/// Configuration journaled on a NOR flash with `PAGES` erase pages.
pub struct JournalStore<NVM: NorFlash, const PAGES: usize> {
    nvm: NVM,
    nvm_cache: KeyPointerCache<PAGES, (), 1>,
}

impl<NVM: NorFlash, const PAGES: usize> JournalStore<NVM, PAGES> {
    pub fn new(nvm: NVM) -> Self {
        Self {
            nvm,
            nvm_cache: KeyPointerCache::new(),
        }
    }

    pub fn into_inner(self) -> NVM {
        self.nvm
    }

    fn range(&self) -> core::ops::Range<u32> {
        0..self.nvm.capacity() as u32
    }
}

impl<NVM: NorFlash, const PAGES: usize> ConfigStore for JournalStore<NVM, PAGES> {
    async fn load(&mut self) -> Result<Option<BootConfig>, Error> {
        let range = self.range();
        let mut data_buffer = [0u8; MAX_SERIALIZED_SIZE];

        let config = sequential_storage::map::fetch_item::<(), BootConfig, _>(
            &mut self.nvm,
            range,
            &mut self.nvm_cache,
            &mut data_buffer,
            &(),
        )
        .await
        .map_err(map_err)?;

        match config {
            Some(config) => {
                config.validate()?;
                Ok(Some(config))
            }
            None => {
                debug!("Config NVM does not contain value");
                Ok(None)
            }
        }
    }

    async fn store(&mut self, config: &BootConfig) -> Result<(), Error> {
        let range = self.range();
        let mut data_buffer = [0u8; MAX_SERIALIZED_SIZE];

        sequential_storage::map::store_item::<(), BootConfig, _>(
            &mut self.nvm,
            range,
            &mut self.nvm_cache,
            &mut data_buffer,
            &(),
            config,
        )
        .await
        .map_err(|e| {
            warn!("Journal store failed");
            map_err(e)
        })
    }
}
