use crate::{
    Error,
    device::{DeviceName, Registry, StorageDevice},
    engine::erase_region,
    log::{debug, error, trace},
    state::{
        BootConfig, ConfigStore,
        layout::{RECORD_SIZE, decode, encode, is_newer},
    },
};

/// Configuration stored in two equally sized regions, each holding one generation.
///
/// Loading picks the newest valid generation. Storing always goes to the other region, and the
/// old generation stays valid until the new record is completely written and verified.
pub struct DualRegionStore<'r, D, const N: usize> {
    registry: &'r Registry<D, N>,
    regions: [DeviceName; 2],
    /// Region holding the current generation, and its sequence number.
    current: Option<(usize, u32)>,
}

impl<'r, D: StorageDevice, const N: usize> DualRegionStore<'r, D, N> {
    pub const fn new(registry: &'r Registry<D, N>, regions: [DeviceName; 2]) -> Self {
        Self {
            registry,
            regions,
            current: None,
        }
    }

    async fn read_region(&self, region: usize) -> Result<Option<(BootConfig, u32)>, Error> {
        let dev = self.registry.open(&self.regions[region])?;
        let mut buf = [0u8; RECORD_SIZE];
        dev.read(0, &mut buf).await?;

        Ok(match decode(&buf) {
            Ok(res) => Some(res),
            Err(_) => {
                debug!("{}: no valid config", dev.name());
                None
            }
        })
    }

    async fn scan(&mut self) -> Result<Option<BootConfig>, Error> {
        let mut newest: Option<(usize, BootConfig, u32)> = None;

        for region in 0..self.regions.len() {
            let Some((config, seq)) = self.read_region(region).await? else {
                continue;
            };
            trace!("{}: seq {}", self.regions[region], seq);

            if newest.as_ref().is_none_or(|(_, _, best)| is_newer(seq, *best)) {
                newest = Some((region, config, seq));
            }
        }

        self.current = newest.as_ref().map(|(region, _, seq)| (*region, *seq));
        Ok(newest.map(|(_, config, _)| config))
    }
}

impl<D: StorageDevice, const N: usize> ConfigStore for DualRegionStore<'_, D, N> {
    async fn load(&mut self) -> Result<Option<BootConfig>, Error> {
        self.scan().await
    }

    async fn store(&mut self, config: &BootConfig) -> Result<(), Error> {
        if self.current.is_none() {
            // Never overwrite a generation we did not know about.
            self.scan().await?;
        }

        let (region, seq) = match self.current {
            Some((region, seq)) => (1 - region, seq.wrapping_add(1)),
            None => (0, 0),
        };

        let record = encode(config, seq);
        let dev = self.registry.open(&self.regions[region])?;
        erase_region(&dev, 0, RECORD_SIZE as u32).await?;
        dev.write(0, &record).await?;

        let mut readback = [0u8; RECORD_SIZE];
        dev.read(0, &mut readback).await?;
        if readback != record {
            error!("{}: config verify failed", dev.name());
            return Err(Error::Write);
        }

        debug!("{}: stored seq {}", dev.name(), seq);
        self.current = Some((region, seq));
        Ok(())
    }
}
