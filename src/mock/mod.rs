use std::{collections::BTreeMap, vec, vec::Vec};

use embedded_storage_async::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::{
    Error,
    boot::{AppLayout, Boot},
    device::{DeviceName, EraseSizes, StorageDevice},
    engine::Watchdog,
    loader::Platform,
    state::{
        BootConfig, ConfigStore, Slot, SlotConfig, SlotFlags, SlotIndex,
        layout::{RECORD_SIZE, decode, encode},
    },
};

pub fn name(name: &str) -> DeviceName {
    DeviceName::new(name).unwrap()
}

/// Deterministic pseudo-random image contents.
pub fn image(seed: u32, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9e37_79b9) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

/// Erase counts per block offset.
#[derive(Debug, Default)]
pub struct WearTracker(BTreeMap<u32, usize>);

impl WearTracker {
    pub fn increase(&mut self, offset: u32) {
        *self.0.entry(offset).or_default() += 1;
    }

    /// Worst wear of any block.
    pub fn max(&self) -> usize {
        self.0.values().copied().max().unwrap_or(0)
    }
}

/// RAM backed storage device with fault injection.
///
/// Writes only succeed on erased (0xff) bytes. Logs of `writes` and `erases` only record
/// operations that succeeded.
#[derive(Debug)]
pub struct MockDevice {
    pub data: Vec<u8>,
    pub erase_sizes: EraseSizes,
    /// Non-uniform layout: only these exact `(offset, size)` blocks can be erased.
    pub sectors: Option<Vec<(u32, u32)>>,
    pub reads: Vec<(u32, u32)>,
    pub writes: Vec<(u32, u32)>,
    pub erases: Vec<(u32, u32)>,
    pub wear: WearTracker,
    pub fail_read_at: Option<u32>,
    pub fail_write_at: Option<u32>,
    pub fail_erase: bool,
}

impl MockDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xff; size],
            erase_sizes: EraseSizes::single(4096),
            sectors: None,
            reads: Vec::new(),
            writes: Vec::new(),
            erases: Vec::new(),
            wear: WearTracker::default(),
            fail_read_at: None,
            fail_write_at: None,
            fail_erase: false,
        }
    }

    pub fn with_image(size: usize, image: &[u8]) -> Self {
        let mut dev = Self::new(size);
        dev.data[..image.len()].copy_from_slice(image);
        dev
    }

    pub fn with_sectors(sectors: &[u32]) -> Self {
        let mut layout = Vec::new();
        let mut offset = 0;
        for &size in sectors {
            layout.push((offset, size));
            offset += size;
        }

        let mut dev = Self::new(offset as usize);
        dev.erase_sizes = EraseSizes::new(sectors);
        dev.sectors = Some(layout);
        dev
    }

    fn range(&self, offset: u32, len: usize) -> Option<core::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    fn hits(at: Option<u32>, offset: u32, len: usize) -> bool {
        at.is_some_and(|at| at >= offset && ((at - offset) as usize) < len)
    }
}

impl StorageDevice for MockDevice {
    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        if Self::hits(self.fail_read_at, offset, buf.len()) {
            return Err(Error::Read);
        }
        let range = self.range(offset, buf.len()).ok_or(Error::Read)?;
        buf.copy_from_slice(&self.data[range]);
        self.reads.push((offset, buf.len() as u32));
        Ok(())
    }

    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        if Self::hits(self.fail_write_at, offset, data.len()) {
            return Err(Error::Write);
        }
        let range = self.range(offset, data.len()).ok_or(Error::Write)?;
        if self.data[range.clone()].iter().any(|b| *b != 0xff) {
            return Err(Error::Write);
        }
        self.data[range].copy_from_slice(data);
        self.writes.push((offset, data.len() as u32));
        Ok(())
    }

    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error> {
        if self.fail_erase {
            return Err(Error::Erase);
        }
        let accepted = match &self.sectors {
            Some(sectors) => sectors.contains(&(offset, len)),
            None => self.erase_sizes.as_slice().contains(&len) && offset % len == 0,
        };
        if !accepted {
            return Err(Error::Erase);
        }
        let range = self.range(offset, len as usize).ok_or(Error::Erase)?;
        self.data[range].fill(0xff);
        self.erases.push((offset, len));
        self.wear.increase(offset);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_sizes(&self) -> EraseSizes {
        self.erase_sizes
    }
}

#[derive(Debug, Default)]
pub struct CountingWatchdog {
    pub feeds: usize,
    pub enabled: bool,
    pub timeout: Option<u32>,
}

impl Watchdog for CountingWatchdog {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn set_timeout(&mut self, seconds: u32) {
        self.timeout = Some(seconds);
    }

    fn feed(&mut self) {
        self.feeds += 1;
    }
}

#[derive(Debug)]
pub struct MockNorFlashError(NorFlashErrorKind);

impl NorFlashError for MockNorFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// NOR flash with AND-on-write semantics.
pub struct MockNorFlash {
    pub data: Vec<u8>,
}

impl MockNorFlash {
    pub const CAPACITY: usize = 8192;

    pub fn new() -> Self {
        Self {
            data: vec![0xff; Self::CAPACITY],
        }
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<usize, MockNorFlashError> {
        let start = offset as usize;
        if start + len > self.data.len() {
            return Err(MockNorFlashError(NorFlashErrorKind::OutOfBounds));
        }
        if start % align != 0 || len % align != 0 {
            return Err(MockNorFlashError(NorFlashErrorKind::NotAligned));
        }
        Ok(start)
    }
}

impl ErrorType for MockNorFlash {
    type Error = MockNorFlashError;
}

impl ReadNorFlash for MockNorFlash {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = self.check(offset, bytes.len(), Self::READ_SIZE)?;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MockNorFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 1024;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let len = to.saturating_sub(from) as usize;
        let start = self.check(from, len, Self::ERASE_SIZE)?;
        self.data[start..start + len].fill(0xff);
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        for (cell, byte) in self.data[start..].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Config store in RAM that can be told to lose power after a number of writes.
pub struct MemoryStore {
    pub record: Option<[u8; RECORD_SIZE]>,
    pub writes: usize,
    /// Number of stores that still succeed. Once exhausted, every store fails and leaves the
    /// previous record in place.
    pub power_budget: Option<usize>,
    seq: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            record: None,
            writes: 0,
            power_budget: None,
            seq: 0,
        }
    }

    pub fn with_config(config: &BootConfig) -> Self {
        let mut store = Self::new();
        store.record = Some(encode(config, 0));
        store.seq = 1;
        store
    }

    pub fn stored(&self) -> Option<BootConfig> {
        self.record.map(|record| decode(&record).unwrap().0)
    }
}

impl ConfigStore for MemoryStore {
    async fn load(&mut self) -> Result<Option<BootConfig>, Error> {
        match self.record {
            Some(record) => Ok(Some(decode(&record)?.0)),
            None => Ok(None),
        }
    }

    async fn store(&mut self, config: &BootConfig) -> Result<(), Error> {
        if let Some(budget) = self.power_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Storage);
            }
            *budget -= 1;
        }
        self.record = Some(encode(config, self.seq));
        self.seq = self.seq.wrapping_add(1);
        self.writes += 1;
        Ok(())
    }
}

/// How a test run left the loader, carried as the panic payload of the diverging platform calls.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Handoff {
    Boot(u32),
    Restart { pending: Option<u32> },
    Halt,
}

/// Run `f` until it hands off, returning how it did.
pub fn handoff(f: impl FnOnce()) -> Handoff {
    let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_err();
    *payload.downcast::<Handoff>().unwrap()
}

pub struct NoBoot;

impl Boot for NoBoot {
    unsafe fn boot(addr: *const u32) -> ! {
        std::panic::panic_any(Handoff::Boot(addr as usize as u32))
    }
}

/// Platform with fixed defaults, booting through a restart when `RESTART` is set.
pub struct MockPlatform<const RESTART: bool = false> {
    pub defaults: BootConfig,
    pub first_boot: bool,
    pub layout: Option<AppLayout>,
    pub pending_boot: Option<u32>,
}

impl<const RESTART: bool> MockPlatform<RESTART> {
    pub fn new(defaults: BootConfig) -> Self {
        Self {
            defaults,
            first_boot: false,
            layout: None,
            pending_boot: None,
        }
    }
}

impl<const RESTART: bool> Platform for MockPlatform<RESTART> {
    type Boot = NoBoot;

    const BOOT_VIA_RESTART: bool = RESTART;

    fn should_write_defaults(&mut self) -> bool {
        self.first_boot
    }

    fn default_slots(&mut self, config: &mut BootConfig) -> Result<(), Error> {
        *config = self.defaults.clone();
        Ok(())
    }

    fn app_layout(&self) -> Option<AppLayout> {
        self.layout.clone()
    }

    fn take_pending_boot(&mut self) -> Option<u32> {
        self.pending_boot.take()
    }

    fn set_pending_boot(&mut self, app_org: u32) {
        self.pending_boot = Some(app_org);
    }

    fn restart(&mut self) -> ! {
        std::panic::panic_any(Handoff::Restart {
            pending: self.pending_boot,
        })
    }

    fn halt(&mut self) -> ! {
        std::panic::panic_any(Handoff::Halt)
    }
}

pub const APP_ORG: u32 = 0x0801_0000;

pub const RW: SlotFlags = SlotFlags::VALID.union(SlotFlags::WRITEABLE);

pub fn slot(app_dev: &str, fs_dev: &str, flags: SlotFlags, app_map_addr: u32) -> Slot {
    Slot::new(SlotConfig::new(
        name(app_dev),
        name(fs_dev),
        flags,
        app_map_addr,
    ))
}

/// Internal flash slot `app0` (mapped), external slot `app1`, and temp slot `app2`.
pub fn three_slot_config() -> BootConfig {
    let mut config = BootConfig::new();
    config.push_slot(slot("app0", "fs0", RW, APP_ORG)).unwrap();
    config.push_slot(slot("app1", "fs1", RW, 0)).unwrap();
    config.push_slot(slot("app2", "", RW, 0)).unwrap();
    config.slot_mut(SlotIndex(0)).unwrap().state.app_org = APP_ORG;
    config
}

/// Read-only factory slot `appF` (mapped), external slot `app1`, and temp slot `app2`.
pub fn factory_config() -> BootConfig {
    let mut config = BootConfig::new();
    config
        .push_slot(slot("appF", "fsF", SlotFlags::VALID, APP_ORG))
        .unwrap();
    config.push_slot(slot("app1", "fs1", RW, 0)).unwrap();
    config.push_slot(slot("app2", "", RW, 0)).unwrap();
    config.slot_mut(SlotIndex(0)).unwrap().state.app_org = APP_ORG;
    config
}

pub const DEVICE_SIZE: usize = 16384;

/// Registry of `DEVICE_SIZE` devices, each holding the given contents.
pub fn registry<const N: usize>(devices: [(&str, &[u8]); N]) -> crate::Registry<MockDevice, N> {
    crate::Registry::new(
        devices.map(|(dev, data)| (name(dev), MockDevice::with_image(DEVICE_SIZE, data))),
    )
}

/// Record `data` as the image of `slot`, built to run from [`APP_ORG`].
pub fn install(config: &mut BootConfig, slot: u8, data: &[u8]) {
    let state = &mut config.slot_mut(SlotIndex(slot)).unwrap().state;
    state.app_org = APP_ORG;
    state.app_len = data.len() as u32;
    state.app_crc32 = Some(crate::engine::CRC32.checksum(data));
}

pub const EMPTY: &[u8] = &[];
