//! Boot decision: finish an interrupted swap, handle commit and rollback, make the active image
//! bootable, verify it and hand off to it.

use crate::{
    Error,
    boot::{AppLayout, Boot, VectorTable},
    device::{Registry, StorageDevice},
    engine::{IO_SIZE, Io, Watchdog},
    log::{debug, error, info, warn},
    state::{BootConfig, BootFlags, ConfigManager, ConfigStore, SlotIndex},
    strategies::swap_sabs,
};

/// Watchdog timeout configured before any I/O.
pub const WATCHDOG_TIMEOUT_SECS: u32 = 10;

/// Target specific glue the loader relies on.
pub trait Platform {
    type Boot: Boot;

    /// Boot the application through a clean reset: the verified address is recorded with
    /// [`Self::set_pending_boot`] and picked up by the next run of the loader, before any
    /// peripheral is touched.
    const BOOT_VIA_RESTART: bool = false;

    /// First ever boot of this device: ignore whatever configuration is stored.
    fn should_write_defaults(&mut self) -> bool {
        false
    }

    /// Populate the slots of a fresh configuration.
    fn default_slots(&mut self, config: &mut BootConfig) -> Result<(), Error>;

    /// Memory map to check vector tables against. `None` skips the check.
    fn app_layout(&self) -> Option<AppLayout> {
        None
    }

    /// Take the address recorded by [`Self::set_pending_boot`], clearing it.
    fn take_pending_boot(&mut self) -> Option<u32> {
        None
    }

    /// Record an address to boot directly on the next reset. Must survive a soft reset.
    fn set_pending_boot(&mut self, _app_org: u32) {}

    fn restart(&mut self) -> !;

    /// Terminal failure state. Only a watchdog or operator reset gets us out of here.
    fn halt(&mut self) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

/// Steps of a boot decision. Any step can fail, which halts the loader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootPhase {
    /// Finish a swap that was interrupted by a reset.
    ResumeSwap,
    /// Roll back an update that never committed itself.
    CommitCheck,
    /// Move the active image into a slot it can run from.
    SlotSelect,
    /// Checksum and sanity check the active image.
    Verify,
    Handoff,
}

/// The image to jump to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootTarget {
    pub slot: SlotIndex,
    pub app_org: u32,
}

pub struct Loader<'r, D, W, S, P, const N: usize> {
    io: Io<'r, D, W, N>,
    manager: ConfigManager<S>,
    platform: P,
}

impl<'r, D, W, S, P, const N: usize> Loader<'r, D, W, S, P, N>
where
    D: StorageDevice,
    W: Watchdog,
    S: ConfigStore,
    P: Platform,
{
    pub fn new(registry: &'r Registry<D, N>, watchdog: W, store: S, platform: P) -> Self {
        Self {
            io: Io::new(registry, watchdog),
            manager: ConfigManager::new(store),
            platform,
        }
    }

    pub fn config(&self) -> &BootConfig {
        self.manager.get()
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Boot an address recorded before the last reset, if any. Call this before anything else.
    pub fn boot_pending(&mut self) {
        if let Some(app_org) = self.platform.take_pending_boot() {
            info!("Booting pending {:#x}", app_org);
            // SAFETY: only verified images are recorded as pending.
            unsafe { P::Boot::boot(app_org as usize as *const u32) }
        }
    }

    /// Decide what to boot.
    pub async fn run(&mut self) -> Result<BootTarget, Error> {
        self.init().await?;
        let target = self.decide().await?;
        self.io.registry.check_released()?;
        Ok(target)
    }

    /// Boot the outcome of [`Self::run`], or halt on failure.
    pub fn finish(mut self, outcome: Result<BootTarget, Error>) -> ! {
        let target = match outcome {
            Ok(target) => target,
            Err(e) if e.is_io() => {
                error!("FAIL: {}, storage may be damaged", e);
                self.platform.halt()
            }
            Err(e) => {
                error!("FAIL: {}", e);
                self.platform.halt()
            }
        };

        info!("Booting slot {} ({:#x})", target.slot, target.app_org);
        if P::BOOT_VIA_RESTART {
            self.platform.set_pending_boot(target.app_org);
            self.platform.restart()
        }

        // SAFETY: the image at `app_org` passed verification.
        unsafe { P::Boot::boot(target.app_org as usize as *const u32) }
    }

    async fn init(&mut self) -> Result<(), Error> {
        self.io.watchdog.enable();
        self.io.watchdog.set_timeout(WATCHDOG_TIMEOUT_SECS);

        let force_defaults = self.platform.should_write_defaults();
        let platform = &mut self.platform;
        self.manager
            .init(force_defaults, |config| platform.default_slots(config))
            .await?;

        if self.manager.is_fresh() {
            self.fill_slot_images().await?;
        } else {
            self.manager.dump();
        }

        self.io.watchdog.feed();
        Ok(())
    }

    /// Complete the image records of directly bootable default slots from what their devices
    /// hold: length defaults to the whole device, the CRC to that of the current contents.
    async fn fill_slot_images(&mut self) -> Result<(), Error> {
        let mut changed = false;

        for index in self.manager.get().indices() {
            let slot = *self.manager.get().slot(index)?;
            if !slot.is_directly_bootable() {
                continue;
            }

            let mut state = slot.state;
            if state.app_len == 0 {
                state.app_len = self.io.registry.open(&slot.config.app_dev)?.size();
            }
            if state.app_crc32.is_none() {
                let crc = self.io.checksum(&slot.config.app_dev, state.app_len).await?;
                state.app_crc32 = Some(crc);
            }

            if state != slot.state {
                info!("Slot {}: len {} crc {:?}", index, state.app_len, state.app_crc32);
                self.manager.get_mut().slot_mut(index)?.state = state;
                changed = true;
            }
        }

        if changed {
            self.manager.write(true).await?;
        }
        Ok(())
    }

    /// Walk the boot phases, returning the verified image to boot.
    pub async fn decide(&mut self) -> Result<BootTarget, Error> {
        let mut phase = BootPhase::ResumeSwap;
        loop {
            debug!("Phase {:?}", phase);
            phase = match phase {
                BootPhase::ResumeSwap => {
                    if !self.manager.get().swap.is_idle() {
                        info!("Resuming swap {:?}", self.manager.get().swap);
                        swap_sabs::run(&mut self.manager, &mut self.io).await?;
                    }
                    BootPhase::CommitCheck
                }
                BootPhase::CommitCheck => {
                    self.commit_check().await?;
                    BootPhase::SlotSelect
                }
                BootPhase::SlotSelect => {
                    self.select_slot().await?;
                    BootPhase::Verify
                }
                BootPhase::Verify => {
                    self.verify().await?;
                    BootPhase::Handoff
                }
                BootPhase::Handoff => break,
            };
        }

        let config = self.manager.get();
        Ok(BootTarget {
            slot: config.active_slot,
            app_org: config.active()?.state.app_org,
        })
    }

    async fn commit_check(&mut self) -> Result<(), Error> {
        let config = self.manager.get_mut();
        if config.flags.contains(BootFlags::COMMITTED) {
            return Ok(());
        }

        if config.flags.contains(BootFlags::FIRST_BOOT_B) {
            info!("First boot of slot {}", config.active_slot);
            config.flags.remove(BootFlags::FIRST_BOOT_B);
        } else {
            match config.revert_slot.take() {
                Some(revert) => {
                    warn!("Reboot without commit, reverting to {}", revert);
                    config.active_slot = revert;
                }
                None => {
                    warn!("Reboot without commit, nothing to revert to");
                }
            }
            config.flags.insert(BootFlags::COMMITTED);
            config.flags.remove(BootFlags::FIRST_BOOT_A | BootFlags::MERGE_FS);
        }

        self.manager.write(false).await
    }

    async fn select_slot(&mut self) -> Result<(), Error> {
        let config = self.manager.get();
        let active = config.active_slot;
        let slot = config.active()?;
        if slot.is_directly_bootable() {
            return Ok(());
        }
        if slot.state.is_empty() {
            error!("Slot {} is empty", active);
            return Err(Error::EmptyImage);
        }

        let app_org = slot.state.app_org;
        let Some(bootable) = config.find_slot(app_org, false, Some(active), None) else {
            error!("No slot available @ {:#x}", app_org);
            return Err(Error::NoBootableSlot);
        };

        info!("Slot {} is not bootable, will use {}", active, bootable);
        swap_sabs::swap(&mut self.manager, &mut self.io, bootable, active).await
    }

    async fn verify(&mut self) -> Result<(), Error> {
        let config = self.manager.get();
        let active = config.active_slot;
        let slot = *config.active()?;

        if !slot.is_directly_bootable() {
            error!("Slot {} is not bootable", active);
            return Err(Error::NoBootableSlot);
        }
        if slot.state.is_empty() {
            error!("Slot {} is empty", active);
            return Err(Error::EmptyImage);
        }
        let Some(expected) = slot.state.app_crc32 else {
            error!("Slot {} has no checksum", active);
            return Err(Error::NoChecksum);
        };

        let crc = self
            .io
            .checksum(&slot.config.app_dev, slot.state.app_len)
            .await?;
        if crc != expected {
            error!("App CRC mismatch: {:#x} vs {:#x}", crc, expected);
            return Err(Error::ChecksumMismatch);
        }

        if let Some(layout) = self.platform.app_layout() {
            let dev = self.io.registry.open(&slot.config.app_dev)?;
            let mut buf = [0u8; IO_SIZE];
            dev.read(0, &mut buf).await?;

            let mut vectors = [0u8; VectorTable::SIZE];
            vectors.copy_from_slice(&buf[..VectorTable::SIZE]);
            let vectors = VectorTable::from_bytes(&vectors);
            debug!("SP {:#x}, entry {:#x}", vectors.initial_sp, vectors.reset);
            vectors.check(slot.state.app_org, &layout)?;
        }

        Ok(())
    }

    /// Tear down, handing back the configuration store and platform.
    pub fn deinit(self) -> (S, P) {
        (self.manager.deinit(), self.platform)
    }
}
