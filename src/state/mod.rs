//! Persistent boot configuration: slots, flags, active/revert selection and in-progress swap.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{Error, device::DeviceName};

mod dual_region;
pub mod layout;
#[cfg(feature = "simple_state")]
pub mod simple;
mod store;

pub use dual_region::DualRegionStore;
pub use layout::SwapPhase;
pub use store::{ConfigManager, ConfigStore};

/// Maximum number of slots a configuration can describe.
pub const MAX_SLOTS: usize = 4;

/// Index of a slot in the [`BootConfig`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotIndex(pub(crate) u8);

impl SlotIndex {
    pub const fn new(index: u8) -> Self {
        SlotIndex(index)
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Static properties of a slot.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
    pub struct SlotFlags: u32 {
        /// The slot is usable at all.
        const VALID = 1 << 0;
        /// The slot may be overwritten. Factory (recovery) slots are read-only.
        const WRITEABLE = 1 << 1;
    }
}

bitflags! {
    /// Update lifecycle flags of the whole configuration.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
    pub struct BootFlags: u32 {
        /// The running image confirmed itself; no rollback on the next reset.
        const COMMITTED = 1 << 0;
        /// Fresh update, cleared by the application once it ran.
        const FIRST_BOOT_A = 1 << 1;
        /// Fresh update, cleared by the loader on the first boot of the new image.
        const FIRST_BOOT_B = 1 << 2;
        /// Merge the filesystem of the previous slot into the new one on first boot.
        const MERGE_FS = 1 << 3;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SlotFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "SlotFlags({=u32:#x})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BootFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BootFlags({=u32:#x})", self.bits())
    }
}

/// Where a slot lives and what may be done with it. Provisioned per target.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotConfig {
    /// Device holding the application image.
    pub app_dev: DeviceName,
    /// Device holding the paired filesystem, empty if none.
    pub fs_dev: DeviceName,
    pub flags: SlotFlags,
    /// Address at which `app_dev` is directly executable, 0 if it is not mapped.
    pub app_map_addr: u32,
}

impl SlotConfig {
    pub const fn new(
        app_dev: DeviceName,
        fs_dev: DeviceName,
        flags: SlotFlags,
        app_map_addr: u32,
    ) -> Self {
        Self {
            app_dev,
            fs_dev,
            flags,
            app_map_addr,
        }
    }
}

/// What is currently installed in a slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotState {
    /// Address the image was built to run from.
    pub app_org: u32,
    pub app_len: u32,
    /// CRC-32 of the first `app_len` bytes, if known.
    pub app_crc32: Option<u32>,
    /// Opaque flags carried over from the build metadata.
    pub app_flags: u32,
    /// Number of failed operations with this slot as destination.
    pub err_count: u32,
}

impl SlotState {
    pub const fn is_empty(&self) -> bool {
        self.app_len == 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot {
    pub config: SlotConfig,
    pub state: SlotState,
}

impl Slot {
    pub const fn new(config: SlotConfig) -> Self {
        Self {
            config,
            state: SlotState {
                app_org: 0,
                app_len: 0,
                app_crc32: None,
                app_flags: 0,
                err_count: 0,
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        self.config.flags.contains(SlotFlags::VALID)
    }

    pub fn is_writeable(&self) -> bool {
        self.config.flags.contains(SlotFlags::WRITEABLE)
    }

    pub fn has_fs(&self) -> bool {
        !self.config.fs_dev.is_empty()
    }

    pub fn is_mapped(&self) -> bool {
        self.config.app_map_addr != 0
    }

    /// The image already sits where it was built to run from.
    pub fn is_directly_bootable(&self) -> bool {
        self.is_valid() && self.is_mapped() && self.config.app_map_addr == self.state.app_org
    }
}

/// Progress of an exchange of the images of slots `a` and `b`, via temporary slot `t`.
///
/// Persisted after every transition, so an interrupted swap resumes at the phase it was in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapState {
    #[default]
    Idle,
    /// Pick a temporary slot.
    Init { a: SlotIndex, b: SlotIndex },
    /// Preserve the image of `a` in `t`.
    CopyAT { a: SlotIndex, b: SlotIndex, t: SlotIndex },
    /// Move the image of `b` into `a`.
    CopyBA { a: SlotIndex, b: SlotIndex, t: SlotIndex },
    /// Move the preserved image of `a` from `t` into `b`.
    CopyTB { a: SlotIndex, b: SlotIndex, t: SlotIndex },
    /// Exchange filesystems and slot references of `a` and `b`.
    Commit { a: SlotIndex, b: SlotIndex, t: SlotIndex },
}

impl SwapState {
    pub const fn is_idle(&self) -> bool {
        matches!(self, SwapState::Idle)
    }

    fn slots(&self) -> [Option<SlotIndex>; 3] {
        match *self {
            SwapState::Idle => [None; 3],
            SwapState::Init { a, b } => [Some(a), Some(b), None],
            SwapState::CopyAT { a, b, t }
            | SwapState::CopyBA { a, b, t }
            | SwapState::CopyTB { a, b, t }
            | SwapState::Commit { a, b, t } => [Some(a), Some(b), Some(t)],
        }
    }
}

/// Root of the persisted loader state.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootConfig {
    num_slots: u8,
    slots: [Slot; MAX_SLOTS],
    /// Slot to boot.
    pub active_slot: SlotIndex,
    /// Slot to fall back to when the active slot never commits.
    pub revert_slot: Option<SlotIndex>,
    pub flags: BootFlags,
    pub swap: SwapState,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BootConfig {
    /// Committed configuration without any slots, booting slot 0.
    pub const fn new() -> Self {
        Self {
            num_slots: 0,
            slots: [Slot::new(SlotConfig::new(
                DeviceName::EMPTY,
                DeviceName::EMPTY,
                SlotFlags::empty(),
                0,
            )); MAX_SLOTS],
            active_slot: SlotIndex(0),
            revert_slot: None,
            flags: BootFlags::COMMITTED,
            swap: SwapState::Idle,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots as usize
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots[..self.num_slots()]
    }

    pub fn indices(&self) -> impl Iterator<Item = SlotIndex> + use<> {
        (0..self.num_slots).map(SlotIndex)
    }

    /// Append a slot, returning its index.
    pub fn push_slot(&mut self, slot: Slot) -> Result<SlotIndex, Error> {
        let index = self.num_slots();
        let entry = self.slots.get_mut(index).ok_or(Error::InvalidSlot)?;
        *entry = slot;
        self.num_slots += 1;
        Ok(SlotIndex(index as u8))
    }

    pub fn slot(&self, index: SlotIndex) -> Result<&Slot, Error> {
        self.slots().get(index.get()).ok_or(Error::InvalidSlot)
    }

    pub fn slot_mut(&mut self, index: SlotIndex) -> Result<&mut Slot, Error> {
        let num_slots = self.num_slots();
        self.slots[..num_slots]
            .get_mut(index.get())
            .ok_or(Error::InvalidSlot)
    }

    pub fn active(&self) -> Result<&Slot, Error> {
        self.slot(self.active_slot)
    }

    /// Check every slot reference points at a configured slot.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_slots() > MAX_SLOTS {
            return Err(Error::CorruptConfig);
        }

        let in_range = |index: SlotIndex| index.get() < self.num_slots();
        let referenced = [Some(self.active_slot), self.revert_slot]
            .into_iter()
            .chain(self.swap.slots())
            .flatten();

        for index in referenced {
            if !in_range(index) {
                return Err(Error::CorruptConfig);
            }
        }
        Ok(())
    }

    /// Find a valid slot mapped at `map_addr`, other than `exclude_a` and `exclude_b`.
    ///
    /// With `want_fs`, only slots with a filesystem qualify, and when none is mapped at
    /// `map_addr` the first writeable one is returned instead. A zero `map_addr` never matches,
    /// as it marks slots that are not mapped at all.
    pub fn find_slot(
        &self,
        map_addr: u32,
        want_fs: bool,
        exclude_a: Option<SlotIndex>,
        exclude_b: Option<SlotIndex>,
    ) -> Option<SlotIndex> {
        let eligible = |index: &SlotIndex| {
            let slot = &self.slots[index.get()];
            slot.is_valid()
                && Some(*index) != exclude_a
                && Some(*index) != exclude_b
                && (!want_fs || slot.has_fs())
        };

        if map_addr != 0 {
            let mapped = self
                .indices()
                .filter(eligible)
                .find(|index| self.slots[index.get()].config.app_map_addr == map_addr);
            if mapped.is_some() {
                return mapped;
            }
        }

        if want_fs {
            return self
                .indices()
                .filter(eligible)
                .find(|index| self.slots[index.get()].is_writeable());
        }

        None
    }

    /// Find a slot that can hold an image while `a` and `b` are exchanged.
    ///
    /// The revert slot holds the rollback image and is only used when it is one of the pair.
    /// Slots without a filesystem and without a mapping are the least valuable, so they are
    /// preferred.
    pub fn find_temp_slot(&self, a: SlotIndex, b: SlotIndex) -> Option<SlotIndex> {
        self.indices()
            .filter(|index| *index != a && *index != b)
            .filter(|index| Some(*index) != self.revert_slot)
            .filter(|index| {
                let slot = &self.slots[index.get()];
                slot.is_valid() && slot.is_writeable()
            })
            .min_by_key(|index| {
                let slot = &self.slots[index.get()];
                (slot.has_fs(), slot.is_mapped())
            })
    }

    /// Exchange the filesystems of `a` and `b`.
    ///
    /// Read-only slots keep their filesystem, so nothing changes unless both are writeable.
    pub fn swap_fs_devs(&mut self, a: SlotIndex, b: SlotIndex) -> Result<(), Error> {
        if !self.slot(a)?.is_writeable() || !self.slot(b)?.is_writeable() {
            return Ok(());
        }

        let fs_a = self.slot(a)?.config.fs_dev;
        let fs_b = self.slot(b)?.config.fs_dev;
        self.slot_mut(a)?.config.fs_dev = fs_b;
        self.slot_mut(b)?.config.fs_dev = fs_a;
        Ok(())
    }

    /// Make `active_slot` and `revert_slot` follow images that moved between `a` and `b`.
    pub fn exchange_refs(&mut self, a: SlotIndex, b: SlotIndex) {
        let exchange = |index: SlotIndex| match index {
            i if i == a => b,
            i if i == b => a,
            i => i,
        };

        self.active_slot = exchange(self.active_slot);
        self.revert_slot = self.revert_slot.map(exchange);
    }
}
