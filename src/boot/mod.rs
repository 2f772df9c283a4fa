use core::ops::Range;

use crate::{Error, log::error};

#[cfg(feature = "cortex_m")]
pub mod cortex_m;

/// Bootload mechanism that at the least jumps to the address an image was built to run from.
///
/// Optionally could drop TrustZone privileges or mask memory access.
pub trait Boot {
    /// Address of the start of the image, pointing to its vector table.
    ///
    /// # Safety
    /// `addr` must point at the verified vector table of an image mapped at that address.
    unsafe fn boot(addr: *const u32) -> !;
}

/// Memory map used to sanity check an image before jumping to it.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppLayout {
    /// Executable flash, in CPU addresses.
    pub flash: Range<u32>,
    /// RAM the initial stack pointer must point into. The end is a valid (empty, full
    /// descending) stack pointer.
    pub ram: Range<u32>,
}

/// The first two entries of an ARM vector table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VectorTable {
    pub initial_sp: u32,
    pub reset: u32,
}

impl VectorTable {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            initial_sp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            reset: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Check this table, located at `app_org`, points into `layout`.
    pub fn check(&self, app_org: u32, layout: &AppLayout) -> Result<(), Error> {
        if !layout.flash.contains(&app_org) {
            error!("Invalid app address {:#x}", app_org);
            return Err(Error::InvalidVectors);
        }

        let sp_ok = self.initial_sp >= layout.ram.start && self.initial_sp <= layout.ram.end;
        let entry_ok = self.reset >= app_org && self.reset < layout.flash.end;
        if !sp_ok || !entry_ok {
            error!(
                "Invalid vectors: SP {:#x}, entry {:#x}",
                self.initial_sp, self.reset
            );
            return Err(Error::InvalidVectors);
        }

        Ok(())
    }
}
