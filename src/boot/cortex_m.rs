use cortex_m::peripheral::SCB;

use crate::boot::Boot;

/// Simple bootload mechanism for Cortex-M without support for TrustZone.
///
/// Relocates the vector table to the image, then loads its initial stack pointer and branches to
/// its reset handler.
pub struct SimpleCortexM;

impl Boot for SimpleCortexM {
    unsafe fn boot(addr: *const u32) -> ! {
        unsafe {
            (*SCB::PTR).vtor.write(addr as u32);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            cortex_m::asm::bootload(addr)
        }
    }
}
