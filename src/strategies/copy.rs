//! Copy the image of one slot into another, keeping the slot bookkeeping in sync.

use crate::{
    Error,
    device::StorageDevice,
    engine::{Io, Watchdog},
    log::{error, info, warn},
    state::{ConfigManager, ConfigStore, Slot, SlotIndex, SlotState},
};

/// Copy the image of slot `src` into slot `dst`.
///
/// The destination is checksummed after the copy, and must match the source CRC if one is
/// recorded. On success the destination takes over the source image metadata, but keeps its own
/// error count. On failure the destination error count is bumped and the configuration persisted
/// before the error is returned.
///
/// The configuration is not persisted on success; that is up to the caller.
pub async fn copy_app<D, W, S, const N: usize>(
    manager: &mut ConfigManager<S>,
    io: &mut Io<'_, D, W, N>,
    src: SlotIndex,
    dst: SlotIndex,
) -> Result<(), Error>
where
    D: StorageDevice,
    W: Watchdog,
    S: ConfigStore,
{
    let config = manager.get();
    let src_slot = *config.slot(src)?;
    let dst_slot = *config.slot(dst)?;

    if !dst_slot.is_writeable() {
        error!("Slot {} is not writeable", dst);
        return Err(Error::SlotNotWriteable);
    }

    info!(
        "Copying {} ({}) -> {} ({}), {} bytes",
        src, src_slot.config.app_dev, dst, dst_slot.config.app_dev, src_slot.state.app_len
    );

    match transfer(io, &src_slot, &dst_slot).await {
        Ok(app_crc32) => {
            manager.get_mut().slot_mut(dst)?.state = SlotState {
                app_crc32,
                err_count: dst_slot.state.err_count,
                ..src_slot.state
            };
            Ok(())
        }
        Err(e) => {
            error!("Copy {} -> {} failed: {}", src, dst, e);
            manager.get_mut().slot_mut(dst)?.state.err_count += 1;
            if let Err(we) = manager.write(true).await {
                warn!("Could not record failure: {}", we);
            }
            Err(e)
        }
    }
}

/// Returns the checksum of the destination, `None` for an empty image.
async fn transfer<D: StorageDevice, W: Watchdog, const N: usize>(
    io: &mut Io<'_, D, W, N>,
    src: &Slot,
    dst: &Slot,
) -> Result<Option<u32>, Error> {
    let len = src.state.app_len;
    if len == 0 {
        return Ok(None);
    }

    io.copy(&src.config.app_dev, &dst.config.app_dev, len).await?;
    let crc = io.checksum(&dst.config.app_dev, len).await?;

    match src.state.app_crc32 {
        Some(expected) if expected != crc => {
            error!("Checksum mismatch: {:#x} vs {:#x}", crc, expected);
            Err(Error::ChecksumMismatch)
        }
        _ => Ok(Some(crc)),
    }
}
