use crc::{CRC_32_ISO_HDLC, Crc};

use crate::{
    Error,
    device::{DeviceHandle, StorageDevice},
    engine::{IO_SIZE, PROGRESS_INTERVAL, Watchdog},
    log::{debug, error, trace},
};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of the first `len` bytes of `dev`.
///
/// The device is read in whole [`IO_SIZE`] chunks, so it must be readable up to `len` rounded up
/// to the chunk size. A read error aborts the computation.
pub async fn checksum<D: StorageDevice>(
    dev: &DeviceHandle<'_, D>,
    len: u32,
    watchdog: &mut impl Watchdog,
) -> Result<u32, Error> {
    debug!("Checksum {} ({})", dev.name(), len);

    let mut buf = [0u8; IO_SIZE];
    let mut digest = CRC32.digest();
    let mut offset = 0u32;

    while offset < len {
        let data_len = u32::min(len - offset, IO_SIZE as u32);

        dev.read(offset, &mut buf).await.inspect_err(|e| {
            error!("Read err {} @ {}: {}", dev.name(), offset, e);
        })?;

        digest.update(&buf[..data_len as usize]);
        watchdog.feed();

        offset += data_len;
        if offset % PROGRESS_INTERVAL == 0 {
            trace!("{}: {}/{}", dev.name(), offset, len);
        }
    }

    let crc = digest.finalize();
    debug!("{}: {:#x}", dev.name(), crc);
    Ok(crc)
}
