use crate::{
    Error,
    device::{DeviceHandle, EraseSizes, StorageDevice},
    engine::{IO_SIZE, PROGRESS_INTERVAL, Watchdog, padded_len},
    log::{debug, error, trace},
};

/// Copy the first `len` bytes of `src` to `dst`, erasing `dst` ahead of the writes.
///
/// Both devices see only whole [`IO_SIZE`] transfers. Every destination byte is erased at most
/// once per call. Aborts on the first read, erase or write error; verifying the result is up to
/// the caller.
pub async fn copy<D: StorageDevice>(
    src: &DeviceHandle<'_, D>,
    dst: &DeviceHandle<'_, D>,
    len: u32,
    watchdog: &mut impl Watchdog,
) -> Result<(), Error> {
    debug!("{} --> {} ({})", src.name(), dst.name(), len);

    let mut buf = [0u8; IO_SIZE];
    let erase_sizes = dst.erase_sizes();
    let limit = padded_len(len);
    let mut offset = 0u32;
    let mut erased_until = 0u32;

    while offset < len {
        let data_len = u32::min(len - offset, IO_SIZE as u32);

        src.read(offset, &mut buf).await.inspect_err(|e| {
            error!("Read err {} @ {}: {}", src.name(), offset, e);
        })?;

        let chunk_end = offset + IO_SIZE as u32;
        while erased_until < chunk_end {
            erased_until +=
                erase_block(dst, &erase_sizes, erased_until, limit - erased_until).await?;
        }

        dst.write(offset, &buf).await.inspect_err(|e| {
            error!("Write err {} @ {}: {}", dst.name(), offset, e);
        })?;

        watchdog.feed();

        offset += data_len;
        if offset % PROGRESS_INTERVAL == 0 {
            trace!("{}: {}/{}", dst.name(), offset, len);
        }
    }

    debug!("{} --> {} ok", src.name(), dst.name());
    Ok(())
}

/// Erase `len` bytes of `dev` starting at `offset`, using the largest erase blocks that fit.
pub async fn erase_region<D: StorageDevice>(
    dev: &DeviceHandle<'_, D>,
    offset: u32,
    len: u32,
) -> Result<(), Error> {
    let erase_sizes = dev.erase_sizes();
    let end = offset.checked_add(len).ok_or(Error::Erase)?;

    let mut at = offset;
    while at < end {
        at += erase_block(dev, &erase_sizes, at, end - at).await?;
    }
    Ok(())
}

/// Erase one block at `offset`, returning its size.
///
/// Candidates are the sizes not exceeding `remaining`, largest first, followed by the larger
/// sizes, smallest first. Devices with a non-uniform layout reject sizes that do not match the
/// block at `offset`, so the first size the device accepts wins.
async fn erase_block<D: StorageDevice>(
    dev: &DeviceHandle<'_, D>,
    erase_sizes: &EraseSizes,
    offset: u32,
    remaining: u32,
) -> Result<u32, Error> {
    let sizes = erase_sizes.as_slice();
    let (fitting, larger) = sizes.split_at(sizes.partition_point(|size| *size <= remaining));

    for &size in fitting.iter().rev().chain(larger) {
        if dev.erase(offset, size).await.is_ok() {
            trace!("Erased {} @ {} ({})", dev.name(), offset, size);
            return Ok(size);
        }
    }

    error!("Erase err {} @ {}", dev.name(), offset);
    Err(Error::Erase)
}
