//! Strategy to swap the images of two slots using 'T <- A <- B <- T'.
//!
//! In other bootloaders also called 'swap scratch'. A temporary slot (T) holds the image of A while
//! the image of B is moved into A, and is then moved on into B. Afterwards the filesystems of A and
//! B are exchanged, and the active and revert slot references follow their images.
//!
//! Every phase is persisted in the [`BootConfig`](crate::BootConfig) before the next one
//! executes. Re-running a phase against its own output yields the same result, so a reset at any
//! point resumes by redoing at most the phase that was interrupted.
//!
//! A read-only slot (a factory image) is never written: the copy into it is skipped, so swapping
//! against it leaves it intact and only moves its image into the other slot.

use crate::{
    Error,
    device::StorageDevice,
    engine::{Io, Watchdog},
    log::{error, info},
    state::{ConfigManager, ConfigStore, SlotIndex, SwapState},
    strategies::copy_app,
};

/// Swap the images of `a` and `b`, running the swap to completion.
pub async fn swap<D, W, S, const N: usize>(
    manager: &mut ConfigManager<S>,
    io: &mut Io<'_, D, W, N>,
    a: SlotIndex,
    b: SlotIndex,
) -> Result<(), Error>
where
    D: StorageDevice,
    W: Watchdog,
    S: ConfigStore,
{
    start(manager, a, b).await?;
    run(manager, io).await
}

/// Record the intent to swap `a` and `b`.
pub async fn start<S: ConfigStore>(
    manager: &mut ConfigManager<S>,
    a: SlotIndex,
    b: SlotIndex,
) -> Result<(), Error> {
    let config = manager.get_mut();
    config.slot(a)?;
    config.slot(b)?;
    if a == b || !config.swap.is_idle() {
        error!("Cannot swap {} and {} ({:?})", a, b, config.swap);
        return Err(Error::InvalidSlot);
    }

    info!("Swap {} <-> {}", a, b);
    config.swap = SwapState::Init { a, b };
    manager.write(false).await
}

/// Step until the swap is complete, persisting after each phase.
pub async fn run<D, W, S, const N: usize>(
    manager: &mut ConfigManager<S>,
    io: &mut Io<'_, D, W, N>,
) -> Result<(), Error>
where
    D: StorageDevice,
    W: Watchdog,
    S: ConfigStore,
{
    while !manager.get().swap.is_idle() {
        step(manager, io).await?;
    }
    Ok(())
}

/// Execute the current phase and persist the next one. Does nothing when no swap is in progress.
pub async fn step<D, W, S, const N: usize>(
    manager: &mut ConfigManager<S>,
    io: &mut Io<'_, D, W, N>,
) -> Result<(), Error>
where
    D: StorageDevice,
    W: Watchdog,
    S: ConfigStore,
{
    let swap = manager.get().swap;
    let next = match swap {
        SwapState::Idle => return Ok(()),
        SwapState::Init { a, b } => {
            let Some(t) = manager.get().find_temp_slot(a, b) else {
                error!("No temp slot to swap {} and {}", a, b);
                return Err(Error::NoTempSlot);
            };
            SwapState::CopyAT { a, b, t }
        }
        SwapState::CopyAT { a, b, t } => {
            copy_app(manager, io, a, t).await?;
            SwapState::CopyBA { a, b, t }
        }
        SwapState::CopyBA { a, b, t } => {
            if manager.get().slot(a)?.is_writeable() {
                copy_app(manager, io, b, a).await?;
            } else {
                info!("Slot {} is read-only, not overwriting", a);
            }
            SwapState::CopyTB { a, b, t }
        }
        SwapState::CopyTB { a, b, t } => {
            if manager.get().slot(b)?.is_writeable() {
                copy_app(manager, io, t, b).await?;
            } else {
                info!("Slot {} is read-only, not overwriting", b);
            }
            SwapState::Commit { a, b, t }
        }
        SwapState::Commit { a, b, .. } => {
            let config = manager.get_mut();
            config.swap_fs_devs(a, b)?;
            config.exchange_refs(a, b);
            SwapState::Idle
        }
    };

    info!("Swap: {:?}", next);
    manager.get_mut().swap = next;
    manager.write(next.is_idle()).await
}
