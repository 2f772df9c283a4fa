use core::cell::{Cell, RefCell};

use crate::{
    Error,
    device::{DeviceName, EraseSizes, StorageDevice},
    log::{trace, warn},
};

struct Entry<D> {
    name: DeviceName,
    device: RefCell<D>,
    refs: Cell<u16>,
}

/// Table of all storage devices known to the loader.
///
/// Created once the device drivers are up (`devs_init`), and passed by reference to everything
/// that needs to touch storage. Devices are reference counted: every [`DeviceHandle`] counts as
/// one reference and releases it when dropped, whichever way the holder exits.
///
/// Heterogeneous hardware is typically described by an enum over the concrete drivers that
/// implements [`StorageDevice`] by dispatching to the variant.
pub struct Registry<D, const N: usize> {
    entries: [Entry<D>; N],
}

impl<D: StorageDevice, const N: usize> Registry<D, N> {
    pub fn new(devices: [(DeviceName, D); N]) -> Self {
        Self {
            entries: devices.map(|(name, device)| Entry {
                name,
                device: RefCell::new(device),
                refs: Cell::new(0),
            }),
        }
    }

    fn entry(&self, name: &DeviceName) -> Option<&Entry<D>> {
        if name.is_empty() {
            return None;
        }
        self.entries.iter().find(|entry| entry.name == *name)
    }

    /// Acquire a handle to the device named `name`.
    pub fn open(&self, name: &DeviceName) -> Result<DeviceHandle<'_, D>, Error> {
        let Some(entry) = self.entry(name) else {
            warn!("No such device: {}", name);
            return Err(Error::DeviceNotFound);
        };

        entry.refs.set(entry.refs.get() + 1);
        trace!("open {} (refs {})", name, entry.refs.get());
        Ok(DeviceHandle { entry })
    }

    /// Number of handles currently held on `name`.
    pub fn refs(&self, name: &DeviceName) -> usize {
        self.entry(name).map_or(0, |entry| entry.refs.get() as usize)
    }

    /// Number of handles currently held on all devices.
    pub fn open_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.refs.get() as usize)
            .sum()
    }

    /// Verify every handle has been released.
    pub fn check_released(&self) -> Result<(), Error> {
        let mut res = Ok(());
        for entry in self.entries.iter().filter(|entry| entry.refs.get() > 0) {
            warn!("{}: {} refs still held", entry.name, entry.refs.get());
            res = Err(Error::DevicesInUse);
        }
        res
    }

    /// Tear the registry down (`devs_deinit`), handing the drivers back.
    pub fn deinit(self) -> Result<[D; N], Error> {
        self.check_released()?;
        Ok(self.entries.map(|entry| entry.device.into_inner()))
    }

    /// Direct access to a device, bypassing reference counting.
    #[cfg(test)]
    pub(crate) fn with<R>(&self, name: &str, f: impl FnOnce(&mut D) -> R) -> R {
        let name = DeviceName::new(name).unwrap();
        let entry = self.entry(&name).unwrap();
        f(&mut entry.device.borrow_mut())
    }
}

/// Scoped reference to a registered device.
///
/// The registry reference is released on drop.
pub struct DeviceHandle<'r, D> {
    entry: &'r Entry<D>,
}

// The loader is strictly single threaded and never has two operations in flight on the same
// device, so a device borrow held across an await point cannot conflict.
#[allow(clippy::await_holding_refcell_ref)]
impl<D: StorageDevice> DeviceHandle<'_, D> {
    pub fn name(&self) -> &DeviceName {
        &self.entry.name
    }

    pub async fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.entry.device.borrow_mut().read(offset, buf).await
    }

    pub async fn write(&self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.entry.device.borrow_mut().write(offset, data).await
    }

    pub async fn erase(&self, offset: u32, len: u32) -> Result<(), Error> {
        self.entry.device.borrow_mut().erase(offset, len).await
    }

    pub fn size(&self) -> u32 {
        self.entry.device.borrow().size()
    }

    pub fn erase_sizes(&self) -> EraseSizes {
        self.entry.device.borrow().erase_sizes()
    }
}

impl<D> Drop for DeviceHandle<'_, D> {
    fn drop(&mut self) {
        self.entry.refs.set(self.entry.refs.get() - 1);
        trace!("close {} (refs {})", self.entry.name, self.entry.refs.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, name};

    fn registry() -> Registry<MockDevice, 2> {
        Registry::new([
            (name("app0"), MockDevice::new(8192)),
            (name("app1"), MockDevice::new(8192)),
        ])
    }

    #[test]
    fn handles_release_on_drop() {
        let registry = registry();

        let a = registry.open(&name("app0")).unwrap();
        let b = registry.open(&name("app0")).unwrap();
        let c = registry.open(&name("app1")).unwrap();
        assert_eq!(registry.refs(&name("app0")), 2);
        assert_eq!(registry.open_count(), 3);
        assert_eq!(registry.check_released(), Err(Error::DevicesInUse));

        drop(a);
        drop(c);
        assert_eq!(registry.refs(&name("app0")), 1);
        assert_eq!(registry.refs(&name("app1")), 0);

        drop(b);
        assert_eq!(registry.open_count(), 0);
        assert!(registry.deinit().is_ok());
    }

    #[test]
    fn unknown_devices() {
        let registry = registry();

        assert!(matches!(
            registry.open(&name("app7")),
            Err(Error::DeviceNotFound)
        ));
        assert!(matches!(
            registry.open(&DeviceName::EMPTY),
            Err(Error::DeviceNotFound)
        ));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn second_open_failing_releases_first() {
        let registry = registry();

        let res = (|| {
            let _src = registry.open(&name("app0"))?;
            let _dst = registry.open(&name("nope"))?;
            Ok::<_, Error>(())
        })();

        assert_eq!(res, Err(Error::DeviceNotFound));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn io_goes_through_to_device() {
        let registry = registry();
        let handle = registry.open(&name("app1")).unwrap();

        embassy_futures::block_on(async {
            handle.erase(0, 4096).await.unwrap();
            handle.write(16, &[1, 2, 3]).await.unwrap();
            let mut buf = [0u8; 4];
            handle.read(15, &mut buf).await.unwrap();
            assert_eq!(buf, [0xff, 1, 2, 3]);
        });

        assert_eq!(handle.size(), 8192);
        assert_eq!(handle.name().as_str(), "app1");
    }
}
