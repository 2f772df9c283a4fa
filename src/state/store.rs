use crate::{
    Error,
    log::{debug, info, warn},
    state::BootConfig,
};

/// Persistence backend for the [`BootConfig`].
///
/// Implementations must be power-loss safe: a `store` that is interrupted leaves the previously
/// stored configuration loadable.
#[allow(async_fn_in_trait)]
pub trait ConfigStore {
    /// Load the newest valid configuration, or `None` if storage holds none.
    ///
    /// Storage holding only corrupt records may either return `None` or [`Error::CorruptConfig`].
    async fn load(&mut self) -> Result<Option<BootConfig>, Error>;

    /// Persist `config`, superseding whatever was stored before.
    async fn store(&mut self, config: &BootConfig) -> Result<(), Error>;
}

impl<S: ConfigStore> ConfigStore for &mut S {
    async fn load(&mut self) -> Result<Option<BootConfig>, Error> {
        (**self).load().await
    }

    async fn store(&mut self, config: &BootConfig) -> Result<(), Error> {
        (**self).store(config).await
    }
}

/// In-memory copy of the boot configuration, plus the store it is persisted to.
pub struct ConfigManager<S> {
    store: S,
    config: BootConfig,
    fresh: bool,
}

impl<S: ConfigStore> ConfigManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: BootConfig::new(),
            fresh: false,
        }
    }

    /// Load the stored configuration, populating and persisting defaults if there is none.
    ///
    /// With `force_defaults` (first ever boot), whatever is stored is ignored.
    pub async fn init(
        &mut self,
        force_defaults: bool,
        defaults: impl FnOnce(&mut BootConfig) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let loaded = if force_defaults {
            info!("Writing default config");
            None
        } else {
            match self.store.load().await {
                Ok(config) => config,
                Err(Error::CorruptConfig) => None,
                Err(e) => return Err(e),
            }
        };

        match loaded {
            Some(config) => {
                self.config = config;
                self.fresh = false;
            }
            None => {
                if !force_defaults {
                    warn!("No valid config, regenerating defaults");
                }
                let mut config = BootConfig::new();
                defaults(&mut config)?;
                config.validate()?;
                self.config = config;
                self.fresh = true;
                self.write(true).await?;
            }
        }

        Ok(())
    }

    /// Whether the configuration was generated from defaults during [`Self::init`].
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn get(&self) -> &BootConfig {
        &self.config
    }

    /// Mutable access to the in-memory configuration. Changes only survive a reset after
    /// [`Self::write`].
    pub fn get_mut(&mut self) -> &mut BootConfig {
        &mut self.config
    }

    /// Persist the in-memory configuration, optionally logging it first.
    pub async fn write(&mut self, dump: bool) -> Result<(), Error> {
        if dump {
            self.dump();
        }
        self.store.store(&self.config).await.inspect_err(|e| {
            warn!("Config write failed: {}", e);
        })
    }

    /// Log the whole configuration.
    pub fn dump(&self) {
        let config = &self.config;
        info!(
            "Config: active {} revert {:?} flags {:#x} swap {:?}",
            config.active_slot,
            config.revert_slot,
            config.flags.bits(),
            config.swap
        );
        for (i, slot) in config.slots().iter().enumerate() {
            info!(
                "  {}: {} {} flags {:#x} map {:#x} org {:#x} len {} crc {:?} errs {}",
                i,
                slot.config.app_dev,
                slot.config.fs_dev,
                slot.config.flags.bits(),
                slot.config.app_map_addr,
                slot.state.app_org,
                slot.state.app_len,
                slot.state.app_crc32,
                slot.state.err_count
            );
        }
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn deinit(self) -> S {
        debug!("Config deinit");
        self.store
    }
}
