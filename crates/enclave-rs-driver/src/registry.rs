//! Name-keyed set of drivers with default selection and hint allowlist.

use crate::driver::Driver;
use crate::driver::copy::{COPY_DRIVER, CopyDriver};
use crate::error::DriverError;
use enclave_rs_config::DriverConfig;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Drivers available to the service.
pub struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, Arc<dyn Driver>>>,
    default: String,
    hint_allowlist: BTreeSet<String>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .field("default", &self.default)
            .field("hint_allowlist", &self.hint_allowlist)
            .finish()
    }
}

impl DriverRegistry {
    /// Registry whose default (and only) driver is `default`.
    pub fn new(default: Arc<dyn Driver>) -> Self {
        let name = default.name().to_string();
        let mut drivers = BTreeMap::new();
        drivers.insert(name.clone(), default);
        Self {
            drivers: RwLock::new(drivers),
            default: name,
            hint_allowlist: BTreeSet::new(),
        }
    }

    /// Build the registry described by config: the copy driver everywhere,
    /// the overlay driver on Linux.
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let state_dir = config.state_dir();
        let copy: Arc<dyn Driver> = Arc::new(CopyDriver::new(state_dir.join(COPY_DRIVER)));
        let mut drivers: Vec<Arc<dyn Driver>> = vec![copy.clone()];

        #[cfg(target_os = "linux")]
        {
            use crate::driver::overlay::{OVERLAY_DRIVER, OverlayDriver};
            drivers.push(Arc::new(OverlayDriver::new(state_dir.join(OVERLAY_DRIVER))));
        }

        let default_name = match &config.default {
            Some(name) => name.clone(),
            None => platform_default().to_string(),
        };
        let default = drivers
            .iter()
            .find(|driver| driver.name() == default_name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDriver(default_name.clone()))?;

        let registry = Self::new(default).with_hint_allowlist(config.hint_allowlist.clone());
        for driver in drivers {
            registry.register(driver);
        }
        info!(
            "driver registry ready (default={}, drivers={:?}, state_dir={})",
            registry.default,
            registry.names(),
            state_dir.display()
        );
        Ok(registry)
    }

    /// Names a caller may pass as `driver_hint`.
    pub fn with_hint_allowlist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hint_allowlist = names.into_iter().map(Into::into).collect();
        self
    }

    /// Add or replace a driver under its own name.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        let name = driver.name().to_string();
        debug!("registering driver (name={name})");
        self.drivers.write().insert(name, driver);
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    /// Every registered driver, ordered by name.
    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        self.drivers.read().values().cloned().collect()
    }

    /// Driver by registered name; used to reach the driver owning a record.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    /// Driver for a create request. Hints other than the default must be
    /// allowlisted.
    pub fn resolve(&self, hint: Option<&str>) -> Result<Arc<dyn Driver>, DriverError> {
        match hint {
            None => self.get(&self.default),
            Some(name) if name == self.default || self.hint_allowlist.contains(name) => {
                self.get(name)
            }
            Some(name) => Err(DriverError::HintNotAllowed(name.to_string())),
        }
    }
}

#[cfg(target_os = "linux")]
fn platform_default() -> &'static str {
    use crate::driver::overlay::{OVERLAY_DRIVER, OverlayDriver};
    if OverlayDriver::probe().is_ok() {
        OVERLAY_DRIVER
    } else {
        COPY_DRIVER
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_default() -> &'static str {
    COPY_DRIVER
}
