//! Shared driver lifetime
//!
//! One `System` exists per driver at a time. Every device, discovery and
//! grabber keeps a reference so the driver stays up while anything uses
//! it; the last owner shuts it down.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, Version};

static INSTANCES: Lazy<Mutex<Vec<Weak<System>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub struct System {
    driver: Arc<dyn Driver>,
    version: Option<Version>,
    available: bool,
}

impl System {
    /// The live system for `driver`, starting the driver if needed.
    pub fn instance(driver: &Arc<dyn Driver>) -> Arc<System> {
        let mut instances = INSTANCES.lock();
        instances.retain(|weak| weak.strong_count() > 0);

        if let Some(existing) = instances
            .iter()
            .filter_map(Weak::upgrade)
            .find(|system| Arc::ptr_eq(&system.driver, driver))
        {
            return existing;
        }

        let system = Arc::new(System::start(driver.clone()));
        instances.push(Arc::downgrade(&system));
        system
    }

    fn start(driver: Arc<dyn Driver>) -> Self {
        let version = match driver.version() {
            Ok(version) => {
                info!("camera API version {version}");
                Some(version)
            }
            Err(e) => {
                warn!("failed to get camera API version: {e}");
                None
            }
        };

        let available = match &version {
            Some(_) => match driver.startup() {
                Ok(()) => {
                    debug!("successfully initialized");
                    true
                }
                Err(e) => {
                    error!("failed to initialize camera system: {e}");
                    false
                }
            },
            None => {
                error!("failed to initialize, API not available");
                false
            }
        };

        Self {
            driver,
            version,
            available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available && self.version.is_some()
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn version_string(&self) -> String {
        self.version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "Unknown".into())
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if !self.available {
            return;
        }
        match self.driver.shutdown() {
            Ok(()) => debug!("successfully shut down camera system"),
            Err(e) => error!("failed to shut down camera system: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimDriver;

    #[test]
    fn instances_are_shared_per_driver() {
        let sim = SimDriver::new();
        let driver: Arc<dyn Driver> = sim.clone();

        let first = System::instance(&driver);
        let second = System::instance(&driver);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_available());
        assert_eq!(first.version_string(), "1.0.0");
        assert!(sim.is_started());

        drop(first);
        assert!(sim.is_started());
        drop(second);
        assert!(!sim.is_started());
    }

    #[test]
    fn unavailable_driver_is_reported() {
        let driver: Arc<dyn Driver> = SimDriver::unavailable();
        let system = System::instance(&driver);
        assert!(!system.is_available());
        assert_eq!(system.version_string(), "Unknown");
    }
}
