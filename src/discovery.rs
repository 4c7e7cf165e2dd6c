//! Hot-plug discovery
//!
//! Translates the driver's camera list notifications into
//! [`DiscoveryTrigger`]s for one callback. Every event carries a fresh
//! [`Device`] snapshot.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::device::Device;
use crate::driver::{CameraListObserver, CameraRef, UpdateTrigger};
use crate::error::{Error, Result};
use crate::system::System;

/// Filter value matching every device.
pub const DISCOVERY_ANY_ID: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTrigger {
    PluggedIn,
    PluggedOut,
    StateChanged,
}

impl fmt::Display for DiscoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryTrigger::PluggedIn => "plugged in",
            DiscoveryTrigger::PluggedOut => "plugged out",
            DiscoveryTrigger::StateChanged => "state changed",
        })
    }
}

/// Runs on the driver's notification thread and must not block.
pub type TriggerCallback = Arc<dyn Fn(Arc<Device>, DiscoveryTrigger) + Send + Sync>;

pub struct Discovery {
    inner: Arc<DiscoveryInner>,
    observer: Mutex<Option<Arc<dyn CameraListObserver>>>,
}

struct DiscoveryInner {
    system: Arc<System>,
    filter: Mutex<String>,
    callback: RwLock<Option<TriggerCallback>>,
}

struct DiscoveryObserver {
    inner: Weak<DiscoveryInner>,
}

impl Discovery {
    pub fn new(system: Arc<System>) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                system,
                filter: Mutex::new(DISCOVERY_ANY_ID.to_string()),
                callback: RwLock::new(None),
            }),
            observer: Mutex::new(None),
        }
    }

    pub fn system(&self) -> &Arc<System> {
        &self.inner.system
    }

    /// Only forward events for `id`; [`DISCOVERY_ANY_ID`] forwards all.
    pub fn set_filter(&self, id: &str) {
        *self.inner.filter.lock() = id.to_string();
    }

    pub fn filter(&self) -> String {
        self.inner.filter.lock().clone()
    }

    pub fn set_trigger_callback(&self, callback: Option<TriggerCallback>) {
        *self.inner.callback.write() = callback;
    }

    pub fn is_started(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Start listening and report every camera already present as plugged in.
    pub fn start(&self) -> Result<()> {
        {
            let mut slot = self.observer.lock();
            if slot.is_some() {
                return Ok(());
            }
            if !self.inner.system.is_available() {
                error!("failed to set up discovery, system unavailable");
                return Err(Error::SystemUnavailable);
            }

            let observer: Arc<dyn CameraListObserver> = Arc::new(DiscoveryObserver {
                inner: Arc::downgrade(&self.inner),
            });
            if let Err(e) = self
                .inner
                .system
                .driver()
                .register_camera_list_observer(observer.clone())
            {
                error!("failed to set up connection listener: {e}");
                return Err(e.into());
            }
            *slot = Some(observer);
        }

        info!(filter = %self.filter(), "listening for cameras to connect");
        self.inner.discover();
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut slot = self.observer.lock();
        let Some(observer) = slot.as_ref() else {
            return Ok(());
        };

        if let Err(e) = self
            .inner
            .system
            .driver()
            .unregister_camera_list_observer(observer)
        {
            error!("failed to remove connection listener: {e}");
            return Err(e.into());
        }
        *slot = None;
        info!("stopped listening for connection changes");
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Replay plugged-in events for present cameras, so a device that was
    /// closed can be picked up again.
    pub fn update_triggers(&self) {
        if self.is_started() {
            self.inner.discover();
        }
    }

    /// Snapshot of every present camera, ignoring the filter.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner
            .cameras()
            .into_iter()
            .map(|camera| Arc::new(Device::new(self.inner.system.clone(), camera)))
            .collect()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl DiscoveryInner {
    fn cameras(&self) -> Vec<CameraRef> {
        if !self.system.is_available() {
            error!("failed to retrieve current camera list, system is unavailable");
            return Vec::new();
        }
        match self.system.driver().cameras() {
            Ok(cameras) => cameras,
            Err(e) => {
                error!("failed to retrieve current camera list: {e}");
                Vec::new()
            }
        }
    }

    fn discover(&self) {
        for camera in self.cameras() {
            self.process(camera, UpdateTrigger::PluggedIn);
        }
    }

    fn process(&self, camera: CameraRef, reason: UpdateTrigger) {
        let trigger = match reason {
            UpdateTrigger::PluggedIn => DiscoveryTrigger::PluggedIn,
            UpdateTrigger::PluggedOut => DiscoveryTrigger::PluggedOut,
            UpdateTrigger::OpenStateChanged => DiscoveryTrigger::StateChanged,
            UpdateTrigger::Other => return,
        };

        let device = Arc::new(Device::new(self.system.clone(), camera));
        {
            let filter = self.filter.lock();
            if *filter != DISCOVERY_ANY_ID && device.id() != *filter {
                return;
            }
        }

        debug!(device = %device.id(), available = %device.available_access_mode(), "{trigger}");
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(device, trigger);
        }
    }
}

impl CameraListObserver for DiscoveryObserver {
    fn camera_list_changed(&self, camera: CameraRef, reason: UpdateTrigger) {
        if let Some(inner) = self.inner.upgrade() {
            inner.process(camera, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AccessMode;
    use crate::driver::sim::{SimCameraConfig, SimDriver};
    use crate::driver::{AccessFlags, Driver};

    type Events = Arc<Mutex<Vec<(String, DiscoveryTrigger, AccessMode)>>>;

    fn discovery(driver: &Arc<SimDriver>) -> (Discovery, Events) {
        let system = System::instance(&(driver.clone() as Arc<dyn Driver>));
        let discovery = Discovery::new(system);
        let events: Events = Arc::default();
        let sink = events.clone();
        discovery.set_trigger_callback(Some(Arc::new(move |device: Arc<Device>, trigger: DiscoveryTrigger| {
            sink.lock().push((
                device.id().to_string(),
                trigger,
                device.available_access_mode(),
            ));
        })));
        (discovery, events)
    }

    #[test]
    fn start_reports_present_cameras() {
        let driver = SimDriver::new();
        let (discovery, events) = discovery(&driver);
        driver.plug(SimCameraConfig::with_id("DEV_000F31000B01"));
        driver.plug(SimCameraConfig::with_id("DEV_000F31000B02"));

        discovery.start().unwrap();
        assert!(discovery.is_started());
        // starting twice is a no-op
        discovery.start().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|(_, trigger, _)| *trigger == DiscoveryTrigger::PluggedIn));
    }

    #[test]
    fn hot_plug_events_are_forwarded() {
        let driver = SimDriver::new();
        let (discovery, events) = discovery(&driver);
        discovery.start().unwrap();

        driver.plug(SimCameraConfig::with_id("DEV_000F31000B03"));
        driver.set_permitted_access("DEV_000F31000B03", AccessFlags::READ);
        driver.unplug("DEV_000F31000B03");

        let events = events.lock();
        let triggers: Vec<_> = events.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(
            triggers,
            [
                DiscoveryTrigger::PluggedIn,
                DiscoveryTrigger::StateChanged,
                DiscoveryTrigger::PluggedOut
            ]
        );
        assert_eq!(events[1].2, AccessMode::Read);
    }

    #[test]
    fn filter_drops_other_devices() {
        let driver = SimDriver::new();
        let (discovery, events) = discovery(&driver);
        discovery.set_filter("DEV_000F31000B05");
        discovery.start().unwrap();

        driver.plug(SimCameraConfig::with_id("DEV_000F31000B04"));
        driver.plug(SimCameraConfig::with_id("DEV_000F31000B05"));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "DEV_000F31000B05");
    }

    #[test]
    fn stopped_discovery_is_silent() {
        let driver = SimDriver::new();
        let (discovery, events) = discovery(&driver);
        discovery.start().unwrap();
        discovery.stop().unwrap();
        discovery.stop().unwrap();
        assert!(!discovery.is_started());
        assert_eq!(driver.observer_count(), 0);

        driver.plug(SimCameraConfig::with_id("DEV_000F31000B06"));
        assert!(events.lock().is_empty());

        // restart picks the camera up again
        discovery.restart().unwrap();
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn update_triggers_replays_present_cameras() {
        let driver = SimDriver::new();
        let (discovery, events) = discovery(&driver);
        driver.plug(SimCameraConfig::with_id("DEV_000F31000B07"));
        discovery.update_triggers();
        assert!(events.lock().is_empty());

        discovery.start().unwrap();
        discovery.update_triggers();
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn unavailable_system_cannot_start() {
        let driver = SimDriver::unavailable();
        let (discovery, _events) = discovery(&driver);
        assert!(matches!(discovery.start(), Err(Error::SystemUnavailable)));
        assert!(!discovery.is_started());
        assert!(discovery.devices().is_empty());
    }
}
