//! Camera handle with access-mode bookkeeping and typed feature access

use std::fmt;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::{AccessFlags, CameraRef, Feature, FeatureValue};
use crate::error::{DriverError, Error, Result};
use crate::system::System;

/// Ordered access levels. `requested <= available` is a permission check,
/// `current >= Master` allows write commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum AccessMode {
    None = -1,
    Auto = 0,
    Read = 1,
    Master = 2,
}

impl AccessMode {
    pub fn from_flags(flags: AccessFlags) -> Self {
        if flags.contains(AccessFlags::FULL) {
            AccessMode::Master
        } else if flags.contains(AccessFlags::READ) {
            AccessMode::Read
        } else {
            AccessMode::None
        }
    }

    pub fn to_flags(self) -> AccessFlags {
        match self {
            AccessMode::Master => AccessFlags::READ | AccessFlags::FULL,
            AccessMode::Read => AccessFlags::READ,
            AccessMode::None | AccessMode::Auto => AccessFlags::empty(),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::None => "none",
            AccessMode::Auto => "auto",
            AccessMode::Read => "read",
            AccessMode::Master => "master",
        };
        f.write_str(name)
    }
}

pub fn is_access_mode_available(requested: AccessMode, available: AccessMode) -> bool {
    available >= requested
}

/// Snapshot of one camera taken at discovery time.
///
/// Snapshots of the same physical camera share the driver handle; compare
/// them with [`Device::same_handle`]. Dropping the last owner of an open
/// device closes it.
pub struct Device {
    _system: Arc<System>,
    handle: CameraRef,
    id: String,
    name: String,
    model: String,
    serial: String,
    available_mode: AccessMode,
    current_mode: AtomicCell<AccessMode>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("available_mode", &self.available_mode)
            .field("current_mode", &self.current_mode.load())
            .finish()
    }
}

impl Device {
    pub fn new(system: Arc<System>, handle: CameraRef) -> Self {
        let mut device = Self {
            _system: system,
            handle,
            id: String::new(),
            name: String::new(),
            model: String::new(),
            serial: String::new(),
            available_mode: AccessMode::None,
            current_mode: AtomicCell::new(AccessMode::None),
        };
        if let Err(e) = device.inspect() {
            warn!("failed to inspect camera: {e}");
        }
        device
    }

    fn inspect(&mut self) -> Result<()> {
        self.id = self.handle.id()?;
        self.name = self.handle.name()?;
        self.model = self.handle.model()?;
        self.serial = self.handle.serial()?;

        self.available_mode = match self.handle.permitted_access() {
            Ok(flags) => AccessMode::from_flags(flags),
            Err(e) => {
                debug!(device = %self.id, "could not read permitted access, assuming none: {e}");
                AccessMode::None
            }
        };
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn handle(&self) -> &CameraRef {
        &self.handle
    }

    pub fn available_access_mode(&self) -> AccessMode {
        self.available_mode
    }

    pub fn current_access_mode(&self) -> AccessMode {
        self.current_mode.load()
    }

    pub fn is_available(&self) -> bool {
        self.available_mode >= AccessMode::Read
    }

    pub fn is_open(&self) -> bool {
        self.current_mode.load() >= AccessMode::Read
    }

    pub fn is_master(&self) -> bool {
        self.current_mode.load() >= AccessMode::Master
    }

    /// Both snapshots refer to the same physical camera.
    pub fn same_handle(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Open with `mode`; [`AccessMode::Auto`] picks the available mode.
    pub fn open(&self, mode: AccessMode) -> Result<()> {
        if !self.is_available() {
            warn!(device = %self.id, "no access mode available to open camera");
            return Err(Error::AccessUnavailable {
                requested: mode,
                available: self.available_mode,
            });
        }

        let mode = if mode == AccessMode::Auto {
            self.available_mode
        } else {
            mode
        };

        if let Err(e) = self.handle.open(mode.to_flags()) {
            warn!(device = %self.id, "failed to open camera: {e}");
            self.current_mode.store(AccessMode::None);
            return Err(e.into());
        }

        self.current_mode.store(mode);
        info!(device = %self.id, %mode, "open");
        Ok(())
    }

    /// Closing a closed device succeeds. A busy camera yields
    /// [`DriverError::InvalidCall`], which callers should retry.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        match self.handle.close() {
            Ok(()) => {
                self.current_mode.store(AccessMode::None);
                info!(device = %self.id, "closed");
                Ok(())
            }
            Err(DriverError::InvalidCall) => {
                debug!(device = %self.id, "cannot close camera at this time");
                Err(DriverError::InvalidCall.into())
            }
            Err(e) => {
                warn!(device = %self.id, "failed to close camera: {e}");
                Err(e.into())
            }
        }
    }

    pub fn run(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        self.handle.run_command(command).map_err(|e| {
            warn!(device = %self.id, "failed to run {command}: {e}");
            e.into()
        })
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.handle.has_feature(name)
    }

    pub fn get<T: Feature>(&self, name: &str) -> Result<T> {
        self.ensure_open()?;
        let value = self.handle.feature(name).map_err(|e| self.feature_error(name, e))?;
        T::from_value(value).ok_or_else(|| {
            warn!(device = %self.id, "failed to get value for feature {name}");
            Error::FeatureType {
                name: name.into(),
                expected: T::TYPE_NAME,
            }
        })
    }

    /// Numeric values outside the feature's range are clamped into it.
    pub fn set<T: Feature>(&self, name: &str, value: T) -> Result<()> {
        self.ensure_open()?;
        let value = self.clamp_to_range(name, value.into_value());
        self.handle
            .set_feature(name, value)
            .map_err(|e| self.feature_error(name, e))
    }

    pub fn range<T: Feature>(&self, name: &str) -> Result<(T, T)> {
        self.ensure_open()?;
        let (min, max) = self
            .handle
            .feature_range(name)
            .map_err(|e| self.feature_error(name, e))?;
        match (T::from_value(min), T::from_value(max)) {
            (Some(min), Some(max)) => Ok((min, max)),
            _ => {
                warn!(device = %self.id, "failed to get range for feature {name}");
                Err(Error::FeatureType {
                    name: name.into(),
                    expected: T::TYPE_NAME,
                })
            }
        }
    }

    pub fn options(&self, name: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.handle
            .feature_options(name)
            .map_err(|e| self.feature_error(name, e))
    }

    fn clamp_to_range(&self, name: &str, value: FeatureValue) -> FeatureValue {
        if !matches!(value, FeatureValue::Int(_) | FeatureValue::Float(_)) {
            return value;
        }
        let Ok(range) = self.handle.feature_range(name) else {
            return value;
        };
        match (value, range) {
            (FeatureValue::Float(v), (FeatureValue::Float(min), FeatureValue::Float(max))) => {
                let clamped = v.max(min).min(max);
                if clamped != v {
                    info!(device = %self.id, "{name} {v} out of range, clamped to {clamped}");
                }
                FeatureValue::Float(clamped)
            }
            (FeatureValue::Int(v), (FeatureValue::Int(min), FeatureValue::Int(max))) => {
                let clamped = v.max(min).min(max);
                if clamped != v {
                    info!(device = %self.id, "{name} {v} out of range, clamped to {clamped}");
                }
                FeatureValue::Int(clamped)
            }
            (value, _) => value,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        warn!(device = %self.id, "cannot access features of unopened device");
        Err(Error::NotOpen(self.id.clone()))
    }

    fn feature_error(&self, name: &str, error: DriverError) -> Error {
        match error {
            DriverError::NotFound(_) => {
                debug!(device = %self.id, "feature '{name}' not present: {error}")
            }
            _ => warn!(device = %self.id, "failed to access feature '{name}': {error}"),
        }
        error.into()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimCameraConfig, SimDriver};
    use crate::driver::Driver;

    const MODES: [AccessMode; 4] = [
        AccessMode::None,
        AccessMode::Auto,
        AccessMode::Read,
        AccessMode::Master,
    ];

    #[test]
    fn access_modes_are_ordered() {
        for requested in MODES {
            for available in MODES {
                assert_eq!(
                    is_access_mode_available(requested, available),
                    available >= requested,
                    "{requested:?} <= {available:?}"
                );
            }
        }
        assert!(is_access_mode_available(AccessMode::Read, AccessMode::Master));
        assert!(!is_access_mode_available(AccessMode::Master, AccessMode::Read));
    }

    #[test]
    fn driver_flags_translate_both_ways() {
        assert_eq!(
            AccessMode::from_flags(AccessFlags::READ | AccessFlags::FULL),
            AccessMode::Master
        );
        assert_eq!(AccessMode::from_flags(AccessFlags::READ), AccessMode::Read);
        assert_eq!(AccessMode::from_flags(AccessFlags::empty()), AccessMode::None);
        assert_eq!(AccessMode::Read.to_flags(), AccessFlags::READ);
    }

    fn device(config: SimCameraConfig) -> (Arc<SimDriver>, Device) {
        let driver = SimDriver::new();
        let system = System::instance(&(driver.clone() as Arc<dyn Driver>));
        let camera = driver.plug(config);
        let device = Device::new(system, camera);
        (driver, device)
    }

    #[test]
    fn open_auto_resolves_to_available_mode() {
        let (_driver, device) = device(SimCameraConfig::with_id("DEV_000F31000A01"));
        assert_eq!(device.available_access_mode(), AccessMode::Master);
        device.open(AccessMode::Auto).unwrap();
        assert!(device.is_master());
        device.close().unwrap();
        assert_eq!(device.current_access_mode(), AccessMode::None);
        // closing twice is fine
        device.close().unwrap();
    }

    #[test]
    fn features_fail_softly() {
        let (_driver, device) = device(SimCameraConfig::with_id("DEV_000F31000A02"));
        assert!(matches!(device.get::<i64>("Width"), Err(Error::NotOpen(_))));

        device.open(AccessMode::Master).unwrap();
        assert_eq!(device.get::<i64>("Width").unwrap(), 640);
        assert!(device.get::<i64>("NoSuchFeature").unwrap_err().is_transient());
        assert!(matches!(
            device.get::<String>("Width"),
            Err(Error::FeatureType { .. })
        ));
        assert_eq!(
            device.range::<f64>("AcquisitionFrameRateAbs").unwrap(),
            (1.0, 60.0)
        );
        assert!(device
            .options("PixelFormat")
            .unwrap()
            .contains(&"BGR8Packed".to_string()));
    }

    #[test]
    fn out_of_range_values_are_clamped_before_writing() {
        let (driver, device) = device(SimCameraConfig::with_id("DEV_000F31000A05"));
        device.open(AccessMode::Master).unwrap();
        let camera = driver.camera("DEV_000F31000A05").unwrap();

        device.set("AcquisitionFrameRateAbs", 500.0).unwrap();
        device.set("AcquisitionFrameRateAbs", 25.0).unwrap();
        assert_eq!(
            camera.feature_writes("AcquisitionFrameRateAbs"),
            [FeatureValue::Float(60.0), FeatureValue::Float(25.0)]
        );
        assert_eq!(device.get::<f64>("AcquisitionFrameRateAbs").unwrap(), 25.0);

        // features without a range are written as given
        device.set("PixelFormat", "Mono8".to_string()).unwrap();
        assert_eq!(
            camera.feature_writes("PixelFormat"),
            [FeatureValue::Str("Mono8".into())]
        );
    }

    #[test]
    fn read_only_device_cannot_open_as_master() {
        let (_driver, device) = device(SimCameraConfig {
            read_only: true,
            ..SimCameraConfig::with_id("DEV_000F31000A03")
        });
        assert!(device.open(AccessMode::Master).is_err());
        assert!(!device.is_open());
        device.open(AccessMode::Read).unwrap();
        assert!(device.is_open() && !device.is_master());
    }

    #[test]
    fn busy_close_is_transient() {
        let (driver, device) = device(SimCameraConfig::with_id("DEV_000F31000A04"));
        device.open(AccessMode::Read).unwrap();
        let camera = driver.camera("DEV_000F31000A04").unwrap();
        camera.set_busy(true);
        let error = device.close().unwrap_err();
        assert!(error.is_transient());
        assert!(device.is_open());
        camera.set_busy(false);
        drop(device);
        assert!(!camera.is_open());
    }
}
