//! Camera driver capability interface
//!
//! Everything the acquisition core needs from a machine-vision SDK:
//! enumeration, open with an access mode, typed feature I/O by name,
//! frame-buffer lifecycle and change notifications. Any SDK offering these
//! primitives can be plugged in behind [`Driver`] and [`Camera`].

pub mod sim;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::error::DriverError;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Shared handle to a physical camera as returned by the driver.
///
/// The same camera must always be handed out as the same allocation, since
/// device identity is decided by comparing handles.
pub type CameraRef = Arc<dyn Camera>;

bitflags! {
    /// Access permissions as reported and requested by the driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessFlags: u8 {
        const READ = 0b01;
        const FULL = 0b10;
    }
}

/// Reason attached to a camera list notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    PluggedIn,
    PluggedOut,
    OpenStateChanged,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TooSmall,
    #[default]
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Driver entry point.
pub trait Driver: Send + Sync {
    fn version(&self) -> DriverResult<Version>;
    fn startup(&self) -> DriverResult<()>;
    fn shutdown(&self) -> DriverResult<()>;

    /// Cameras currently present on the network.
    fn cameras(&self) -> DriverResult<Vec<CameraRef>>;

    fn register_camera_list_observer(
        &self,
        observer: Arc<dyn CameraListObserver>,
    ) -> DriverResult<()>;
    fn unregister_camera_list_observer(
        &self,
        observer: &Arc<dyn CameraListObserver>,
    ) -> DriverResult<()>;
}

pub trait Camera: Send + Sync {
    fn id(&self) -> DriverResult<String>;
    fn name(&self) -> DriverResult<String>;
    fn model(&self) -> DriverResult<String>;
    fn serial(&self) -> DriverResult<String>;
    fn permitted_access(&self) -> DriverResult<AccessFlags>;

    fn open(&self, access: AccessFlags) -> DriverResult<()>;
    /// Fails with [`DriverError::InvalidCall`] while the camera is busy.
    fn close(&self) -> DriverResult<()>;

    fn has_feature(&self, name: &str) -> bool;
    fn feature(&self, name: &str) -> DriverResult<FeatureValue>;
    fn set_feature(&self, name: &str, value: FeatureValue) -> DriverResult<()>;
    fn feature_range(&self, name: &str) -> DriverResult<(FeatureValue, FeatureValue)>;
    fn feature_options(&self, name: &str) -> DriverResult<Vec<String>>;
    fn run_command(&self, name: &str) -> DriverResult<()>;

    fn register_feature_observer(
        &self,
        name: &str,
        observer: Arc<dyn FeatureObserver>,
    ) -> DriverResult<()>;
    fn unregister_feature_observer(
        &self,
        name: &str,
        observer: &Arc<dyn FeatureObserver>,
    ) -> DriverResult<()>;

    /// Hand a buffer to the driver; completed frames are reported to `observer`.
    fn announce_frame(
        &self,
        buffer: Arc<FrameBuffer>,
        observer: Arc<dyn FrameObserver>,
    ) -> DriverResult<()>;
    fn revoke_all_frames(&self) -> DriverResult<()>;
    fn start_capture(&self) -> DriverResult<()>;
    fn end_capture(&self) -> DriverResult<()>;
    fn queue_frame(&self, buffer: &Arc<FrameBuffer>) -> DriverResult<()>;
    fn flush_queue(&self) -> DriverResult<()>;
}

/// Called on the driver's notification thread.
pub trait CameraListObserver: Send + Sync {
    fn camera_list_changed(&self, camera: CameraRef, reason: UpdateTrigger);
}

pub trait FeatureObserver: Send + Sync {
    fn feature_changed(&self, name: &str);
}

/// Called on the driver's frame delivery thread.
pub trait FrameObserver: Send + Sync {
    fn frame_received(&self, buffer: &Arc<FrameBuffer>);
}

/// Contents written by the driver when a frame completes.
#[derive(Debug, Default)]
pub struct FrameContents {
    pub status: FrameStatus,
    pub frame_id: u64,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub image_size: u32,
    pub data: Vec<u8>,
    pub ancillary: Option<HashMap<String, FeatureValue>>,
}

/// A pre-allocated frame buffer shared between the stream and the driver.
#[derive(Debug)]
pub struct FrameBuffer {
    size: usize,
    contents: Mutex<FrameContents>,
}

impl FrameBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            contents: Mutex::new(FrameContents {
                data: vec![0; size],
                ..Default::default()
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameContents> {
        self.contents.lock()
    }
}

/// Typed view over [`FeatureValue`] used by the device accessors.
pub trait Feature: Sized {
    const TYPE_NAME: &'static str;

    fn from_value(value: FeatureValue) -> Option<Self>;
    fn into_value(self) -> FeatureValue;
}

macro_rules! int_feature {
    ($($ty:ty),*) => {
        $(
            impl Feature for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);

                fn from_value(value: FeatureValue) -> Option<Self> {
                    match value {
                        FeatureValue::Int(v) => <$ty>::try_from(v).ok(),
                        _ => None,
                    }
                }

                fn into_value(self) -> FeatureValue {
                    FeatureValue::Int(self as i64)
                }
            }
        )*
    };
}

int_feature!(i64, i32, u32, u64);

impl Feature for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_value(value: FeatureValue) -> Option<Self> {
        match value {
            FeatureValue::Float(v) => Some(v),
            FeatureValue::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    fn into_value(self) -> FeatureValue {
        FeatureValue::Float(self)
    }
}

impl Feature for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_value(value: FeatureValue) -> Option<Self> {
        f64::from_value(value).map(|v| v as f32)
    }

    fn into_value(self) -> FeatureValue {
        FeatureValue::Float(self as f64)
    }
}

impl Feature for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: FeatureValue) -> Option<Self> {
        match value {
            FeatureValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    fn into_value(self) -> FeatureValue {
        FeatureValue::Bool(self)
    }
}

impl Feature for String {
    const TYPE_NAME: &'static str = "string";

    fn from_value(value: FeatureValue) -> Option<Self> {
        match value {
            FeatureValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn into_value(self) -> FeatureValue {
        FeatureValue::Str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_features_reject_out_of_range_values() {
        assert_eq!(u32::from_value(FeatureValue::Int(-1)), None);
        assert_eq!(i32::from_value(FeatureValue::Int(42)), Some(42));
        assert_eq!(i64::from_value(FeatureValue::Float(1.0)), None);
    }

    #[test]
    fn float_features_accept_integers() {
        assert_eq!(f64::from_value(FeatureValue::Int(30)), Some(30.0));
        assert_eq!(String::from_value(FeatureValue::Int(30)), None);
    }

    #[test]
    fn frame_buffers_are_preallocated() {
        let buffer = FrameBuffer::new(64);
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.lock().data.len(), 64);
        assert_eq!(buffer.lock().status, FrameStatus::Invalid);
    }
}
