//! Software camera driver
//!
//! A self-contained implementation of the driver traits. Cameras can be
//! plugged and unplugged, have their permitted access changed, change their
//! payload size and pause frame delivery, which makes every recovery path of
//! the acquisition core reachable without hardware. Each capturing camera
//! runs its own delivery thread, like a real transport layer would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    AccessFlags, Camera, CameraListObserver, CameraRef, Driver, DriverResult, FeatureObserver,
    FeatureValue, FrameBuffer, FrameObserver, FrameStatus, UpdateTrigger, Version,
};
use crate::capture::PixelFormat;
use crate::error::DriverError;

/// Packet size reported after `GVSPAdjustPacketSize`.
pub const ADJUSTED_PACKET_SIZE: i64 = 8228;

const PIXEL_FORMATS: [&str; 6] = [
    "Mono8",
    "RGB8Packed",
    "BGR8Packed",
    "RGBA8Packed",
    "BGRA8Packed",
    "YUV422Packed",
];
const USER_SETS: [&str; 4] = ["Default", "UserSet1", "UserSet2", "UserSet3"];
const COMMANDS: [&str; 4] = [
    "AcquisitionStart",
    "AcquisitionStop",
    "GVSPAdjustPacketSize",
    "UserSetLoad",
];
/// Features locked while the camera is acquiring.
const ACQUISITION_LOCKED: [&str; 3] = ["Width", "Height", "PixelFormat"];

/// Description of one simulated camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimCameraConfig {
    pub id: String,
    pub name: String,
    pub model: String,
    pub serial: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub frame_rate: f64,
    pub frame_rate_min: f64,
    pub frame_rate_max: f64,
    /// Only read access is permitted, as if another host holds the camera.
    pub read_only: bool,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            id: "DEV_000F31000001".into(),
            name: "Simulated GigE Camera".into(),
            model: "SIM-1".into(),
            serial: "000001".into(),
            width: 640,
            height: 480,
            pixel_format: "Mono8".into(),
            frame_rate: 30.0,
            frame_rate_min: 1.0,
            frame_rate_max: 60.0,
            read_only: false,
        }
    }
}

impl SimCameraConfig {
    pub fn with_id(id: &str) -> Self {
        Self {
            id: id.into(),
            serial: id.get(id.len().saturating_sub(6)..).unwrap_or(id).into(),
            ..Default::default()
        }
    }
}

pub struct SimDriver {
    version: Option<Version>,
    started: AtomicBool,
    state: Mutex<DriverState>,
}

#[derive(Default)]
struct DriverState {
    cameras: Vec<Arc<SimCamera>>,
    observers: Vec<Arc<dyn CameraListObserver>>,
}

impl SimDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            version: Some(Version {
                major: 1,
                minor: 0,
                patch: 0,
            }),
            started: AtomicBool::new(false),
            state: Mutex::new(DriverState::default()),
        })
    }

    /// A driver whose subsystem cannot be brought up.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            version: None,
            started: AtomicBool::new(false),
            state: Mutex::new(DriverState::default()),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn camera(&self, id: &str) -> Option<Arc<SimCamera>> {
        self.state.lock().cameras.iter().find(|c| c.id == id).cloned()
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Connect a camera and notify observers.
    pub fn plug(&self, config: SimCameraConfig) -> Arc<SimCamera> {
        let camera = SimCamera::new(config);
        self.state.lock().cameras.push(camera.clone());
        self.notify(camera.clone(), UpdateTrigger::PluggedIn);
        camera
    }

    /// Disconnect a camera and notify observers.
    pub fn unplug(&self, id: &str) -> Option<Arc<SimCamera>> {
        let camera = {
            let mut state = self.state.lock();
            let index = state.cameras.iter().position(|c| c.id == id)?;
            state.cameras.remove(index)
        };
        camera.detach();
        self.notify(camera.clone(), UpdateTrigger::PluggedOut);
        Some(camera)
    }

    /// Change what access other hosts leave us and notify observers.
    pub fn set_permitted_access(&self, id: &str, access: AccessFlags) {
        if let Some(camera) = self.camera(id) {
            camera.state.lock().permitted = access;
            self.notify(camera, UpdateTrigger::OpenStateChanged);
        }
    }

    fn notify(&self, camera: Arc<SimCamera>, reason: UpdateTrigger) {
        if !self.is_started() {
            return;
        }
        let observers = self.state.lock().observers.clone();
        for observer in observers {
            observer.camera_list_changed(camera.clone(), reason);
        }
    }
}

impl Driver for SimDriver {
    fn version(&self) -> DriverResult<Version> {
        self.version.clone().ok_or(DriverError::Unavailable)
    }

    fn startup(&self) -> DriverResult<()> {
        if self.version.is_none() {
            return Err(DriverError::Unavailable);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) -> DriverResult<()> {
        self.started.store(false, Ordering::Release);
        self.state.lock().observers.clear();
        Ok(())
    }

    fn cameras(&self) -> DriverResult<Vec<CameraRef>> {
        if !self.is_started() {
            return Err(DriverError::Unavailable);
        }
        Ok(self
            .state
            .lock()
            .cameras
            .iter()
            .map(|c| c.clone() as CameraRef)
            .collect())
    }

    fn register_camera_list_observer(
        &self,
        observer: Arc<dyn CameraListObserver>,
    ) -> DriverResult<()> {
        if !self.is_started() {
            return Err(DriverError::Unavailable);
        }
        let mut state = self.state.lock();
        if state.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return Err(DriverError::InvalidCall);
        }
        state.observers.push(observer);
        Ok(())
    }

    fn unregister_camera_list_observer(
        &self,
        observer: &Arc<dyn CameraListObserver>,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let before = state.observers.len();
        state.observers.retain(|o| !Arc::ptr_eq(o, observer));
        if state.observers.len() == before {
            return Err(DriverError::NotFound("observer".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SimFeature {
    value: FeatureValue,
    range: Option<(FeatureValue, FeatureValue)>,
    options: Option<Vec<String>>,
}

impl SimFeature {
    fn plain(value: FeatureValue) -> Self {
        Self {
            value,
            range: None,
            options: None,
        }
    }
}

struct Delivery {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SimCamera {
    id: String,
    name: String,
    model: String,
    serial: String,
    started_at: Instant,
    this: Weak<SimCamera>,
    state: Mutex<CameraState>,
    delivery: Mutex<Option<Delivery>>,
}

struct CameraState {
    present: bool,
    permitted: AccessFlags,
    open: Option<AccessFlags>,
    busy: bool,
    features: HashMap<String, SimFeature>,
    feature_observers: Vec<(String, Arc<dyn FeatureObserver>)>,
    announced: Vec<(Arc<FrameBuffer>, Arc<dyn FrameObserver>)>,
    queue: VecDeque<Arc<FrameBuffer>>,
    capturing: bool,
    acquiring: bool,
    external_acquisition: bool,
    paused: bool,
    next_frame_id: u64,
    commands: HashMap<String, u32>,
    writes: Vec<(String, FeatureValue)>,
    eager_frames: u32,
}

impl CameraState {
    fn int(&self, name: &str) -> i64 {
        match self.features.get(name).map(|f| &f.value) {
            Some(FeatureValue::Int(v)) => *v,
            _ => 0,
        }
    }

    fn string(&self, name: &str) -> String {
        match self.features.get(name).map(|f| &f.value) {
            Some(FeatureValue::Str(v)) => v.clone(),
            _ => String::new(),
        }
    }

    fn payload_size(&self) -> i64 {
        let bpp = PixelFormat::from_driver_name(&self.string("PixelFormat"))
            .map(|f| f.bytes_per_pixel())
            .unwrap_or(1);
        self.int("Width") * self.int("Height") * bpp as i64
    }

    /// Recompute the payload size, returning the observers to notify if it changed.
    fn refresh_payload(&mut self) -> Vec<Arc<dyn FeatureObserver>> {
        let size = self.payload_size();
        if self.int("PayloadSize") == size {
            return Vec::new();
        }
        if let Some(feature) = self.features.get_mut("PayloadSize") {
            feature.value = FeatureValue::Int(size);
        }
        self.feature_observers
            .iter()
            .filter(|(name, _)| name == "PayloadSize")
            .map(|(_, o)| o.clone())
            .collect()
    }

    fn has_full_access(&self) -> bool {
        self.open.is_some_and(|a| a.contains(AccessFlags::FULL))
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring || self.external_acquisition
    }
}

impl SimCamera {
    pub fn new(config: SimCameraConfig) -> Arc<Self> {
        let mut features = HashMap::new();
        features.insert("StreamID".to_string(), SimFeature::plain(FeatureValue::Int(0)));
        features.insert(
            "Width".to_string(),
            SimFeature::plain(FeatureValue::Int(config.width as i64)),
        );
        features.insert(
            "Height".to_string(),
            SimFeature::plain(FeatureValue::Int(config.height as i64)),
        );
        features.insert(
            "PixelFormat".to_string(),
            SimFeature {
                value: FeatureValue::Str(config.pixel_format.clone()),
                range: None,
                options: Some(PIXEL_FORMATS.iter().map(|s| s.to_string()).collect()),
            },
        );
        features.insert(
            "PayloadSize".to_string(),
            SimFeature::plain(FeatureValue::Int(0)),
        );
        features.insert(
            "AcquisitionFrameRateAbs".to_string(),
            SimFeature {
                value: FeatureValue::Float(config.frame_rate),
                range: Some((
                    FeatureValue::Float(config.frame_rate_min),
                    FeatureValue::Float(config.frame_rate_max),
                )),
                options: None,
            },
        );
        features.insert(
            "GVSPPacketSize".to_string(),
            SimFeature::plain(FeatureValue::Int(1500)),
        );
        features.insert(
            "MulticastEnable".to_string(),
            SimFeature::plain(FeatureValue::Bool(false)),
        );
        features.insert(
            "UserSetSelector".to_string(),
            SimFeature {
                value: FeatureValue::Str("Default".into()),
                range: None,
                options: Some(USER_SETS.iter().map(|s| s.to_string()).collect()),
            },
        );

        let permitted = if config.read_only {
            AccessFlags::READ
        } else {
            AccessFlags::READ | AccessFlags::FULL
        };

        let mut state = CameraState {
            present: true,
            permitted,
            open: None,
            busy: false,
            features,
            feature_observers: Vec::new(),
            announced: Vec::new(),
            queue: VecDeque::new(),
            capturing: false,
            acquiring: false,
            external_acquisition: false,
            paused: false,
            next_frame_id: 0,
            commands: HashMap::new(),
            writes: Vec::new(),
            eager_frames: 0,
        };
        state.refresh_payload();

        Arc::new_cyclic(|this| Self {
            id: config.id,
            name: config.name,
            model: config.model,
            serial: config.serial,
            started_at: Instant::now(),
            this: this.clone(),
            state: Mutex::new(state),
            delivery: Mutex::new(None),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.id
    }

    /// Change the sensor resolution as another host would, notifying
    /// payload-size observers on the calling thread.
    pub fn resize(&self, width: u32, height: u32) {
        let observers = {
            let mut state = self.state.lock();
            if let Some(f) = state.features.get_mut("Width") {
                f.value = FeatureValue::Int(width as i64);
            }
            if let Some(f) = state.features.get_mut("Height") {
                f.value = FeatureValue::Int(height as i64);
            }
            state.refresh_payload()
        };
        for observer in observers {
            observer.feature_changed("PayloadSize");
        }
    }

    /// Stop delivering frames without ending the capture session.
    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// Pretend another host is driving acquisition.
    pub fn set_external_acquisition(&self, value: bool) {
        self.state.lock().external_acquisition = value;
    }

    /// Complete the next `count` queued buffers inside `queue_frame`, even
    /// while paused, as a camera that is already streaming would.
    pub fn deliver_on_queue(&self, count: u32) {
        self.state.lock().eager_frames = count;
    }

    /// Make `close` fail as if a command were in flight.
    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    pub fn command_count(&self, name: &str) -> u32 {
        self.state.lock().commands.get(name).copied().unwrap_or(0)
    }

    /// Values passed to `set_feature` for `name`, before the camera clamps them.
    pub fn feature_writes(&self, name: &str) -> Vec<FeatureValue> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }

    pub fn open_access(&self) -> Option<AccessFlags> {
        self.state.lock().open
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquiring
    }

    pub fn queued_frames(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn announced_frames(&self) -> usize {
        self.state.lock().announced.len()
    }

    pub fn feature_observer_count(&self) -> usize {
        self.state.lock().feature_observers.len()
    }

    /// Feature value regardless of the open state.
    pub fn feature_value(&self, name: &str) -> Option<FeatureValue> {
        self.state.lock().features.get(name).map(|f| f.value.clone())
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.present = false;
        state.acquiring = false;
        state.external_acquisition = false;
    }

    fn frame_interval(&self) -> Duration {
        let state = self.state.lock();
        let rate = match state.features.get("AcquisitionFrameRateAbs").map(|f| &f.value) {
            Some(FeatureValue::Float(v)) if *v > 0.0 => *v,
            _ => 30.0,
        };
        Duration::from_secs_f64(1.0 / rate).max(Duration::from_millis(1))
    }

    /// Fill the next queued buffer, if the camera is producing frames.
    fn next_frame(&self) -> Option<(Arc<FrameBuffer>, Arc<dyn FrameObserver>)> {
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }
        Self::fill_next(&mut state, self.started_at)
    }

    fn fill_next(
        state: &mut CameraState,
        started_at: Instant,
    ) -> Option<(Arc<FrameBuffer>, Arc<dyn FrameObserver>)> {
        if !state.capturing || !state.is_acquiring() {
            return None;
        }
        let buffer = state.queue.pop_front()?;
        let observer = state
            .announced
            .iter()
            .find(|(b, _)| Arc::ptr_eq(b, &buffer))
            .map(|(_, o)| o.clone())?;

        let frame_id = state.next_frame_id;
        state.next_frame_id += 1;
        let payload = state.payload_size().max(0) as usize;

        {
            let mut contents = buffer.lock();
            contents.frame_id = frame_id;
            contents.timestamp = started_at.elapsed().as_nanos() as u64;
            contents.width = state.int("Width") as u32;
            contents.height = state.int("Height") as u32;
            contents.pixel_format = state.string("PixelFormat");
            if buffer.size() < payload {
                contents.status = FrameStatus::TooSmall;
                contents.image_size = 0;
                contents.ancillary = None;
            } else {
                contents.status = FrameStatus::Complete;
                contents.image_size = payload as u32;
                contents.data[..payload].fill(frame_id as u8);
                contents.ancillary = Some(HashMap::from([(
                    "ChunkAcquisitionFrameCount".to_string(),
                    FeatureValue::Int(frame_id as i64 + 1),
                )]));
            }
        }

        Some((buffer, observer))
    }

    fn stop_delivery(&self) {
        let Some(delivery) = self.delivery.lock().take() else {
            return;
        };
        delivery.stop.store(true, Ordering::Release);
        if delivery.handle.thread().id() != thread::current().id() {
            let _ = delivery.handle.join();
        }
    }

    fn start_delivery(&self) -> DriverResult<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let camera = self.this.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("sim-delivery-{}", self.id))
            .spawn(move || deliver(camera, flag))
            .map_err(|e| DriverError::Other(e.to_string()))?;
        *self.delivery.lock() = Some(Delivery { stop, handle });
        Ok(())
    }

    fn require_open(state: &CameraState) -> DriverResult<()> {
        if state.open.is_none() {
            return Err(DriverError::InvalidAccess);
        }
        Ok(())
    }
}

fn deliver(camera: Weak<SimCamera>, stop: Arc<AtomicBool>) {
    loop {
        let interval = match camera.upgrade() {
            Some(camera) => camera.frame_interval(),
            None => return,
        };

        // Sleep in short slices so end_capture never waits a full frame period
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(5)),
            );
        }
        if stop.load(Ordering::Acquire) {
            return;
        }

        let Some(camera) = camera.upgrade() else {
            return;
        };
        if let Some((buffer, observer)) = camera.next_frame() {
            observer.frame_received(&buffer);
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> DriverResult<String> {
        Ok(self.id.clone())
    }

    fn name(&self) -> DriverResult<String> {
        Ok(self.name.clone())
    }

    fn model(&self) -> DriverResult<String> {
        Ok(self.model.clone())
    }

    fn serial(&self) -> DriverResult<String> {
        Ok(self.serial.clone())
    }

    fn permitted_access(&self) -> DriverResult<AccessFlags> {
        Ok(self.state.lock().permitted)
    }

    fn open(&self, access: AccessFlags) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.present {
            return Err(DriverError::NotFound(self.id.clone()));
        }
        if state.open.is_some() {
            return Err(DriverError::InvalidCall);
        }
        if access.is_empty() || !state.permitted.contains(access) {
            return Err(DriverError::InvalidAccess);
        }
        state.open = Some(access);
        debug!(camera = %self.id, ?access, "sim camera opened");
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        {
            let mut state = self.state.lock();
            if state.busy {
                return Err(DriverError::InvalidCall);
            }
            if state.open.is_none() {
                return Err(DriverError::InvalidCall);
            }
            if state.has_full_access() {
                state.acquiring = false;
            }
            state.open = None;
            state.capturing = false;
            state.queue.clear();
            state.announced.clear();
            state.feature_observers.clear();
        }
        self.stop_delivery();
        debug!(camera = %self.id, "sim camera closed");
        Ok(())
    }

    fn has_feature(&self, name: &str) -> bool {
        self.state.lock().features.contains_key(name) || COMMANDS.contains(&name)
    }

    fn feature(&self, name: &str) -> DriverResult<FeatureValue> {
        let state = self.state.lock();
        Self::require_open(&state)?;
        state
            .features
            .get(name)
            .map(|f| f.value.clone())
            .ok_or_else(|| DriverError::NotFound(name.into()))
    }

    fn set_feature(&self, name: &str, value: FeatureValue) -> DriverResult<()> {
        let observers = {
            let mut state = self.state.lock();
            Self::require_open(&state)?;
            if !state.has_full_access() {
                return Err(DriverError::InvalidAccess);
            }
            if state.acquiring && ACQUISITION_LOCKED.contains(&name) {
                return Err(DriverError::InvalidAccess);
            }
            state.writes.push((name.to_string(), value.clone()));
            let feature = state
                .features
                .get_mut(name)
                .ok_or_else(|| DriverError::NotFound(name.into()))?;

            let value = match (&feature.value, value) {
                (FeatureValue::Float(_), FeatureValue::Float(v)) => FeatureValue::Float(v),
                (FeatureValue::Float(_), FeatureValue::Int(v)) => FeatureValue::Float(v as f64),
                (FeatureValue::Int(_), FeatureValue::Int(v)) => FeatureValue::Int(v),
                (FeatureValue::Bool(_), FeatureValue::Bool(v)) => FeatureValue::Bool(v),
                (FeatureValue::Str(_), FeatureValue::Str(v)) => FeatureValue::Str(v),
                _ => return Err(DriverError::WrongType(name.into())),
            };

            if let (FeatureValue::Str(v), Some(options)) = (&value, &feature.options) {
                if !options.contains(v) {
                    return Err(DriverError::Other(format!("'{v}' is not a valid {name}")));
                }
            }

            // Clamp silently, as real cameras do
            feature.value = match (value, &feature.range) {
                (FeatureValue::Float(v), Some((FeatureValue::Float(min), FeatureValue::Float(max)))) => {
                    FeatureValue::Float(v.max(*min).min(*max))
                }
                (FeatureValue::Int(v), Some((FeatureValue::Int(min), FeatureValue::Int(max)))) => {
                    FeatureValue::Int(v.clamp(*min, (*max).max(*min)))
                }
                (value, _) => value,
            };

            state.refresh_payload()
        };

        for observer in observers {
            observer.feature_changed("PayloadSize");
        }
        Ok(())
    }

    fn feature_range(&self, name: &str) -> DriverResult<(FeatureValue, FeatureValue)> {
        let state = self.state.lock();
        Self::require_open(&state)?;
        let feature = state
            .features
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.into()))?;
        feature
            .range
            .clone()
            .ok_or_else(|| DriverError::WrongType(name.into()))
    }

    fn feature_options(&self, name: &str) -> DriverResult<Vec<String>> {
        let state = self.state.lock();
        Self::require_open(&state)?;
        let feature = state
            .features
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.into()))?;
        feature
            .options
            .clone()
            .ok_or_else(|| DriverError::WrongType(name.into()))
    }

    fn run_command(&self, name: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        Self::require_open(&state)?;
        if !COMMANDS.contains(&name) {
            return Err(DriverError::NotFound(name.into()));
        }
        if !state.has_full_access() {
            return Err(DriverError::InvalidAccess);
        }
        match name {
            "AcquisitionStart" => state.acquiring = true,
            "AcquisitionStop" => state.acquiring = false,
            "GVSPAdjustPacketSize" => {
                if let Some(f) = state.features.get_mut("GVSPPacketSize") {
                    f.value = FeatureValue::Int(ADJUSTED_PACKET_SIZE);
                }
            }
            _ => {}
        }
        *state.commands.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    fn register_feature_observer(
        &self,
        name: &str,
        observer: Arc<dyn FeatureObserver>,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.features.contains_key(name) {
            return Err(DriverError::NotFound(name.into()));
        }
        state.feature_observers.push((name.to_string(), observer));
        Ok(())
    }

    fn unregister_feature_observer(
        &self,
        name: &str,
        observer: &Arc<dyn FeatureObserver>,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state
            .feature_observers
            .retain(|(n, o)| !(n == name && Arc::ptr_eq(o, observer)));
        Ok(())
    }

    fn announce_frame(
        &self,
        buffer: Arc<FrameBuffer>,
        observer: Arc<dyn FrameObserver>,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        Self::require_open(&state)?;
        if state.announced.iter().any(|(b, _)| Arc::ptr_eq(b, &buffer)) {
            return Err(DriverError::InvalidCall);
        }
        state.announced.push((buffer, observer));
        Ok(())
    }

    fn revoke_all_frames(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.capturing {
            return Err(DriverError::InvalidCall);
        }
        state.queue.clear();
        state.announced.clear();
        Ok(())
    }

    fn start_capture(&self) -> DriverResult<()> {
        {
            let mut state = self.state.lock();
            let Some(access) = state.open else {
                return Err(DriverError::InvalidAccess);
            };
            if !state.present {
                return Err(DriverError::NotFound(self.id.clone()));
            }
            if state.capturing {
                return Err(DriverError::InvalidCall);
            }
            if !access.contains(AccessFlags::FULL) && !state.external_acquisition {
                return Err(DriverError::InvalidAccess);
            }
            state.capturing = true;
        }
        if let Err(e) = self.start_delivery() {
            warn!(camera = %self.id, "failed to start delivery thread: {e}");
            self.state.lock().capturing = false;
            return Err(e);
        }
        Ok(())
    }

    fn end_capture(&self) -> DriverResult<()> {
        {
            let mut state = self.state.lock();
            if !state.capturing {
                return Err(DriverError::InvalidCall);
            }
            state.capturing = false;
        }
        self.stop_delivery();
        Ok(())
    }

    fn queue_frame(&self, buffer: &Arc<FrameBuffer>) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.announced.iter().any(|(b, _)| Arc::ptr_eq(b, buffer)) {
            return Err(DriverError::InvalidCall);
        }
        if !state.queue.iter().any(|b| Arc::ptr_eq(b, buffer)) {
            state.queue.push_back(buffer.clone());
        }
        if state.eager_frames == 0 {
            return Ok(());
        }
        state.eager_frames -= 1;
        let delivery = Self::fill_next(&mut state, self.started_at);
        drop(state);
        if let Some((buffer, observer)) = delivery {
            observer.frame_received(&buffer);
        }
        Ok(())
    }

    fn flush_queue(&self) -> DriverResult<()> {
        self.state.lock().queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Arc<SimDriver> {
        let driver = SimDriver::new();
        driver.startup().unwrap();
        driver
    }

    #[test]
    fn payload_follows_resolution_and_format() {
        let driver = started();
        let camera = driver.plug(SimCameraConfig::with_id("DEV_000F31000001"));
        assert_eq!(
            camera.feature_value("PayloadSize"),
            Some(FeatureValue::Int(640 * 480))
        );

        camera.open(AccessFlags::READ | AccessFlags::FULL).unwrap();
        camera
            .set_feature("PixelFormat", FeatureValue::Str("RGB8Packed".into()))
            .unwrap();
        assert_eq!(
            camera.feature_value("PayloadSize"),
            Some(FeatureValue::Int(640 * 480 * 3))
        );
    }

    #[test]
    fn full_access_requires_permission() {
        let driver = started();
        let camera = driver.plug(SimCameraConfig {
            read_only: true,
            ..SimCameraConfig::with_id("DEV_000F31000002")
        });
        assert_eq!(
            camera.open(AccessFlags::FULL),
            Err(DriverError::InvalidAccess)
        );
        camera.open(AccessFlags::READ).unwrap();
        assert_eq!(
            camera.run_command("AcquisitionStart"),
            Err(DriverError::InvalidAccess)
        );
    }

    #[test]
    fn float_features_are_clamped_to_range() {
        let driver = started();
        let camera = driver.plug(SimCameraConfig::with_id("DEV_000F31000003"));
        camera.open(AccessFlags::READ | AccessFlags::FULL).unwrap();
        camera
            .set_feature("AcquisitionFrameRateAbs", FeatureValue::Float(500.0))
            .unwrap();
        assert_eq!(
            camera.feature("AcquisitionFrameRateAbs").unwrap(),
            FeatureValue::Float(60.0)
        );
    }

    #[test]
    fn busy_camera_refuses_to_close() {
        let driver = started();
        let camera = driver.plug(SimCameraConfig::with_id("DEV_000F31000004"));
        camera.open(AccessFlags::READ).unwrap();
        camera.set_busy(true);
        assert_eq!(camera.close(), Err(DriverError::InvalidCall));
        camera.set_busy(false);
        assert!(camera.close().is_ok());
    }

    #[test]
    fn unplugged_cameras_leave_the_list() {
        let driver = started();
        driver.plug(SimCameraConfig::with_id("DEV_000F31000005"));
        assert_eq!(driver.cameras().unwrap().len(), 1);
        let camera = driver.unplug("DEV_000F31000005").unwrap();
        assert!(driver.cameras().unwrap().is_empty());
        assert_eq!(
            camera.open(AccessFlags::READ),
            Err(DriverError::NotFound("DEV_000F31000005".into()))
        );
    }

    #[test]
    fn stopped_driver_lists_nothing() {
        let driver = SimDriver::unavailable();
        assert_eq!(driver.startup(), Err(DriverError::Unavailable));
        assert_eq!(driver.cameras().err(), Some(DriverError::Unavailable));
    }
}
