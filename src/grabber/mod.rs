//! Connection orchestrator
//!
//! The [`Grabber`] decides which camera is active and how it is configured.
//! Discovery events, setting changes and stream failures all become
//! [`Action`]s executed one at a time on a single worker thread, which is
//! the only place the active device and its stream are mutated. Frames
//! reach the host through [`Grabber::update`] or [`Grabber::subscribe`].

pub mod action;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

pub use action::{Action, ActionKind, ActionQueue};

use crate::capture::{Frame, PixelFormat, Pixels, Stream};
use crate::device::{is_access_mode_available, AccessMode, Device};
use crate::discovery::{Discovery, DiscoveryTrigger, DISCOVERY_ANY_ID};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::system::System;
use crate::utils::{self, DeviceInfo};
use crate::{logging, Config, GrabberConfig, StreamConfig};

const FRAME_RATE: &str = "AcquisitionFrameRateAbs";

/// Video grabber over one GigE camera at a time.
///
/// Construct it, call [`setup`](Self::setup) once, then [`update`](Self::update)
/// on every tick of the host loop. Setters may be called at any time; the
/// worker picks the new values up with its next action.
pub struct Grabber {
    shared: Arc<GrabberShared>,
    worker: Option<JoinHandle<()>>,

    pixels: Option<Arc<Pixels>>,
    width: u32,
    height: u32,
    pixel_format: Option<PixelFormat>,
    frame_new: bool,
    resolution_changed: bool,
    pixel_format_changed: bool,
}

struct GrabberShared {
    this: Weak<GrabberShared>,
    system: Arc<System>,
    discovery: Discovery,
    queue: ActionQueue,
    initialized: AtomicBool,

    active: ArcSwapOption<Device>,
    stream: Mutex<Option<Stream>>,
    stream_config: StreamConfig,
    close_retries: u32,
    close_retry_interval: Duration,

    device_id: Mutex<String>,
    read_only: AtomicBool,
    multicast: AtomicBool,
    user_set: AtomicI32,
    desired_pixel_format: Mutex<String>,
    desired_frame_rate: AtomicCell<f64>,
    frame_rate: AtomicCell<f64>,

    received: ArcSwapOption<Pixels>,
    subscribers: Mutex<Vec<Sender<Arc<Pixels>>>>,
    devices: Mutex<Vec<DeviceInfo>>,
}

impl Grabber {
    pub fn new(driver: &Arc<dyn Driver>, config: &Config) -> Self {
        Self::with_system(System::instance(driver), &config.grabber, &config.stream)
    }

    pub fn with_system(system: Arc<System>, config: &GrabberConfig, stream: &StreamConfig) -> Self {
        let shared = Arc::new_cyclic(|this| GrabberShared {
            this: this.clone(),
            discovery: Discovery::new(system.clone()),
            system,
            queue: ActionQueue::new(),
            initialized: AtomicBool::new(false),
            active: ArcSwapOption::empty(),
            stream: Mutex::new(None),
            stream_config: stream.clone(),
            close_retries: config.close_retries,
            close_retry_interval: config.close_retry_interval(),
            device_id: Mutex::new(config.device_id.clone()),
            read_only: AtomicBool::new(config.read_only),
            multicast: AtomicBool::new(config.multicast),
            user_set: AtomicI32::new(config.user_set),
            desired_pixel_format: Mutex::new(config.pixel_format.clone()),
            desired_frame_rate: AtomicCell::new(config.frame_rate),
            frame_rate: AtomicCell::new(0.0),
            received: ArcSwapOption::empty(),
            subscribers: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
        });
        shared.update_device_list();

        Self {
            shared,
            worker: None,
            pixels: None,
            width: 0,
            height: 0,
            pixel_format: None,
            frame_new: false,
            resolution_changed: false,
            pixel_format_changed: false,
        }
    }

    /// Start the action worker and discovery.
    pub fn setup(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if !self.shared.system.is_available() {
            error!("cannot set up grabber, camera system unavailable");
            return Err(Error::SystemUnavailable);
        }

        self.shared.queue.reopen();
        let shared = self.shared.clone();
        self.worker = Some(
            thread::Builder::new()
                .name("grabber-actions".into())
                .spawn(move || shared.run_actions())?,
        );

        let grabber = self.shared.this.clone();
        self.shared
            .discovery
            .set_trigger_callback(Some(Arc::new(move |device: Arc<Device>, trigger: DiscoveryTrigger| {
                if let Some(grabber) = grabber.upgrade() {
                    grabber.on_discovery(device, trigger);
                }
            })));

        self.shared.initialized.store(true, Ordering::Release);
        if let Err(e) = self.shared.discovery.start() {
            self.close();
            return Err(e);
        }
        info!(version = %self.shared.system.version_string(), "grabber ready");
        Ok(())
    }

    /// Take the latest delivered frame, if any, and update the change flags.
    pub fn update(&mut self) {
        self.frame_new = false;
        self.resolution_changed = false;
        self.pixel_format_changed = false;

        let Some(pixels) = self.shared.received.swap(None) else {
            return;
        };
        metrics::histogram!("frame_latency_ms")
            .record(pixels.received_at.elapsed().as_secs_f64() * 1000.0);

        self.resolution_changed = self.width != pixels.width || self.height != pixels.height;
        self.pixel_format_changed = self.pixel_format != Some(pixels.format);
        self.width = pixels.width;
        self.height = pixels.height;
        self.pixel_format = Some(pixels.format);
        self.pixels = Some(pixels);
        self.frame_new = true;
    }

    /// Stop discovery and the worker, then release the active device.
    pub fn close(&mut self) {
        self.shared.initialized.store(false, Ordering::Release);
        self.shared.discovery.set_trigger_callback(None);
        let _ = self.shared.discovery.stop();

        self.shared.queue.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("action worker panicked");
            }
        }

        self.shared.stop_stream();
        if let Some(active) = self.shared.active.swap(None) {
            self.shared.close_device(&active);
        }
        self.shared.subscribers.lock().clear();
    }

    /// Receive a copy of every delivered frame. Frames are dropped for
    /// receivers that fall `capacity` frames behind.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<Pixels>> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_initialized()
    }

    pub fn is_frame_new(&self) -> bool {
        self.frame_new
    }

    pub fn pixels(&self) -> Option<&Pixels> {
        self.pixels.as_deref()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.pixel_format
    }

    pub fn is_resolution_changed(&self) -> bool {
        self.resolution_changed
    }

    pub fn is_pixel_format_changed(&self) -> bool {
        self.pixel_format_changed
    }

    pub fn is_pixel_size_changed(&self) -> bool {
        self.resolution_changed || self.pixel_format_changed
    }

    pub fn is_connected(&self) -> bool {
        self.shared.active.load().is_some()
    }

    /// Id of the active device, or the requested id while disconnected.
    pub fn device_id(&self) -> String {
        match self.shared.active.load_full() {
            Some(device) => device.id().to_string(),
            None => self.shared.device_id.lock().clone(),
        }
    }

    /// Frame rate applied by the camera.
    pub fn frame_rate(&self) -> f64 {
        self.shared.frame_rate.load()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    pub fn is_multicast(&self) -> bool {
        self.shared.multicast.load(Ordering::Acquire)
    }

    pub fn user_set(&self) -> i32 {
        self.shared.user_set.load(Ordering::Acquire)
    }

    pub fn desired_pixel_format(&self) -> String {
        self.shared.desired_pixel_format.lock().clone()
    }

    /// Cameras seen at the last discovery event, also logged as a table.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.shared.devices.lock().clone();
        info!("{}", utils::device_table(&devices));
        devices
    }

    /// Connect to `id` only; [`DISCOVERY_ANY_ID`] accepts any camera.
    pub fn set_device_id(&self, id: &str) {
        {
            let mut current = self.shared.device_id.lock();
            if *current == id {
                return;
            }
            *current = id.to_string();
        }
        self.shared.reconnect();
    }

    pub fn set_device_int_id(&self, id: u32) {
        self.set_device_id(&utils::int_id_to_hex_id(id));
    }

    pub fn set_read_only(&self, value: bool) {
        if self.shared.read_only.swap(value, Ordering::AcqRel) == value {
            return;
        }
        self.shared.reconnect();
    }

    pub fn set_multicast(&self, value: bool) {
        if self.shared.multicast.swap(value, Ordering::AcqRel) == value {
            return;
        }
        self.shared.reconfigure();
    }

    /// Driver name of the wanted format, e.g. `BGR8Packed`.
    pub fn set_desired_pixel_format(&self, format: &str) {
        {
            let mut current = self.shared.desired_pixel_format.lock();
            if *current == format {
                return;
            }
            *current = format.to_string();
        }
        self.shared.reconfigure();
    }

    /// User set loaded on configure; 1..=3 select `UserSet<n>`, a negative
    /// index disables loading.
    pub fn set_user_set(&self, index: i32) {
        if self.shared.user_set.swap(index, Ordering::AcqRel) == index {
            return;
        }
        self.shared.reconfigure();
    }

    /// Load `index` now, even if it is already the selected set.
    pub fn load_user_set(&self, index: i32) {
        self.shared.user_set.store(index, Ordering::Release);
        self.shared.reconfigure();
    }

    /// Applied immediately when connected as master.
    pub fn set_desired_frame_rate(&self, value: f64) {
        self.shared.desired_frame_rate.store(value);
        if !self.is_initialized() {
            return;
        }
        if let Some(active) = self.shared.active.load_full() {
            self.shared.set_frame_rate(&active, value);
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        logging::set_verbose(verbose);
    }
}

impl Drop for Grabber {
    fn drop(&mut self) {
        self.close();
    }
}

impl GrabberShared {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn requested_access_mode(&self) -> AccessMode {
        if self.read_only.load(Ordering::Acquire) {
            AccessMode::Read
        } else {
            AccessMode::Master
        }
    }

    fn is_active(&self, device: &Device) -> bool {
        self.active
            .load()
            .as_deref()
            .is_some_and(|active| active.same_handle(device))
    }

    fn add_action(&self, kind: ActionKind, device: Option<Arc<Device>>) {
        let action = Action::new(kind, device);
        if self.queue.push(action.clone()) {
            debug!(?action, "queued");
        }
    }

    /// Drop the connection; discovery then reconnects under the new settings.
    fn reconnect(&self) {
        if self.is_initialized() {
            self.add_action(ActionKind::Disconnect, self.active.load_full());
        }
    }

    fn reconfigure(&self) {
        if !self.is_initialized() {
            return;
        }
        if let Some(active) = self.active.load_full() {
            self.add_action(ActionKind::Configure, Some(active));
        }
    }

    fn run_actions(self: Arc<Self>) {
        let span = info_span!("grabber");
        let _enter = span.enter();
        debug!("action worker started");

        while let Some(action) = self.queue.next() {
            let span = info_span!("action", kind = ?action.kind, device = %action.device_id());
            let _enter = span.enter();
            let started = Instant::now();

            match action.kind {
                ActionKind::Disconnect => self.disconnect(action.device.as_ref()),
                ActionKind::Connect => self.connect(action.device.as_ref()),
                ActionKind::Configure => self.configure(action.device.as_ref()),
            }

            metrics::counter!("grabber_actions", "kind" => action.kind.as_str()).increment(1);
            metrics::histogram!("grabber_action_ms")
                .record(started.elapsed().as_secs_f64() * 1000.0);
        }
        debug!("action worker stopped");
    }

    fn disconnect(&self, device: Option<&Arc<Device>>) {
        self.stop_stream();
        if let Some(active) = self.active.swap(None) {
            self.close_device(&active);
            info!(device = %active.id(), "disconnected");
        }
        if let Some(device) = device {
            self.close_device(device);
        }
        self.discovery.update_triggers();
    }

    fn connect(&self, device: Option<&Arc<Device>>) {
        let Some(device) = device else {
            return;
        };
        if let Some(active) = self.active.load_full() {
            if !active.same_handle(device) {
                debug!(active = %active.id(), "another device is active, skipping connect");
            }
            return;
        }

        if let Err(e) = self.open_device(device) {
            debug!("connect aborted: {e}");
            return;
        }
        if let Err(e) = self.configure_device(device) {
            warn!("failed to configure device: {e}");
            self.close_device(device);
            return;
        }
        match self.start_stream(device) {
            Ok(()) => {
                self.active.store(Some(device.clone()));
                metrics::counter!("grabber_connects").increment(1);
                info!(mode = %device.current_access_mode(), "connected");
            }
            Err(e) => {
                warn!("failed to start stream: {e}");
                self.close_device(device);
            }
        }
    }

    fn configure(&self, device: Option<&Arc<Device>>) {
        let Some(active) = self.active.load_full() else {
            return;
        };
        if !device.is_some_and(|device| device.same_handle(&active)) {
            debug!("device is no longer active, skipping configure");
            return;
        }

        self.stop_stream();
        if let Err(e) = self.configure_device(&active) {
            warn!("failed to configure device: {e}");
        }
        if let Err(e) = self.start_stream(&active) {
            warn!("failed to restart stream, disconnecting: {e}");
            self.disconnect(Some(&active));
        }
    }

    /// A candidate must match the requested id and offer the access mode
    /// the read-only setting asks for.
    fn filter_device(&self, device: &Device) -> bool {
        {
            let id = self.device_id.lock();
            if *id != DISCOVERY_ANY_ID && *id != device.id() {
                return false;
            }
        }

        let requested = self.requested_access_mode();
        if !is_access_mode_available(requested, device.available_access_mode()) {
            debug!(
                device = %device.id(),
                %requested,
                available = %device.available_access_mode(),
                "access mode not available"
            );
            return false;
        }
        true
    }

    fn open_device(&self, device: &Device) -> Result<()> {
        let requested = self.requested_access_mode();
        if !is_access_mode_available(requested, device.available_access_mode()) {
            return Err(Error::AccessUnavailable {
                requested,
                available: device.available_access_mode(),
            });
        }

        device.open(requested)?;
        if requested == AccessMode::Read {
            info!("opened read only connection");
        } else {
            debug!("opened connection");
        }
        Ok(())
    }

    /// Close, retrying while the camera reports it is busy.
    fn close_device(&self, device: &Device) {
        let mut attempt = 0;
        loop {
            match device.close() {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < self.close_retries => {
                    attempt += 1;
                    debug!(attempt, "camera busy, retrying close");
                    thread::sleep(self.close_retry_interval);
                }
                Err(e) => {
                    warn!(device = %device.id(), "failed to close device: {e}");
                    return;
                }
            }
        }
    }

    fn configure_device(&self, device: &Device) -> Result<()> {
        if !device.is_open() {
            return Err(Error::NotOpen(device.id().to_string()));
        }
        if !device.is_master() {
            debug!("read only connection, leaving configuration untouched");
            return Ok(());
        }

        // Failures below are routine on cameras lacking a feature and are
        // logged by the device.
        let _ = device.run("GVSPAdjustPacketSize");
        if let Ok(size) = device.get::<i64>("GVSPPacketSize") {
            debug!(size, "packet size adjusted");
        }

        let _ = device.set("MulticastEnable", self.multicast.load(Ordering::Acquire));

        let user_set = self.user_set.load(Ordering::Acquire);
        if user_set >= 0 {
            let _ = device.set("UserSetSelector", utils::user_set_string(user_set));
            let _ = device.run("UserSetLoad");
        }

        let desired = self.desired_pixel_format.lock().clone();
        let _ = device.set("PixelFormat", desired.clone());
        match device.get::<String>("PixelFormat") {
            Ok(current) if current != desired => {
                info!(%desired, %current, "desired pixel format not set");
            }
            _ => {}
        }

        self.set_frame_rate(device, self.desired_frame_rate.load());
        info!("device configured");
        Ok(())
    }

    /// Clamp `value` just inside the camera's range, apply it and read back
    /// what the camera settled on.
    fn set_frame_rate(&self, device: &Device, value: f64) -> Option<f64> {
        if !device.is_master() {
            return None;
        }

        let (min, max) = device.range::<f64>(FRAME_RATE).ok()?;
        let clamped = value.max(min + 0.1).min(max - 0.1);
        self.frame_rate.store(clamped);
        let _ = device.set(FRAME_RATE, clamped);

        let applied = device.get::<f64>(FRAME_RATE).unwrap_or(clamped);
        self.frame_rate.store(applied);
        if applied != value {
            info!(desired = value, applied, "desired frame rate not set");
        }
        Some(applied)
    }

    fn start_stream(&self, device: &Arc<Device>) -> Result<()> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }
        if !device.is_open() {
            return Err(Error::NotOpen(device.id().to_string()));
        }

        let stream = Stream::new(device.clone(), self.stream_config.clone());
        let grabber = self.this.clone();
        stream.set_frame_callback(Some(Arc::new(move |frame: &Frame<'_>| {
            if let Some(grabber) = grabber.upgrade() {
                grabber.on_frame(frame);
            }
        })));
        stream.start()?;
        *slot = Some(stream);
        Ok(())
    }

    fn stop_stream(&self) {
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            stream.set_frame_callback(None);
            stream.stop();
        }
    }

    fn on_frame(&self, frame: &Frame<'_>) {
        let Some(pixels) = Pixels::from_frame(frame) else {
            debug!(format = frame.image_format(), "unsupported pixel format, dropping frame");
            return;
        };
        let pixels = Arc::new(pixels);
        self.received.store(Some(pixels.clone()));

        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(pixels.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("subscriber_frames_dropped").increment(1);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    fn on_discovery(&self, device: Arc<Device>, trigger: DiscoveryTrigger) {
        match trigger {
            DiscoveryTrigger::PluggedIn => self.on_found(device),
            DiscoveryTrigger::PluggedOut => self.on_lost(device),
            DiscoveryTrigger::StateChanged => self.on_update(device),
        }
        self.update_device_list();
    }

    fn on_found(&self, device: Arc<Device>) {
        if self.is_active(&device) {
            debug!(device = %device.id(), "discovered device is already active");
            return;
        }
        if !self.filter_device(&device) {
            return;
        }
        debug!(device = %device.id(), "discovered device");
        self.add_action(ActionKind::Connect, Some(device));
    }

    fn on_lost(&self, device: Arc<Device>) {
        if !self.is_active(&device) {
            return;
        }
        info!(device = %device.id(), "device lost");
        self.add_action(ActionKind::Disconnect, Some(device));
    }

    fn on_update(&self, device: Arc<Device>) {
        if self.is_active(&device)
            && !is_access_mode_available(self.requested_access_mode(), device.available_access_mode())
        {
            self.on_lost(device);
            return;
        }
        if device.is_available() {
            self.on_found(device);
        }
    }

    fn update_device_list(&self) {
        let devices = self
            .discovery
            .devices()
            .iter()
            .map(|device| DeviceInfo::new(device))
            .collect();
        *self.devices.lock() = devices;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimCameraConfig, SimDriver};

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn failed_restart_disconnects_and_rediscovers() {
        let sim = SimDriver::new();
        let system = System::instance(&(sim.clone() as Arc<dyn Driver>));
        let mut grabber = Grabber::with_system(system, &GrabberConfig::default(), &StreamConfig::default());
        grabber.setup().unwrap();
        let camera = sim.plug(SimCameraConfig::with_id("DEV_000F31000E01"));
        assert!(eventually(|| grabber.is_connected()));
        assert!(eventually(|| camera.command_count("AcquisitionStart") == 1));

        // a device closed under the stream cannot be restarted
        let shared = grabber.shared.clone();
        let active = shared.active.load_full().unwrap();
        shared.stop_stream();
        active.close().unwrap();
        shared.configure(Some(&active));

        assert!(!active.is_open());
        assert!(eventually(|| {
            shared
                .active
                .load_full()
                .is_some_and(|device| !Arc::ptr_eq(&device, &active))
        }));
        assert!(eventually(|| camera.command_count("AcquisitionStart") == 2));
        assert!(camera.is_open());
        grabber.close();
    }
}
