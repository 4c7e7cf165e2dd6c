//! Self-healing capture session for one open device
//!
//! A monitor thread owns the capture session: it opens it, watches the
//! health timestamps and tears it down again when the stream stalls or the
//! payload size changes, after which the next iteration reopens it. Frames
//! arrive on the driver's delivery thread and payload-size changes on a
//! feature observer thread; both only write timestamps, so the monitor is
//! the sole writer of the capture state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn};

use crate::capture::Frame;
use crate::device::{AccessMode, Device};
use crate::driver::{FeatureObserver, FrameBuffer, FrameContents, FrameObserver, FrameStatus};
use crate::error::{DriverError, Result};
use crate::StreamConfig;

const PAYLOAD_SIZE: &str = "PayloadSize";

/// Invoked on the driver's delivery thread for every completed frame.
pub type FrameCallback = Arc<dyn Fn(&Frame<'_>) + Send + Sync>;

/// Monotonic timestamps, in microseconds since the stream was created.
#[derive(Debug, Default)]
pub struct StreamHealth {
    connected_at: AtomicU64,
    resized_at: AtomicU64,
    frame_at: AtomicU64,
}

impl StreamHealth {
    pub fn mark_connected(&self, now: u64) {
        self.connected_at.store(now, Ordering::Release);
    }

    pub fn mark_resized(&self, now: u64) {
        self.resized_at.store(now, Ordering::Release);
    }

    pub fn mark_frame(&self, now: u64) {
        self.frame_at.store(now, Ordering::Release);
    }

    /// The payload size changed after the current session was opened.
    pub fn is_resized(&self) -> bool {
        self.resized_at.load(Ordering::Acquire) > self.connected_at.load(Ordering::Acquire)
    }

    /// No frame within `stalled`, and the session is older than `initialize`.
    pub fn is_stalled(&self, now: u64, stalled: Duration, initialize: Duration) -> bool {
        let since_frame = now.saturating_sub(self.frame_at.load(Ordering::Acquire));
        if since_frame > stalled.as_micros() as u64 {
            let since_connect = now.saturating_sub(self.connected_at.load(Ordering::Acquire));
            return since_connect > initialize.as_micros() as u64;
        }
        false
    }
}

pub struct Stream {
    shared: Arc<StreamShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct StreamShared {
    device: Arc<Device>,
    config: StreamConfig,
    frames: Mutex<Vec<Arc<FrameBuffer>>>,
    observer: Arc<StreamObserver>,
    callback: RwLock<Option<FrameCallback>>,

    lock: Mutex<()>,
    signal: Condvar,
    running: AtomicBool,
    capturing: AtomicBool,

    health: StreamHealth,
    started: Instant,
}

/// Receives frames and payload-size changes from the driver. Inactive
/// outside a capture session; deactivating waits for an in-flight callback.
struct StreamObserver {
    stream: Weak<StreamShared>,
    active: Mutex<bool>,
}

impl Stream {
    pub fn new(device: Arc<Device>, config: StreamConfig) -> Self {
        let shared = Arc::new_cyclic(|weak| StreamShared {
            device,
            config,
            frames: Mutex::new(Vec::new()),
            observer: Arc::new(StreamObserver {
                stream: weak.clone(),
                active: Mutex::new(false),
            }),
            callback: RwLock::new(None),
            lock: Mutex::new(()),
            signal: Condvar::new(),
            running: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            health: StreamHealth::default(),
            started: Instant::now(),
        });

        Self {
            shared,
            thread: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing()
    }

    pub fn is_resized(&self) -> bool {
        self.shared.health.is_resized()
    }

    pub fn is_stalled(&self) -> bool {
        self.shared.is_stalled()
    }

    pub fn is_available(&self) -> bool {
        self.shared.is_available()
    }

    pub fn health(&self) -> &StreamHealth {
        &self.shared.health
    }

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        *self.shared.callback.write() = callback;
    }

    /// Spawn the monitor thread. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        {
            let _guard = self.shared.lock.lock();
            if self.shared.is_running() {
                return Ok(());
            }
            self.shared.running.store(true, Ordering::Release);
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("stream-{}", self.shared.device.id()))
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                error!(device = %self.shared.device.id(), "failed to spawn stream monitor: {e}");
                Err(e.into())
            }
        }
    }

    /// Stop and join the monitor thread, tearing down any open session.
    /// Must not be called from the frame callback.
    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            let _guard = self.shared.lock.lock();
            self.shared.running.store(false, Ordering::Release);
            thread.take()
        };

        let Some(handle) = handle else {
            return;
        };
        self.shared.signal.notify_all();
        if handle.thread().id() == thread::current().id() {
            warn!("stream stopped from its own monitor thread, not joining");
            return;
        }
        if handle.join().is_err() {
            error!(device = %self.shared.device.id(), "stream monitor panicked");
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StreamShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    fn is_stalled(&self) -> bool {
        self.health.is_stalled(
            self.elapsed(),
            self.config.stalled_timeout(),
            self.config.initialize_timeout(),
        )
    }

    fn is_available(&self) -> bool {
        self.device.has_feature("StreamID")
    }

    fn run(self: Arc<Self>) {
        let span = info_span!("stream", device = %self.device.id());
        let _enter = span.enter();

        let mut guard = self.lock.lock();
        let mut timeout = self.config.health_interval();
        debug!("setting up stream");

        while self.is_running() {
            if self.is_capturing() {
                if self.health.is_resized() {
                    info!("detected resized stream, restarting stream");
                    metrics::counter!("stream_resizes").increment(1);
                    timeout = Duration::ZERO;
                    self.close();
                } else if self.is_stalled() {
                    if self.device.current_access_mode() == AccessMode::Master {
                        warn!("detected stalled stream, restarting stream");
                    } else {
                        debug!("detected stalled stream, restarting stream");
                    }
                    metrics::counter!("stream_stalls").increment(1);
                    timeout = Duration::ZERO;
                    self.close();
                }
            } else if self.open() {
                timeout = self.config.health_interval();
            } else {
                timeout = self.config.retry_interval();
            }

            if !timeout.is_zero() {
                self.signal.wait_while_for(
                    &mut guard,
                    |_| self.is_running() && !(self.is_capturing() && self.health.is_resized()),
                    timeout,
                );
            }
        }

        if self.is_capturing() {
            self.close();
        }
        self.capturing.store(false, Ordering::Release);
        debug!("stream monitor exited");
    }

    fn open(&self) -> bool {
        if !self.is_available() {
            warn!("no stream available for device");
            return false;
        }

        if self.prepare() {
            debug!("started capture");
            if self.device.is_master() && self.device.run("AcquisitionStart").is_err() {
                warn!("failed to start acquisition");
                self.teardown();
            }
        }

        if self.is_capturing() {
            self.health.mark_connected(self.elapsed());
            metrics::counter!("stream_sessions").increment(1);
        }
        self.is_capturing()
    }

    fn close(&self) {
        if !self.is_capturing() {
            return;
        }
        if self.device.is_master() && self.device.run("AcquisitionStop").is_err() {
            error!("failed to stop acquisition");
        }
        self.teardown();
    }

    fn prepare(&self) -> bool {
        if let Err(e) = self.allocate() {
            error!("failed to allocate frames: {e}");
            return false;
        }

        let handle = self.device.handle();
        match handle.start_capture() {
            Ok(()) => {
                if self.queue() {
                    self.capturing.store(true, Ordering::Release);
                } else {
                    warn!("failed to queue frames");
                    self.unobserve();
                    if let Err(e) = handle.end_capture() {
                        warn!("failed to end capture: {e}");
                    }
                    self.deallocate();
                }
            }
            Err(DriverError::InvalidAccess) if !self.device.is_master() => {
                debug!("cannot start capturing in read only mode without a running acquisition");
                self.deallocate();
            }
            Err(e) => {
                error!("failed to start capturing: {e}");
                self.deallocate();
            }
        }

        self.is_capturing()
    }

    fn teardown(&self) {
        self.capturing.store(false, Ordering::Release);

        let handle = self.device.handle();
        let ended = handle.end_capture();
        self.unobserve();
        if let Err(e) = ended {
            warn!("failed to end capture: {e}");
            return;
        }
        if let Err(e) = handle.flush_queue() {
            warn!("failed to flush queued frames: {e}");
            return;
        }
        if self.deallocate() {
            debug!("stopped capture");
        }
    }

    fn is_allocated(&self, size: usize) -> bool {
        let frames = self.frames.lock();
        !frames.is_empty() && frames.iter().all(|f| f.size() == size)
    }

    fn allocate(&self) -> Result<()> {
        let size = self.device.get::<i64>(PAYLOAD_SIZE)?.max(0) as usize;

        if !self.is_allocated(size) {
            let pool = (0..self.config.buffer_count.max(1))
                .map(|_| Arc::new(FrameBuffer::new(size)))
                .collect();
            *self.frames.lock() = pool;
            debug!(size, count = self.config.buffer_count, "allocated frame pool");
        }

        let frames = self.frames.lock().clone();
        let handle = self.device.handle();
        for frame in frames {
            if let Err(e) = handle.announce_frame(frame, self.observer.clone()) {
                if let Err(revoke) = handle.revoke_all_frames() {
                    warn!("failed to revoke partially announced frames: {revoke}");
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn deallocate(&self) -> bool {
        match self.device.handle().revoke_all_frames() {
            Ok(()) => true,
            Err(e) => {
                error!("failed to revoke frames: {e}");
                false
            }
        }
    }

    fn queue(&self) -> bool {
        let frames = self.frames.lock().clone();
        let handle = self.device.handle();
        // Frames may complete before the last buffer is queued
        *self.observer.active.lock() = true;
        for frame in &frames {
            if let Err(e) = handle.queue_frame(frame) {
                error!("failed to queue frame: {e}");
                return false;
            }
        }
        self.observe();
        true
    }

    fn observe(&self) {
        let observer: Arc<dyn FeatureObserver> = self.observer.clone();
        if let Err(e) = self
            .device
            .handle()
            .register_feature_observer(PAYLOAD_SIZE, observer)
        {
            debug!("payload size cannot be observed: {e}");
        }
    }

    fn unobserve(&self) {
        let observer: Arc<dyn FeatureObserver> = self.observer.clone();
        *self.observer.active.lock() = false;
        if let Err(e) = self
            .device
            .handle()
            .unregister_feature_observer(PAYLOAD_SIZE, &observer)
        {
            debug!("failed to stop observing payload size: {e}");
        }
    }

    fn receive(&self, contents: &FrameContents) {
        match Frame::load(&self.device, contents) {
            Ok(frame) => {
                self.health.mark_frame(self.elapsed());
                metrics::counter!("frames_received").increment(1);
                let callback = self.callback.read().clone();
                if let Some(callback) = callback {
                    callback(&frame);
                }
            }
            Err(e) => error!(device = %self.device.id(), "failed to extract frame data: {e}"),
        }
    }
}

impl FrameObserver for StreamObserver {
    fn frame_received(&self, buffer: &Arc<FrameBuffer>) {
        let active = self.active.lock();
        if !*active {
            return;
        }
        let Some(stream) = self.stream.upgrade() else {
            return;
        };

        {
            let contents = buffer.lock();
            if contents.status == FrameStatus::Complete {
                stream.receive(&contents);
            } else {
                debug!(status = ?contents.status, "dropping incomplete frame");
                metrics::counter!("frames_dropped").increment(1);
            }
        }

        // The buffer goes straight back to the driver
        if let Err(e) = stream.device.handle().queue_frame(buffer) {
            debug!("failed to requeue frame: {e}");
        }
    }
}

impl FeatureObserver for StreamObserver {
    fn feature_changed(&self, _name: &str) {
        let active = self.active.lock();
        if !*active {
            return;
        }
        let Some(stream) = self.stream.upgrade() else {
            return;
        };

        if let Ok(size) = stream.device.get::<i64>(PAYLOAD_SIZE) {
            if !stream.is_allocated(size.max(0) as usize) {
                info!(device = %stream.device.id(), size, "stream payload size changed, scheduling resize");
                stream.health.mark_resized(stream.elapsed());
                // A busy monitor sees the resize on its next pass
                if let Some(_guard) = stream.lock.try_lock() {
                    stream.signal.notify_all();
                }
            }
        }
    }
}
