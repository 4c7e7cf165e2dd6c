//! GigE grabber demo over the simulated camera driver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use gigegrab::driver::sim::SimDriver;
use gigegrab::driver::Driver;
use gigegrab::{logging, Config, Grabber};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    gigegrab::CONFIG.store(Arc::new(config.clone()));

    logging::init(&config.logging)?;
    info!("gigegrab launching...");

    let sim = SimDriver::new();
    let driver: Arc<dyn Driver> = sim.clone();

    let mut grabber = Grabber::new(&driver, &config);
    grabber.set_verbose(config.logging.verbose);
    grabber.setup().map_err(|e| eyre!("failed to set up grabber: {e}"))?;

    // Cameras appear after setup so discovery sees them hot-plugged
    for camera in &config.sim.cameras {
        info!(id = %camera.id, "plugging simulated camera");
        sim.plug(camera.clone());
    }

    let pixels = grabber.subscribe(8);
    tokio::spawn(async move {
        while let Ok(frame) = pixels.recv_async().await {
            tracing::trace!(frame = frame.frame_count, bytes = frame.data.len(), "subscriber frame");
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(16));
    let mut report = Instant::now();
    let mut frames = 0u32;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                grabber.update();
                if grabber.is_frame_new() {
                    frames += 1;
                    if grabber.is_pixel_size_changed() {
                        info!(
                            width = grabber.width(),
                            height = grabber.height(),
                            format = ?grabber.pixel_format(),
                            "frame size changed"
                        );
                    }
                }

                if report.elapsed() >= Duration::from_secs(5) {
                    let fps = frames as f64 / report.elapsed().as_secs_f64();
                    if grabber.is_connected() {
                        info!(
                            device = %grabber.device_id(),
                            fps,
                            camera_fps = grabber.frame_rate(),
                            "streaming"
                        );
                    } else {
                        warn!("no camera connected");
                        grabber.list_devices();
                    }
                    frames = 0;
                    report = Instant::now();
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    grabber.close();
    info!("gigegrab shutting down");
    Ok(())
}
