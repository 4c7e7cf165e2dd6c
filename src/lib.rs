pub mod capture;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod grabber;
pub mod logging;
pub mod system;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::driver::sim::SimCameraConfig;

pub use capture::{Frame, PixelFormat, Pixels};
pub use device::{AccessMode, Device};
pub use discovery::{Discovery, DiscoveryTrigger, DISCOVERY_ANY_ID};
pub use error::{DriverError, Error, Result};
pub use grabber::Grabber;
pub use system::System;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix of environment overrides, e.g. `GIGEGRAB__GRABBER__READ_ONLY=true`.
pub const ENV_PREFIX: &str = "GIGEGRAB";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grabber: GrabberConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
    pub sim: SimConfig,
}

impl Config {
    /// Defaults, overlaid with `path` (TOML) if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Desired connection, mirrored by the grabber setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrabberConfig {
    /// Empty connects to any camera.
    pub device_id: String,
    pub read_only: bool,
    pub multicast: bool,
    /// Negative disables user set loading.
    pub user_set: i32,
    pub pixel_format: String,
    /// Clamped into the camera's range on connect.
    pub frame_rate: f64,
    pub close_retries: u32,
    pub close_retry_interval_ms: u64,
}

impl GrabberConfig {
    pub fn close_retry_interval(&self) -> Duration {
        Duration::from_millis(self.close_retry_interval_ms)
    }
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            device_id: DISCOVERY_ANY_ID.into(),
            read_only: false,
            multicast: false,
            user_set: -1,
            pixel_format: "BGR8Packed".into(),
            frame_rate: 1000.0,
            close_retries: 3,
            close_retry_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer_count: usize,
    /// Monitor tick while capturing.
    pub health_interval_ms: u64,
    /// No frame for this long counts as a stall.
    pub stalled_timeout_ms: u64,
    /// Grace period after opening before stalls are considered.
    pub initialize_timeout_ms: u64,
    /// Back-off between failed open attempts.
    pub retry_interval_ms: u64,
}

impl StreamConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_millis(self.stalled_timeout_ms)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            health_interval_ms: 100,
            stalled_timeout_ms: 1500,
            initialize_timeout_ms: 1000,
            retry_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "gigegrab=info".into(),
            verbose: false,
        }
    }
}

/// Cameras exposed by the simulated driver of the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub cameras: Vec<SimCameraConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cameras: vec![SimCameraConfig::default()],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_camera_timings() {
        let config = Config::default();
        assert_eq!(config.stream.buffer_count, 4);
        assert_eq!(config.stream.health_interval(), Duration::from_millis(100));
        assert_eq!(config.stream.stalled_timeout(), Duration::from_millis(1500));
        assert_eq!(config.stream.initialize_timeout(), Duration::from_millis(1000));
        assert_eq!(config.grabber.device_id, DISCOVERY_ANY_ID);
        assert_eq!(config.grabber.pixel_format, "BGR8Packed");
        assert_eq!(config.grabber.user_set, -1);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("gigegrab-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[grabber]
device_id = "DEV_000F31000042"
read_only = true

[stream]
stalled_timeout_ms = 250

[[sim.cameras]]
id = "DEV_000F31000042"
width = 320
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.grabber.device_id, "DEV_000F31000042");
        assert!(config.grabber.read_only);
        assert_eq!(config.grabber.pixel_format, "BGR8Packed");
        assert_eq!(config.stream.stalled_timeout_ms, 250);
        assert_eq!(config.stream.buffer_count, 4);
        assert_eq!(config.sim.cameras.len(), 1);
        assert_eq!(config.sim.cameras[0].width, 320);
        assert_eq!(config.sim.cameras[0].height, 480);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = Path::new("/nonexistent/gigegrab.toml");
        assert!(matches!(Config::load(Some(path)), Err(Error::Config(_))));
    }
}
