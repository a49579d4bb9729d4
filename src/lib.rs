//! # xvcapture - multi-device frame acquisition for XVisio sensors
//!
//! Discovers devices, starts the configured sensor streams on each, and hands
//! the newest frame of every stream to any number of consumer threads:
//! - a [`DeviceRegistry`] keeps one [`DeviceSession`] per device
//! - a session owns one [`StreamController`] per stream kind
//! - each controller measures the arrival rate and publishes into a
//!   lock-free [`LatestFrameCache`]
//!
//! ## Quick Start
//! ```no_run
//! use xvcapture::{CaptureConfig, DeviceRegistry, Pose, SyntheticSource};
//! use std::time::Duration;
//!
//! let registry = DeviceRegistry::new(SyntheticSource::demo_fleet(2), CaptureConfig::default());
//! registry.discover().unwrap();
//!
//! for session in registry.sessions() {
//!     let poses = session.cache::<Pose>().unwrap();
//!     if let Some(pose) = poses.wait_for_update(0, Duration::from_secs(1)) {
//!         println!("{}: {}", session.id(), pose.frame());
//!     }
//! }
//! registry.shutdown();
//! ```

pub mod cache;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod fps;
pub mod hid;
pub mod protocol;
pub mod registry;
pub mod sdk;
pub mod session;
pub mod synthetic;
pub mod types;
pub mod xr50;

pub use cache::{LatestFrameCache, Stamped};
pub use config::{Backend, CaptureConfig, DiscoveryMode, LogSampling};
pub use consumer::{spawn_stats_reporter, ConsumerLoop, PoseCsvWriter};
pub use controller::{ControllerState, StreamControl, StreamController};
pub use error::CaptureError;
pub use fps::FrameRateCounter;
pub use registry::{DeviceRegistry, RegistryState};
pub use sdk::{DeviceMap, DeviceSource, SensorDevice, SensorStream};
pub use session::{DeviceSession, SessionState, StartReport};
pub use synthetic::{SyntheticDevice, SyntheticSource};
pub use types::*;
pub use xr50::Xr50Source;

use std::sync::Arc;

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Open the device backend selected by `config.backend`.
pub fn open_source(config: &CaptureConfig) -> Result<Arc<dyn DeviceSource>> {
    let source: Arc<dyn DeviceSource> = match config.backend {
        Backend::Synthetic => SyntheticSource::demo_fleet(2),
        Backend::Xr50 => Xr50Source::new()?,
    };
    Ok(source)
}
