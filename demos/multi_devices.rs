//! Start the configured streams on every attached device and log their rates.
//!
//! Usage: cargo run --example multi_devices
//! Real hardware: XVCAPTURE_BACKEND=xr50 XVCAPTURE_STREAMS=slam,orientation,imu
//! Keep looking for devices in the background: XVCAPTURE_DISCOVERY_MODE=poll
//! Press Enter to stop.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use xvcapture::{
    spawn_stats_reporter, CaptureConfig, CaptureError, ConsumerLoop, ControllerState,
    DeviceRegistry, DiscoveryMode, Pose,
};

fn main() {
    env_logger::init();

    if let Err(e) = run(CaptureConfig::from_env()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: CaptureConfig) -> xvcapture::Result<()> {
    let source = xvcapture::open_source(&config)?;
    let monitor = config.discovery_mode == DiscoveryMode::Poll;
    let registry = Arc::new(DeviceRegistry::new(source, config));

    registry.discover()?;
    println!("{} device(s):", registry.len());
    for session in registry.sessions() {
        let started: Vec<String> = session
            .controllers()
            .filter(|c| c.state() == ControllerState::Running)
            .map(|c| c.kind().to_string())
            .collect();
        println!("  {}  [{}]", session.id(), started.join(", "));
    }

    let running = registry
        .sessions()
        .iter()
        .any(|s| s.controllers().any(|c| c.state() == ControllerState::Running));
    if !running {
        return Err(CaptureError::NothingStarted);
    }

    if monitor {
        registry.spawn_monitor()?;
    }

    let mut consumers = vec![spawn_stats_reporter(Arc::clone(&registry), Duration::from_secs(2))?];
    for session in registry.sessions() {
        if let Some(poses) = session.cache::<Pose>() {
            let id = session.id().to_string();
            let mut shown = 0u64;
            consumers.push(ConsumerLoop::watch(format!("pose-{}", id), poses, move |pose| {
                shown += 1;
                if shown % 1000 == 1 {
                    println!("device: {}  pose {}", id, pose.frame());
                }
            })?);
        }
    }

    println!("Press Enter to stop");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    drop(consumers);
    let fatal = registry.take_fatal_error();
    registry.shutdown();
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
