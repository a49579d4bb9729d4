//! Record 6DOF poses of the first device to a CSV file.
//!
//! Usage: cargo run --example save_pose [path]   (default: 6dof.csv)
//! Press Enter to start recording, Enter again to stop.
//!
//! Every pose reaches the file through a tap; a 60 Hz poller prints the
//! current pose once a second.

use parking_lot::Mutex;
use std::io::BufRead;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xvcapture::{
    CaptureConfig, CaptureError, ConsumerLoop, ControllerState, DeviceRegistry, Pose,
    PoseCsvWriter, StreamControl, StreamKind,
};

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "6dof.csv".to_string());
    if let Err(e) = run(&path) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn wait_for_enter(prompt: &str) -> xvcapture::Result<()> {
    println!("{}", prompt);
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

fn run(path: &str) -> xvcapture::Result<()> {
    let config = CaptureConfig::from_env().with_streams([StreamKind::Slam]);
    let tap_capacity = config.tap_capacity;
    let registry = DeviceRegistry::new(xvcapture::open_source(&config)?, config);
    registry.discover()?;

    // First device whose SLAM stream actually started.
    let session = registry
        .sessions()
        .into_iter()
        .find(|s| {
            s.stream::<Pose>()
                .is_some_and(|slam| slam.state() == ControllerState::Running)
        })
        .ok_or(CaptureError::NothingStarted)?;
    let slam = session.stream::<Pose>().ok_or(CaptureError::NothingStarted)?;
    println!("Recording device {}", session.id());

    let writer = Arc::new(Mutex::new(PoseCsvWriter::create(path)?));
    let recording = Arc::new(AtomicBool::new(false));

    let recorder = {
        let writer = Arc::clone(&writer);
        let recording = Arc::clone(&recording);
        ConsumerLoop::drain("pose-csv", slam.subscribe(tap_capacity), move |pose| {
            if !recording.load(Ordering::Relaxed) {
                return ControlFlow::Continue(());
            }
            match writer.lock().write_pose(pose.frame()) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    log::error!("CSV write failed: {}", e);
                    ControlFlow::Break(())
                }
            }
        })?
    };

    let mut ticks = 0u64;
    let printer = ConsumerLoop::poll(
        "pose-print",
        slam.cache(),
        Duration::from_secs_f64(1.0 / 60.0),
        move |pose| {
            ticks += 1;
            if ticks % 60 == 0 {
                println!("{}", pose.frame());
            }
        },
    )?;

    wait_for_enter("Press Enter to start recording")?;
    recording.store(true, Ordering::Relaxed);
    wait_for_enter("Recording... press Enter to stop")?;
    recording.store(false, Ordering::Relaxed);

    drop(printer);
    drop(recorder);
    registry.shutdown();

    let mut writer = writer.lock();
    writer.flush()?;
    println!("Wrote {} poses to {}", writer.rows(), path);
    Ok(())
}
