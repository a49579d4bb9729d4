//! Application-side threads that read what the stream controllers publish.

use crate::cache::{LatestFrameCache, Stamped};
use crate::registry::DeviceRegistry;
use crate::types::Pose;
use crate::{CaptureError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest a loop body blocks before the stop flag is checked again.
const STOP_CHECK: Duration = Duration::from_millis(20);

/// A named consumer thread that runs its body until stopped.
///
/// The body is called repeatedly; returning `ControlFlow::Break(())` ends the
/// loop early. Dropping the handle stops and joins the thread.
pub struct ConsumerLoop {
    name: String,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConsumerLoop {
    pub fn spawn<F>(name: impl Into<String>, mut body: F) -> Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let name = name.into();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while !stop_clone.load(Ordering::Relaxed) {
                    if body().is_break() {
                        break;
                    }
                }
            })
            .map_err(|e| CaptureError::Sdk(format!("Failed to spawn {} thread: {}", name, e)))?;

        log::debug!("{} started", name);
        Ok(Self {
            name,
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Read `cache` every `period` and hand the latest frame to `f`.
    ///
    /// Ticks before the first publish are skipped.
    pub fn poll<P, F>(
        name: impl Into<String>,
        cache: Arc<LatestFrameCache<P>>,
        period: Duration,
        mut f: F,
    ) -> Result<Self>
    where
        P: Send + Sync + 'static,
        F: FnMut(&Arc<Stamped<P>>) + Send + 'static,
    {
        // None once the schedule runs past what an Instant can hold.
        let mut next = Some(Instant::now());
        Self::spawn(name, move || {
            let now = Instant::now();
            let due = match next {
                Some(due) => due,
                None => {
                    std::thread::sleep(STOP_CHECK);
                    return ControlFlow::Continue(());
                }
            };
            if now < due {
                std::thread::sleep((due - now).min(STOP_CHECK));
                return ControlFlow::Continue(());
            }
            if let Some(latest) = cache.try_read() {
                f(&latest);
            }
            // Fell behind by more than a tick: resync instead of bursting.
            next = match due.checked_add(period) {
                Some(n) if n.checked_add(period).is_some_and(|after| after < now) => {
                    now.checked_add(period)
                }
                other => other,
            };
            ControlFlow::Continue(())
        })
    }

    /// Call `f` once per new frame in `cache`, blocking between updates.
    ///
    /// Frames published faster than `f` runs are skipped; `f` always sees the
    /// newest one.
    pub fn watch<P, F>(name: impl Into<String>, cache: Arc<LatestFrameCache<P>>, mut f: F) -> Result<Self>
    where
        P: Send + Sync + 'static,
        F: FnMut(&Arc<Stamped<P>>) + Send + 'static,
    {
        let mut seen = 0;
        Self::spawn(name, move || {
            if let Some(frame) = cache.wait_for_update(seen, STOP_CHECK) {
                seen = frame.sequence();
                f(&frame);
            }
            ControlFlow::Continue(())
        })
    }

    /// Consume every item of `rx` until stopped or the sender side is gone.
    pub fn drain<T, F>(name: impl Into<String>, rx: Receiver<T>, mut f: F) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) -> ControlFlow<()> + Send + 'static,
    {
        Self::spawn(name, move || match rx.recv_timeout(STOP_CHECK) {
            Ok(item) => f(item),
            Err(RecvTimeoutError::Timeout) => ControlFlow::Continue(()),
            Err(RecvTimeoutError::Disconnected) => ControlFlow::Break(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the loop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("{} panicked", self.name);
            } else {
                log::debug!("{} stopped", self.name);
            }
        }
    }
}

impl Drop for ConsumerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Writes poses as CSV rows.
///
/// Columns: host timestamp (s), position (m), pitch/yaw/roll (deg), confidence.
pub struct PoseCsvWriter<W: Write> {
    out: W,
    rows: u64,
}

impl PoseCsvWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        log::info!("Writing poses to {}", path.as_ref().display());
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PoseCsvWriter<W> {
    pub const HEADER: &'static str = "timestamp,x,y,z,pitch,yaw,roll,confidence";

    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "{}", Self::HEADER)?;
        Ok(Self { out, rows: 0 })
    }

    pub fn write_pose(&mut self, pose: &Pose) -> Result<()> {
        let [x, y, z] = pose.translation;
        let [pitch, yaw, roll] = pose.pitch_yaw_roll_deg();
        writeln!(
            self.out,
            "{:.6},{:.6},{:.6},{:.6},{:.4},{:.4},{:.4},{:.4}",
            pose.host_timestamp_s, x, y, z, pitch, yaw, roll, pose.confidence
        )?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Log the rate of every stream of every session each `period`.
pub fn spawn_stats_reporter(registry: Arc<DeviceRegistry>, period: Duration) -> Result<ConsumerLoop> {
    let mut last = Instant::now();
    ConsumerLoop::spawn("xvcapture-stats", move || {
        let elapsed = last.elapsed();
        if elapsed < period {
            std::thread::sleep((period - elapsed).min(STOP_CHECK));
            return ControlFlow::Continue(());
        }
        last = Instant::now();

        for session in registry.sessions() {
            let line = session
                .stats()
                .iter()
                .map(|s| format!("{}@{:.0}fps", s.kind, s.fps))
                .collect::<Vec<_>>()
                .join(" ");
            log::info!("device: {}  [{:?}] {}", session.id(), session.state(), line);
        }
        ControlFlow::Continue(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn pose(t: f64) -> Pose {
        Pose {
            translation: [1.0, 2.0, 3.0],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            edge_timestamp_us: 10,
            host_timestamp_s: t,
            confidence: 0.5,
        }
    }

    #[test]
    fn test_csv_header_and_rows() {
        let mut writer = PoseCsvWriter::new(Vec::new()).unwrap();
        writer.write_pose(&pose(1.5)).unwrap();
        writer.write_pose(&pose(2.0)).unwrap();
        assert_eq!(writer.rows(), 2);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,x,y,z,pitch,yaw,roll,confidence");
        assert_eq!(
            lines[1],
            "1.500000,1.000000,2.000000,3.000000,0.0000,0.0000,0.0000,0.5000"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_watch_sees_latest() {
        let cache = Arc::new(LatestFrameCache::new());
        let last = Arc::new(AtomicU64::new(0));
        let l = last.clone();
        let mut watcher = ConsumerLoop::watch("watch", cache.clone(), move |s: &Arc<Stamped<u32>>| {
            l.store(u64::from(*s.frame()), Ordering::SeqCst);
        })
        .unwrap();

        for i in 1..=5u32 {
            cache.publish(i);
            std::thread::sleep(Duration::from_millis(5));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while last.load(Ordering::SeqCst) != 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        watcher.stop();
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert!(watcher.is_finished());
    }

    #[test]
    fn test_poll_skips_until_published() {
        let cache: Arc<LatestFrameCache<u32>> = Arc::new(LatestFrameCache::new());
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let poller = ConsumerLoop::poll("poll", cache.clone(), Duration::from_millis(5), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        cache.publish(7);
        std::thread::sleep(Duration::from_millis(100));
        drop(poller);
        assert!(hits.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn test_drain_ends_when_sender_dropped() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let sum = Arc::new(AtomicU64::new(0));
        let s = sum.clone();
        let drain = ConsumerLoop::drain("drain", rx, move |v: u64| {
            s.fetch_add(v, Ordering::SeqCst);
            ControlFlow::Continue(())
        })
        .unwrap();

        for v in 1..=4 {
            tx.send(v).unwrap();
        }
        drop(tx);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !drain.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(drain.is_finished());
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }
}
