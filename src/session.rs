use crate::cache::LatestFrameCache;
use crate::config::CaptureConfig;
use crate::controller::{controller_for, ControllerState, StreamControl, StreamController};
use crate::sdk::SensorDevice;
use crate::types::{FramePayload, StreamKind};
use crate::{CaptureError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    /// The device vanished from discovery; its streams have been stopped.
    Lost,
    Stopped,
}

/// Outcome of [`DeviceSession::start`] for the streams that could be started
/// and those that were skipped.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<StreamKind>,
    pub skipped: Vec<(StreamKind, CaptureError)>,
}

/// Snapshot of one stream for reporting.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub kind: StreamKind,
    pub state: ControllerState,
    pub fps: f64,
    pub frames: u64,
    pub skipped: u64,
}

/// All stream controllers of one device, started and stopped together.
///
/// This is the context object consumers get their caches from; two sessions
/// are equal when they are for the same device.
pub struct DeviceSession {
    id: String,
    device: Arc<dyn SensorDevice>,
    controllers: Vec<Box<dyn StreamControl>>,
    /// Indices into `controllers`, in start order.
    started: Mutex<Vec<usize>>,
    state: Mutex<SessionState>,
}

impl DeviceSession {
    /// One controller per distinct kind in `config.streams`.
    pub fn new(device: Arc<dyn SensorDevice>, config: &CaptureConfig) -> Self {
        let mut controllers: Vec<Box<dyn StreamControl>> = Vec::new();
        for &kind in &config.streams {
            if controllers.iter().any(|c| c.kind() == kind) {
                log::debug!("device: {}  {} configured twice", device.id(), kind);
                continue;
            }
            controllers.push(controller_for(
                kind,
                Arc::clone(&device),
                config.controller_options(kind),
            ));
        }
        Self::with_controllers(device, controllers)
    }

    /// Only the first controller of each kind is kept.
    pub fn with_controllers(
        device: Arc<dyn SensorDevice>,
        controllers: Vec<Box<dyn StreamControl>>,
    ) -> Self {
        let mut unique: Vec<Box<dyn StreamControl>> = Vec::with_capacity(controllers.len());
        for controller in controllers {
            if unique.iter().any(|c| c.kind() == controller.kind()) {
                log::warn!("device: {}  dropping second {} controller", device.id(), controller.kind());
                continue;
            }
            unique.push(controller);
        }
        Self {
            id: device.id().to_string(),
            device,
            controllers: unique,
            started: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::Created),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &Arc<dyn SensorDevice> {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Start every configured stream.
    ///
    /// A stream that is missing or whose registration is rejected is skipped
    /// and reported; the other streams still start. Any other error is fatal:
    /// the streams started so far are stopped again and the error returned.
    pub fn start(&self) -> Result<StartReport> {
        let mut started = self.started.lock();
        let mut report = StartReport::default();

        for (index, controller) in self.controllers.iter().enumerate() {
            if started.contains(&index) {
                report.started.push(controller.kind());
                continue;
            }
            match controller.start() {
                Ok(()) => {
                    started.push(index);
                    report.started.push(controller.kind());
                }
                Err(e) if e.is_local() => {
                    log::warn!("device: {}  {} skipped: {}", self.id, controller.kind(), e);
                    report.skipped.push((controller.kind(), e));
                }
                Err(e) => {
                    log::error!("device: {}  {} failed: {}", self.id, controller.kind(), e);
                    self.stop_started(&mut started);
                    *self.state.lock() = SessionState::Stopped;
                    return Err(e);
                }
            }
        }

        *self.state.lock() = SessionState::Running;
        log::info!(
            "device: {}  session running ({} started, {} skipped)",
            self.id,
            report.started.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Stop every started stream in reverse start order.
    pub fn stop(&self) {
        let mut started = self.started.lock();
        self.stop_started(&mut started);
        let mut state = self.state.lock();
        if *state != SessionState::Lost {
            *state = SessionState::Stopped;
        }
    }

    /// Stop the streams and flag the device as gone.
    pub fn mark_lost(&self) {
        let mut started = self.started.lock();
        self.stop_started(&mut started);
        *self.state.lock() = SessionState::Lost;
        log::warn!("device: {}  lost", self.id);
    }

    fn stop_started(&self, started: &mut Vec<usize>) {
        while let Some(index) = started.pop() {
            let controller = &self.controllers[index];
            if let Err(e) = controller.stop() {
                log::warn!("device: {}  {} stop: {}", self.id, controller.kind(), e);
            }
        }
    }

    pub fn controllers(&self) -> impl Iterator<Item = &dyn StreamControl> {
        self.controllers.iter().map(|c| c.as_ref())
    }

    pub fn controller(&self, kind: StreamKind) -> Option<&dyn StreamControl> {
        self.controllers().find(|c| c.kind() == kind)
    }

    /// Typed controller for payload `P`.
    pub fn stream<P: FramePayload>(&self) -> Option<&StreamController<P>> {
        self.controller(P::KIND)?
            .as_any()
            .downcast_ref::<StreamController<P>>()
    }

    /// Cache of the stream carrying payload `P`.
    pub fn cache<P: FramePayload>(&self) -> Option<Arc<LatestFrameCache<P>>> {
        self.stream::<P>().map(|s| s.cache())
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        self.controllers()
            .map(|c| StreamStats {
                kind: c.kind(),
                state: c.state(),
                fps: c.fps(),
                frames: c.frames_received(),
                skipped: c.frames_skipped(),
            })
            .collect()
    }
}

impl PartialEq for DeviceSession {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceSession {}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let mut started = std::mem::take(self.started.get_mut());
        self.stop_started(&mut started);
    }
}
