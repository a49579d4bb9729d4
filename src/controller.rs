use crate::cache::{LatestFrameCache, Stamped};
use crate::config::ControllerOptions;
use crate::fps::FrameRateCounter;
use crate::sdk::{CallbackId, FrameCallback, SensorDevice, SensorStream};
use crate::types::{
    ColorImage, DepthImage, EyeTrackingImages, FisheyeImages, Frame, FramePayload, ImuSample,
    Orientation, Pose, StreamHandle, StreamKind,
};
use crate::{CaptureError, Result};
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle of one stream controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    /// The device does not offer this stream.
    Unavailable,
    /// Registration or start was rejected by the SDK.
    Failed,
}

/// Object-safe view of a [`StreamController`], so a session can hold
/// controllers of every payload type side by side.
pub trait StreamControl: Send + Sync {
    fn handle(&self) -> &StreamHandle;

    fn kind(&self) -> StreamKind {
        self.handle().kind
    }

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn state(&self) -> ControllerState;

    fn fps(&self) -> f64;

    fn frames_received(&self) -> u64;

    fn frames_skipped(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

/// Observer run on the delivery thread after each publish.
pub type FrameHook<P> = Arc<dyn Fn(&Stamped<P>) + Send + Sync>;

type Tap<P> = Sender<Arc<Stamped<P>>>;

/// State touched by the delivery thread.
struct Shared<P> {
    handle: StreamHandle,
    log_every: u64,
    active: AtomicBool,
    received: AtomicU64,
    skipped: AtomicU64,
    counter: Mutex<FrameRateCounter>,
    cache: Arc<LatestFrameCache<P>>,
    taps: ArcSwap<Vec<Tap<P>>>,
    hook: Mutex<Option<FrameHook<P>>>,
}

impl<P: FramePayload> Shared<P> {
    fn on_frame(&self, frame: Frame) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let actual = frame.kind();
        let Some(payload) = P::from_frame(frame) else {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed);
            if skipped % 100 == 0 {
                log::warn!(
                    "{}: skipping unusable {} frame ({} skipped so far)",
                    self.handle,
                    actual,
                    skipped + 1
                );
            }
            return;
        };

        let fps = {
            let mut counter = self.counter.lock();
            counter.tic();
            counter.fps()
        };

        let n = self.received.fetch_add(1, Ordering::Relaxed);
        if self.log_every > 0 && n % self.log_every == 0 {
            log::info!(
                "device: {}  {}@{}fps {}",
                self.handle.device_id,
                self.handle.kind,
                fps.round(),
                payload
            );
        }

        let stamped = self.cache.publish(payload);

        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(&stamped))).is_err() {
                log::error!(
                    "{}: frame hook panicked on frame {}, skipped",
                    self.handle,
                    stamped.sequence()
                );
            }
        }

        for tap in self.taps.load().iter() {
            match tap.try_send(Arc::clone(&stamped)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::trace!("{}: tap full, dropping frame", self.handle);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

struct Registration {
    stream: Arc<dyn SensorStream>,
    id: CallbackId,
}

/// Drives one stream of one device and feeds its frames into a rate counter
/// and a latest-frame cache.
///
/// At most one callback is registered at a time; `start` and `stop` are
/// idempotent.
pub struct StreamController<P: FramePayload> {
    device: Arc<dyn SensorDevice>,
    shared: Arc<Shared<P>>,
    registration: Mutex<Option<Registration>>,
    state: Mutex<ControllerState>,
}

impl<P: FramePayload> StreamController<P> {
    pub fn new(device: Arc<dyn SensorDevice>, options: ControllerOptions) -> Self {
        let handle = StreamHandle::new(device.id(), P::KIND);
        Self {
            device,
            shared: Arc::new(Shared {
                handle,
                log_every: options.log_every,
                active: AtomicBool::new(false),
                received: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                counter: Mutex::new(FrameRateCounter::with_window(options.fps_window)),
                cache: Arc::new(LatestFrameCache::new()),
                taps: ArcSwap::from_pointee(Vec::new()),
                hook: Mutex::new(None),
            }),
            registration: Mutex::new(None),
            state: Mutex::new(ControllerState::Idle),
        }
    }

    /// The cache this controller publishes into.
    pub fn cache(&self) -> Arc<LatestFrameCache<P>> {
        Arc::clone(&self.shared.cache)
    }

    pub fn latest(&self) -> Option<Arc<Stamped<P>>> {
        self.shared.cache.try_read()
    }

    /// Receive every frame, not just the latest, through a bounded channel.
    ///
    /// Delivery never blocks the producer: when the channel is full the frame
    /// is dropped for this subscriber.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<Stamped<P>>> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.shared.taps.rcu(|taps| {
            let mut taps = Vec::clone(taps);
            taps.push(tx.clone());
            taps
        });
        rx
    }

    /// Install an observer that runs on the delivery thread for each frame.
    ///
    /// It must not block. A panic inside it is caught and logged.
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&Stamped<P>) + Send + Sync + 'static,
    {
        *self.shared.hook.lock() = Some(Arc::new(hook));
    }

    fn fail(&self, state: ControllerState) {
        self.shared.active.store(false, Ordering::Release);
        *self.state.lock() = state;
    }
}

impl<P: FramePayload> StreamControl for StreamController<P> {
    fn handle(&self) -> &StreamHandle {
        &self.shared.handle
    }

    fn start(&self) -> Result<()> {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            log::debug!("{} already started", self.shared.handle);
            return Ok(());
        }

        let unavailable = || CaptureError::CapabilityUnavailable {
            device: self.shared.handle.device_id.clone(),
            kind: P::KIND,
        };
        if !self.device.has_stream(P::KIND) {
            self.fail(ControllerState::Unavailable);
            return Err(unavailable());
        }
        let Some(stream) = self.device.stream(P::KIND) else {
            self.fail(ControllerState::Unavailable);
            return Err(unavailable());
        };

        let shared = Arc::clone(&self.shared);
        let callback: FrameCallback = Arc::new(move |frame| shared.on_frame(frame));

        self.shared.active.store(true, Ordering::Release);
        let id = match stream.register_callback(callback) {
            Ok(id) => id,
            Err(e) => {
                self.fail(ControllerState::Failed);
                return Err(CaptureError::RegistrationRejected {
                    device: self.shared.handle.device_id.clone(),
                    kind: P::KIND,
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = stream.start() {
            if let Err(unreg) = stream.unregister_callback(id) {
                log::warn!("{}: unregister after failed start: {}", self.shared.handle, unreg);
            }
            self.fail(ControllerState::Failed);
            return Err(e);
        }

        *registration = Some(Registration { stream, id });
        *self.state.lock() = ControllerState::Running;
        log::info!("{} started (callback {})", self.shared.handle, id);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut registration = self.registration.lock();
        let Some(Registration { stream, id }) = registration.take() else {
            return Ok(());
        };

        self.shared.active.store(false, Ordering::Release);
        match stream.unregister_callback(id) {
            Ok(true) => {}
            Ok(false) => log::debug!("{}: callback {} already unregistered", self.shared.handle, id),
            Err(e) => log::warn!("{}: unregister callback {}: {}", self.shared.handle, id, e),
        }

        let result = stream.stop();
        *self.state.lock() = ControllerState::Idle;
        log::info!("{} stopped", self.shared.handle);
        result
    }

    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn fps(&self) -> f64 {
        self.shared.counter.lock().fps()
    }

    fn frames_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    fn frames_skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<P: FramePayload> Drop for StreamController<P> {
    fn drop(&mut self) {
        if let Err(e) = StreamControl::stop(self) {
            log::warn!("{}: stop on drop: {}", self.shared.handle, e);
        }
    }
}

/// Build the controller matching `kind`.
pub fn controller_for(
    kind: StreamKind,
    device: Arc<dyn SensorDevice>,
    options: ControllerOptions,
) -> Box<dyn StreamControl> {
    match kind {
        StreamKind::Orientation => Box::new(StreamController::<Orientation>::new(device, options)),
        StreamKind::Fisheye => Box::new(StreamController::<FisheyeImages>::new(device, options)),
        StreamKind::Color => Box::new(StreamController::<ColorImage>::new(device, options)),
        StreamKind::Depth => Box::new(StreamController::<DepthImage>::new(device, options)),
        StreamKind::Slam => Box::new(StreamController::<Pose>::new(device, options)),
        StreamKind::Imu => Box::new(StreamController::<ImuSample>::new(device, options)),
        StreamKind::EyeTracking => {
            Box::new(StreamController::<EyeTrackingImages>::new(device, options))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticDevice;
    use crate::types::Capabilities;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_start_publishes_into_cache() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Slam, 200.0).build();
        let controller = StreamController::<Pose>::new(device.clone(), ControllerOptions::default());

        assert!(controller.latest().is_none());
        controller.start().unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        assert!(wait_for(|| controller.frames_received() >= 5));

        let latest = controller.latest().unwrap();
        assert!(latest.confidence > 0.0);
        controller.stop().unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_start_twice_registers_once() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Imu, 100.0).build();
        let stream = device.synthetic_stream(StreamKind::Imu).unwrap();
        let controller = StreamController::<ImuSample>::new(device.clone(), ControllerOptions::default());

        controller.start().unwrap();
        controller.start().unwrap();
        assert_eq!(stream.registered_callbacks(), 1);
        assert_eq!(stream.start_calls(), 1);
        controller.stop().unwrap();
    }

    #[test]
    fn test_stop_start_stop_leaves_nothing_registered() {
        let device = SyntheticDevice::builder("dev0")
            .stream(StreamKind::Orientation, 100.0)
            .build();
        let stream = device.synthetic_stream(StreamKind::Orientation).unwrap();
        let controller =
            StreamController::<Orientation>::new(device.clone(), ControllerOptions::default());

        controller.stop().unwrap();
        assert_eq!(stream.registered_callbacks(), 0);
        assert!(!stream.is_running());

        controller.start().unwrap();
        assert_eq!(stream.registered_callbacks(), 1);
        assert!(stream.is_running());

        controller.stop().unwrap();
        controller.stop().unwrap();
        assert_eq!(stream.registered_callbacks(), 0);
        assert!(!stream.is_running());

        for _ in 0..3 {
            controller.start().unwrap();
            controller.stop().unwrap();
        }
        assert_eq!(stream.registered_callbacks(), 0);
    }

    #[test]
    fn test_missing_capability() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Slam, 100.0).build();
        let controller =
            StreamController::<DepthImage>::new(device.clone(), ControllerOptions::default());

        let err = controller.start().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::CapabilityUnavailable { kind: StreamKind::Depth, .. }
        ));
        assert_eq!(controller.state(), ControllerState::Unavailable);
        controller.stop().unwrap();
    }

    #[test]
    fn test_advertised_but_absent_stream_is_unavailable() {
        let device = SyntheticDevice::builder("dev0")
            .stream(StreamKind::Slam, 100.0)
            .advertise(Capabilities::COLOR)
            .build();
        let controller =
            StreamController::<ColorImage>::new(device.clone(), ControllerOptions::default());
        assert!(matches!(
            controller.start(),
            Err(CaptureError::CapabilityUnavailable { .. })
        ));
    }

    #[test]
    fn test_registration_rejected() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Color, 30.0).build();
        let stream = device.synthetic_stream(StreamKind::Color).unwrap();
        stream.reject_registrations(true);

        let controller =
            StreamController::<ColorImage>::new(device.clone(), ControllerOptions::default());
        let err = controller.start().unwrap_err();
        assert!(matches!(err, CaptureError::RegistrationRejected { .. }));
        assert!(err.is_local());
        assert_eq!(controller.state(), ControllerState::Failed);
        assert!(!stream.is_running());

        stream.reject_registrations(false);
        controller.start().unwrap();
        assert_eq!(stream.registered_callbacks(), 1);
        controller.stop().unwrap();
    }

    #[test]
    fn test_subscribe_sees_every_frame() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Slam, 500.0).build();
        let controller = StreamController::<Pose>::new(device.clone(), ControllerOptions::default());
        let rx = controller.subscribe(1024);

        controller.start().unwrap();
        assert!(wait_for(|| controller.frames_received() >= 20));
        controller.stop().unwrap();

        let sequences: Vec<u64> = rx.try_iter().map(|s| s.sequence()).collect();
        assert_eq!(sequences.len() as u64, controller.frames_received());
        assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_panicking_hook_does_not_kill_delivery() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Imu, 200.0).build();
        let controller =
            StreamController::<ImuSample>::new(device.clone(), ControllerOptions::default());
        controller.set_hook(|stamped| {
            if stamped.sequence() == 2 {
                panic!("hook failure");
            }
        });

        controller.start().unwrap();
        assert!(wait_for(|| controller.frames_received() >= 10));
        controller.stop().unwrap();
    }

    #[test]
    fn test_controller_for_kind() {
        let device = SyntheticDevice::builder("dev0").stream(StreamKind::Fisheye, 30.0).build();
        for kind in StreamKind::ALL {
            let controller = controller_for(kind, device.clone(), ControllerOptions::default());
            assert_eq!(controller.kind(), kind);
            assert_eq!(controller.handle().device_id, "dev0");
        }
        let fisheye = controller_for(StreamKind::Fisheye, device, ControllerOptions::default());
        assert!(fisheye
            .as_any()
            .downcast_ref::<StreamController<FisheyeImages>>()
            .is_some());
    }
}
