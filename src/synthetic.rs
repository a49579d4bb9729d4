//! In-process backend that fabricates frames at fixed rates.
//!
//! Used by the tests and by the demo programs when no hardware is attached.
//! Devices can be plugged and unplugged at runtime and every stream can be
//! told to misbehave (reject registrations, fail to start).

use crate::sdk::{
    CallbackId, CallbackSet, DeviceMap, DeviceSource, FrameCallback, SensorDevice, SensorStream,
};
use crate::types::{
    host_clock_s, Capabilities, ColorImage, DepthImage, EyeTrackingImages, FisheyeImages, Frame,
    Image, ImageFormat, ImuSample, Orientation, Pose, StreamKind,
};
use crate::{CaptureError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default delivery rates for [`SyntheticSource::demo_fleet`].
const DEMO_RATES: [(StreamKind, f64); 7] = [
    (StreamKind::Orientation, 400.0),
    (StreamKind::Fisheye, 30.0),
    (StreamKind::Color, 30.0),
    (StreamKind::Depth, 15.0),
    (StreamKind::Slam, 500.0),
    (StreamKind::Imu, 400.0),
    (StreamKind::EyeTracking, 30.0),
];

pub struct SyntheticSource {
    devices: Mutex<BTreeMap<String, Arc<SyntheticDevice>>>,
    plugged: Condvar,
    discover_calls: AtomicU64,
}

impl SyntheticSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(BTreeMap::new()),
            plugged: Condvar::new(),
            discover_calls: AtomicU64::new(0),
        })
    }

    /// `count` devices offering every stream kind.
    pub fn demo_fleet(count: usize) -> Arc<Self> {
        let source = Self::new();
        for i in 0..count {
            let mut builder = SyntheticDevice::builder(format!("synthetic-{}", i));
            for (kind, rate) in DEMO_RATES {
                builder = builder.stream(kind, rate);
            }
            source.plug(builder.build());
        }
        source
    }

    pub fn plug(&self, device: Arc<SyntheticDevice>) {
        log::info!("synthetic device {} plugged", device.id());
        self.devices.lock().insert(device.id().to_string(), device);
        self.plugged.notify_all();
    }

    pub fn unplug(&self, id: &str) -> Option<Arc<SyntheticDevice>> {
        let device = self.devices.lock().remove(id);
        if device.is_some() {
            log::info!("synthetic device {} unplugged", id);
        }
        device
    }

    pub fn discover_calls(&self) -> u64 {
        self.discover_calls.load(Ordering::Relaxed)
    }
}

impl DeviceSource for SyntheticSource {
    fn discover(&self, timeout: Duration) -> DeviceMap {
        self.discover_calls.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now().checked_add(timeout);
        let mut devices = self.devices.lock();
        while devices.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.plugged.wait_until(&mut devices, deadline).timed_out() {
                        break;
                    }
                }
                None => self.plugged.wait(&mut devices),
            }
        }
        devices
            .iter()
            .map(|(id, dev)| (id.clone(), Arc::clone(dev) as Arc<dyn SensorDevice>))
            .collect()
    }
}

pub struct SyntheticDeviceBuilder {
    id: String,
    extra_capabilities: Capabilities,
    streams: Vec<(StreamKind, f64)>,
}

impl SyntheticDeviceBuilder {
    /// Offer `kind` at `rate_hz`.
    pub fn stream(mut self, kind: StreamKind, rate_hz: f64) -> Self {
        self.streams.retain(|(k, _)| *k != kind);
        self.streams.push((kind, rate_hz));
        self
    }

    /// Advertise capabilities without backing streams.
    pub fn advertise(mut self, capabilities: Capabilities) -> Self {
        self.extra_capabilities |= capabilities;
        self
    }

    pub fn build(self) -> Arc<SyntheticDevice> {
        let streams = self
            .streams
            .into_iter()
            .map(|(kind, rate)| (kind, Arc::new(SyntheticStream::new(&self.id, kind, rate))))
            .collect::<BTreeMap<_, _>>();
        let capabilities = streams
            .keys()
            .fold(self.extra_capabilities, |caps, kind| caps | kind.capability());
        Arc::new(SyntheticDevice {
            id: self.id,
            capabilities,
            streams,
        })
    }
}

pub struct SyntheticDevice {
    id: String,
    capabilities: Capabilities,
    streams: BTreeMap<StreamKind, Arc<SyntheticStream>>,
}

impl SyntheticDevice {
    pub fn builder(id: impl Into<String>) -> SyntheticDeviceBuilder {
        SyntheticDeviceBuilder {
            id: id.into(),
            extra_capabilities: Capabilities::empty(),
            streams: Vec::new(),
        }
    }

    /// Concrete stream handle, for inspecting or steering it in tests.
    pub fn synthetic_stream(&self, kind: StreamKind) -> Option<Arc<SyntheticStream>> {
        self.streams.get(&kind).cloned()
    }
}

impl SensorDevice for SyntheticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn stream(&self, kind: StreamKind) -> Option<Arc<dyn SensorStream>> {
        self.streams
            .get(&kind)
            .map(|s| Arc::clone(s) as Arc<dyn SensorStream>)
    }
}

struct Producer {
    stop_flag: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct SyntheticStream {
    device_id: String,
    kind: StreamKind,
    rate_hz: f64,
    callbacks: Arc<CallbackSet>,
    producer: Mutex<Option<Producer>>,
    reject_registrations: AtomicBool,
    fail_starts: AtomicBool,
    start_calls: AtomicU64,
    emitted: Arc<AtomicU64>,
}

impl SyntheticStream {
    fn new(device_id: &str, kind: StreamKind, rate_hz: f64) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            rate_hz: rate_hz.max(0.1),
            callbacks: Arc::new(CallbackSet::new()),
            producer: Mutex::new(None),
            reject_registrations: AtomicBool::new(false),
            fail_starts: AtomicBool::new(false),
            start_calls: AtomicU64::new(0),
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn reject_registrations(&self, reject: bool) {
        self.reject_registrations.store(reject, Ordering::Relaxed);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::Relaxed);
    }

    pub fn registered_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_running(&self) -> bool {
        self.producer.lock().is_some()
    }

    pub fn start_calls(&self) -> u64 {
        self.start_calls.load(Ordering::Relaxed)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl SensorStream for SyntheticStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn register_callback(&self, callback: FrameCallback) -> Result<CallbackId> {
        if self.reject_registrations.load(Ordering::Relaxed) {
            return Err(CaptureError::Sdk(format!(
                "{}/{}: callback slot unavailable",
                self.device_id, self.kind
            )));
        }
        Ok(self.callbacks.register(callback))
    }

    fn unregister_callback(&self, id: CallbackId) -> Result<bool> {
        Ok(self.callbacks.unregister(id))
    }

    fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_starts.load(Ordering::Relaxed) {
            return Err(CaptureError::Sdk(format!(
                "{}/{}: start failed",
                self.device_id, self.kind
            )));
        }

        let mut producer = self.producer.lock();
        if producer.is_some() {
            return Ok(());
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let emitted = Arc::clone(&self.emitted);
        let kind = self.kind;
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);

        let thread = std::thread::Builder::new()
            .name(format!("synthetic-{}", kind))
            .spawn(move || produce_loop(kind, period, callbacks, emitted, stop_clone))
            .map_err(|e| CaptureError::Sdk(format!("Failed to spawn producer thread: {}", e)))?;

        *producer = Some(Producer { stop_flag, thread });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let producer = self.producer.lock().take();
        if let Some(producer) = producer {
            producer.stop_flag.store(true, Ordering::Relaxed);
            if producer.thread.join().is_err() {
                return Err(CaptureError::Sdk(format!(
                    "{}/{}: producer thread panicked",
                    self.device_id, self.kind
                )));
            }
        }
        Ok(())
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        let _ = SensorStream::stop(self);
    }
}

fn produce_loop(
    kind: StreamKind,
    period: Duration,
    callbacks: Arc<CallbackSet>,
    emitted: Arc<AtomicU64>,
    stop_flag: Arc<AtomicBool>,
) {
    let epoch = Instant::now();
    let mut factory = FrameFactory::new(kind);
    let mut next = epoch;
    let mut index: u64 = 0;

    while !stop_flag.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep((next - now).min(Duration::from_millis(20)));
            continue;
        }

        let elapsed = epoch.elapsed();
        callbacks.dispatch(factory.make(index, elapsed));
        emitted.fetch_add(1, Ordering::Relaxed);
        index += 1;
        next += period;
    }
}

/// Builds plausible frames: a head moving on a circle, turning as it goes.
struct FrameFactory {
    kind: StreamKind,
    gray: Arc<[u8]>,
    color: Arc<[u8]>,
    depth: Arc<[u8]>,
}

impl FrameFactory {
    fn new(kind: StreamKind) -> Self {
        let empty: Arc<[u8]> = Arc::from(Vec::new());
        let buffer = |len: usize| -> Arc<[u8]> { Arc::from(vec![0u8; len]) };
        Self {
            kind,
            gray: match kind {
                StreamKind::Fisheye => buffer(640 * 400),
                StreamKind::EyeTracking => buffer(400 * 400),
                _ => empty.clone(),
            },
            color: match kind {
                StreamKind::Color => buffer(640 * 480 * 2),
                _ => empty.clone(),
            },
            depth: match kind {
                StreamKind::Depth => buffer(224 * 172 * 2),
                _ => empty,
            },
        }
    }

    fn image(&self, width: u32, height: u32, format: ImageFormat, data: &Arc<[u8]>) -> Image {
        Image {
            width,
            height,
            format,
            data: Arc::clone(data),
        }
    }

    fn make(&mut self, index: u64, elapsed: Duration) -> Frame {
        let t = elapsed.as_secs_f64();
        let edge_timestamp_us = elapsed.as_micros() as u64;
        let host_timestamp_s = host_clock_s();
        let half_yaw = 0.25 * t;
        let quaternion = [0.0, half_yaw.sin(), 0.0, half_yaw.cos()];

        match self.kind {
            StreamKind::Orientation => Frame::Orientation(Orientation {
                quaternion,
                edge_timestamp_us,
                host_timestamp_s,
            }),
            StreamKind::Slam => Frame::Slam(Pose {
                translation: [0.5 * t.cos(), 0.0, 0.5 * t.sin()],
                quaternion,
                edge_timestamp_us,
                host_timestamp_s,
                confidence: 0.95,
            }),
            StreamKind::Imu => Frame::Imu(ImuSample {
                accelerometer: [0.01 * t.sin(), 0.0, 1.0],
                gyroscope: [0.0, 0.5, 0.0],
                temperature_c: Some(36.5),
                edge_timestamp_us,
                host_timestamp_s,
            }),
            StreamKind::Fisheye => Frame::Fisheye(FisheyeImages {
                images: vec![
                    self.image(640, 400, ImageFormat::Gray8, &self.gray),
                    self.image(640, 400, ImageFormat::Gray8, &self.gray),
                ],
                edge_timestamp_us,
                host_timestamp_s,
            }),
            StreamKind::Color => Frame::Color(ColorImage {
                image: self.image(640, 480, ImageFormat::Yuyv, &self.color),
                edge_timestamp_us,
                host_timestamp_s,
            }),
            // Every tenth ToF frame is IR only, like the real sensor in IR mode.
            StreamKind::Depth => {
                let format = if index % 10 == 9 {
                    ImageFormat::Ir8
                } else {
                    ImageFormat::Depth16
                };
                Frame::Depth(DepthImage {
                    image: self.image(224, 172, format, &self.depth),
                    edge_timestamp_us,
                    host_timestamp_s,
                })
            }
            StreamKind::EyeTracking => Frame::EyeTracking(EyeTrackingImages {
                images: vec![
                    self.image(400, 400, ImageFormat::Gray8, &self.gray),
                    self.image(400, 400, ImageFormat::Gray8, &self.gray),
                ],
                edge_timestamp_us,
                host_timestamp_s,
            }),
        }
    }
}
