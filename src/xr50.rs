//! Hardware backend for the XVisio XR50 over hidapi.
//!
//! The XR50 reports pose, orientation and IMU together in one edge report
//! stream on its HID interface. Each device owns a single reader thread that
//! demultiplexes those reports onto the three streams; the report stream runs
//! while at least one of them is started.

use crate::hid::HidTransport;
use crate::protocol::{self, EdgeReport, Features, HID_INTERFACE, PID, VID};
use crate::sdk::{
    CallbackId, CallbackSet, DeviceMap, DeviceSource, FrameCallback, SensorDevice, SensorStream,
};
use crate::types::{Capabilities, Frame, StreamKind};
use crate::{CaptureError, Result};
use hidapi::HidApi;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Streams carried by the edge report.
const EDGE_STREAMS: [StreamKind; 3] = [StreamKind::Slam, StreamKind::Orientation, StreamKind::Imu];

const SCAN_INTERVAL: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// The firmware re-initializes its cameras after a configure command.
const CONFIGURE_SETTLE: Duration = Duration::from_secs(1);
/// Consecutive read errors after which the reader assumes the device is gone.
const MAX_READ_ERRORS: u32 = 50;

/// Windows and Linux expose the HID function as interface 3; macOS IOKit
/// reports -1.
fn is_xr50_hid(info: &hidapi::DeviceInfo) -> bool {
    info.vendor_id() == VID
        && info.product_id() == PID
        && (info.interface_number() == HID_INTERFACE || info.interface_number() == -1)
}

fn create_hid_api() -> Result<HidApi> {
    let api = HidApi::new()?;
    #[cfg(target_os = "macos")]
    {
        // Shared opens, so the interface is not seized from other readers.
        api.set_open_exclusive(false);
    }
    Ok(api)
}

/// Discovers XR50 headsets attached over USB.
///
/// Devices are opened once and cached by HID path; a device whose path
/// disappears is dropped from the cache so that replugging opens it afresh.
pub struct Xr50Source {
    api: Mutex<HidApi>,
    known: Mutex<BTreeMap<CString, Arc<Xr50Device>>>,
}

impl Xr50Source {
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            api: Mutex::new(create_hid_api()?),
            known: Mutex::new(BTreeMap::new()),
        }))
    }

    fn scan(&self) -> DeviceMap {
        let mut api = self.api.lock();
        if let Err(e) = api.refresh_devices() {
            log::warn!("HID enumeration failed: {}", e);
            return DeviceMap::new();
        }

        let present: Vec<CString> = api
            .device_list()
            .filter(|info| is_xr50_hid(info))
            .map(|info| info.path().to_owned())
            .collect();

        let mut known = self.known.lock();
        known.retain(|path, device| {
            let keep = present.contains(path);
            if !keep {
                log::info!("device: {}  no longer enumerated", device.uuid);
            }
            keep
        });

        for path in present {
            if known.contains_key(&path) {
                continue;
            }
            match Xr50Device::open(&api, &path) {
                Ok(device) => {
                    known.insert(path, device);
                }
                Err(e) => log::warn!("Failed to open XR50 at {:?}: {}", path, e),
            }
        }

        known
            .values()
            .map(|d| (d.uuid.clone(), Arc::clone(d) as Arc<dyn SensorDevice>))
            .collect()
    }
}

impl DeviceSource for Xr50Source {
    fn discover(&self, timeout: Duration) -> DeviceMap {
        let started = Instant::now();
        loop {
            let devices = self.scan();
            let remaining = timeout.saturating_sub(started.elapsed());
            if !devices.is_empty() || remaining.is_zero() {
                return devices;
            }
            std::thread::sleep(SCAN_INTERVAL.min(remaining));
        }
    }
}

pub struct Xr50Device {
    uuid: String,
    version: String,
    features: Features,
    streams: BTreeMap<StreamKind, Arc<Xr50Stream>>,
}

impl Xr50Device {
    fn open(api: &HidApi, path: &CString) -> Result<Arc<Self>> {
        let transport = HidTransport::new(api.open_path(path)?);
        let uuid = transport.read_uuid()?;
        let version = transport.read_version()?;
        let features = transport.read_features()?;
        log::info!(
            "device: {}  XR50 version={} features={:?}",
            uuid,
            version,
            features
        );

        let link = Arc::new(EdgeLink {
            device_id: uuid.clone(),
            routes: Arc::new(Routes::default()),
            state: Mutex::new(LinkState::Idle(transport)),
        });
        let streams = EDGE_STREAMS
            .iter()
            .map(|&kind| {
                let stream = Xr50Stream {
                    kind,
                    link: Arc::clone(&link),
                };
                (kind, Arc::new(stream))
            })
            .collect();

        Ok(Arc::new(Self {
            uuid,
            version,
            features,
            streams,
        }))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Everything the firmware advertises, including streams this backend
    /// cannot deliver over HID.
    pub fn advertised(&self) -> Capabilities {
        self.features.capabilities()
    }
}

impl SensorDevice for Xr50Device {
    fn id(&self) -> &str {
        &self.uuid
    }

    fn capabilities(&self) -> Capabilities {
        let delivered = EDGE_STREAMS
            .iter()
            .fold(Capabilities::empty(), |caps, kind| caps | kind.capability());
        self.advertised() & delivered
    }

    fn stream(&self, kind: StreamKind) -> Option<Arc<dyn SensorStream>> {
        if !self.has_stream(kind) {
            return None;
        }
        self.streams
            .get(&kind)
            .map(|s| Arc::clone(s) as Arc<dyn SensorStream>)
    }
}

/// Callback tables per edge stream, plus which of them are started.
#[derive(Default)]
struct Routes {
    slam: CallbackSet,
    orientation: CallbackSet,
    imu: CallbackSet,
    enabled: AtomicU32,
}

impl Routes {
    fn callbacks(&self, kind: StreamKind) -> Option<&CallbackSet> {
        match kind {
            StreamKind::Slam => Some(&self.slam),
            StreamKind::Orientation => Some(&self.orientation),
            StreamKind::Imu => Some(&self.imu),
            _ => None,
        }
    }

    fn enabled(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.enabled.load(Ordering::Acquire))
    }

    fn dispatch(&self, report: EdgeReport) {
        let enabled = self.enabled();
        if enabled.contains(Capabilities::SLAM) {
            self.slam.dispatch(Frame::Slam(report.pose));
        }
        if enabled.contains(Capabilities::ORIENTATION) {
            self.orientation.dispatch(Frame::Orientation(report.orientation()));
        }
        if enabled.contains(Capabilities::IMU) {
            self.imu.dispatch(Frame::Imu(report.imu));
        }
    }
}

struct Reader {
    stop_flag: Arc<AtomicBool>,
    /// Hands the transport back when the reader exits.
    thread: JoinHandle<HidTransport>,
}

enum LinkState {
    Idle(HidTransport),
    Streaming(Reader),
    /// The reader thread panicked and took the transport with it.
    Broken,
}

/// One HID connection shared by the edge streams of a device.
struct EdgeLink {
    device_id: String,
    routes: Arc<Routes>,
    state: Mutex<LinkState>,
}

impl EdgeLink {
    fn enable(&self, kind: StreamKind) -> Result<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, LinkState::Broken) {
            LinkState::Idle(transport) => {
                if let Err(e) = start_edge_stream(&transport) {
                    *state = LinkState::Idle(transport);
                    return Err(e);
                }
                let reader = self.spawn_reader(transport)?;
                self.routes
                    .enabled
                    .fetch_or(kind.capability().bits(), Ordering::AcqRel);
                *state = LinkState::Streaming(reader);
                Ok(())
            }
            streaming @ LinkState::Streaming(_) => {
                *state = streaming;
                self.routes
                    .enabled
                    .fetch_or(kind.capability().bits(), Ordering::AcqRel);
                Ok(())
            }
            LinkState::Broken => Err(CaptureError::StreamStopped),
        }
    }

    fn disable(&self, kind: StreamKind) -> Result<()> {
        let mut state = self.state.lock();
        let bit = kind.capability().bits();
        let before = self.routes.enabled.fetch_and(!bit, Ordering::AcqRel);
        if before & !bit != 0 {
            return Ok(());
        }

        match std::mem::replace(&mut *state, LinkState::Broken) {
            LinkState::Streaming(reader) => {
                reader.stop_flag.store(true, Ordering::Relaxed);
                let transport = reader.thread.join().map_err(|_| {
                    CaptureError::Sdk(format!("{}: edge reader panicked", self.device_id))
                })?;
                let stopped = transport.edge_stream(false);
                *state = LinkState::Idle(transport);
                log::info!("device: {}  edge stream stopped", self.device_id);
                stopped
            }
            other => {
                *state = other;
                Ok(())
            }
        }
    }

    fn spawn_reader(&self, transport: HidTransport) -> Result<Reader> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let routes = Arc::clone(&self.routes);
        let device_id = self.device_id.clone();

        let thread = std::thread::Builder::new()
            .name(format!("xr50-{}", self.device_id))
            .spawn(move || edge_reader_loop(device_id, transport, routes, stop_clone))
            .map_err(|e| CaptureError::HidCommand(format!("Failed to spawn reader thread: {}", e)))?;
        Ok(Reader { stop_flag, thread })
    }
}

fn start_edge_stream(transport: &HidTransport) -> Result<()> {
    transport.configure(true, false)?;
    std::thread::sleep(CONFIGURE_SETTLE);
    transport.edge_stream(true)
}

fn edge_reader_loop(
    device_id: String,
    transport: HidTransport,
    routes: Arc<Routes>,
    stop_flag: Arc<AtomicBool>,
) -> HidTransport {
    // Report id byte plus the report.
    let mut buf = [0u8; protocol::REPORT_SIZE + 1];
    let mut errors = 0u32;
    log::info!("device: {}  edge reader started", device_id);

    while !stop_flag.load(Ordering::Relaxed) {
        let len = match transport.read_report(&mut buf, READ_TIMEOUT) {
            Ok(0) => continue,
            Ok(n) => {
                errors = 0;
                n
            }
            Err(e) => {
                errors += 1;
                if errors >= MAX_READ_ERRORS {
                    log::error!("device: {}  giving up after read errors: {}", device_id, e);
                    break;
                }
                log::warn!("device: {}  read error: {}", device_id, e);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        // Control responses share the interrupt pipe; skip them.
        if let Some(report) = protocol::parse_edge_report(&buf[..len]) {
            routes.dispatch(report);
        }
    }

    log::info!("device: {}  edge reader stopped", device_id);
    transport
}

pub struct Xr50Stream {
    kind: StreamKind,
    link: Arc<EdgeLink>,
}

impl Xr50Stream {
    fn callbacks(&self) -> Result<&CallbackSet> {
        self.link.routes.callbacks(self.kind).ok_or_else(|| {
            CaptureError::Sdk(format!("{}: {} is not an edge stream", self.link.device_id, self.kind))
        })
    }
}

impl SensorStream for Xr50Stream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn register_callback(&self, callback: FrameCallback) -> Result<CallbackId> {
        Ok(self.callbacks()?.register(callback))
    }

    fn unregister_callback(&self, id: CallbackId) -> Result<bool> {
        Ok(self.callbacks()?.unregister(id))
    }

    fn start(&self) -> Result<()> {
        self.link.enable(self.kind)
    }

    fn stop(&self) -> Result<()> {
        self.link.disable(self.kind)
    }
}
