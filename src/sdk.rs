//! Boundary to the device SDK.
//!
//! Everything behind these traits (discovery, calibration, SLAM) belongs to
//! the backend. The rest of the crate only sees frames arriving on callbacks.

use crate::types::{Capabilities, Frame, StreamKind};
use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub type CallbackId = u64;

/// Invoked on the backend's delivery thread for every frame of a stream.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Devices returned by one discovery call, keyed by device identifier.
pub type DeviceMap = BTreeMap<String, Arc<dyn SensorDevice>>;

/// One sensor stream of a device.
pub trait SensorStream: Send + Sync {
    fn kind(&self) -> StreamKind;

    fn register_callback(&self, callback: FrameCallback) -> Result<CallbackId>;

    /// Returns `Ok(false)` when `id` was not registered.
    fn unregister_callback(&self, id: CallbackId) -> Result<bool>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

pub trait SensorDevice: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn has_stream(&self, kind: StreamKind) -> bool {
        self.capabilities().contains(kind.capability())
    }

    fn stream(&self, kind: StreamKind) -> Option<Arc<dyn SensorStream>>;
}

pub trait DeviceSource: Send + Sync {
    /// Block up to `timeout` for devices to show up.
    ///
    /// Returns an empty map when nothing was found; never fails.
    fn discover(&self, timeout: Duration) -> DeviceMap;
}

/// Callback table shared by backend streams.
///
/// Dispatch snapshots the table first so callbacks run without the lock held
/// and may (un)register from inside a callback.
#[derive(Default)]
pub struct CallbackSet {
    inner: Mutex<CallbackTable>,
}

#[derive(Default)]
struct CallbackTable {
    next_id: CallbackId,
    entries: Vec<(CallbackId, FrameCallback)>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: FrameCallback) -> CallbackId {
        let mut table = self.inner.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push((id, callback));
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut table = self.inner.lock();
        let before = table.entries.len();
        table.entries.retain(|(entry, _)| *entry != id);
        table.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `frame` to every registered callback.
    pub fn dispatch(&self, frame: Frame) {
        let callbacks: Vec<FrameCallback> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        if let Some((last, rest)) = callbacks.split_last() {
            for cb in rest {
                cb(frame.clone());
            }
            last(frame);
        }
    }
}
