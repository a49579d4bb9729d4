use crate::config::{CaptureConfig, DiscoveryMode};
use crate::sdk::{DeviceMap, DeviceSource};
use crate::session::{DeviceSession, SessionState};
use crate::{CaptureError, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Idle,
    Discovering,
    Running,
    Terminating,
    Terminated,
}

struct Inner {
    source: Arc<dyn DeviceSource>,
    config: CaptureConfig,
    sessions: RwLock<BTreeMap<String, Arc<DeviceSession>>>,
    /// Serializes discover-and-integrate so two polls never race on one id.
    discovery: Mutex<()>,
    state: Mutex<RegistryState>,
    fatal: Mutex<Option<CaptureError>>,
}

impl Inner {
    /// Set once `shutdown` begins; no session is created after that.
    fn is_closing(&self) -> bool {
        matches!(
            *self.state.lock(),
            RegistryState::Terminating | RegistryState::Terminated
        )
    }

    fn poll(&self, timeout: Duration) -> Result<usize> {
        let _guard = self.discovery.lock();
        if self.is_closing() {
            return Ok(0);
        }
        let devices = self.source.discover(timeout);
        log::trace!("discovery returned {} device(s)", devices.len());
        self.integrate_locked(devices)
    }

    fn integrate_locked(&self, devices: DeviceMap) -> Result<usize> {
        if self.is_closing() {
            log::debug!("Registry shut down, ignoring {} device(s)", devices.len());
            return Ok(0);
        }
        if self.config.track_disconnects {
            let gone: Vec<Arc<DeviceSession>> = self
                .sessions
                .read()
                .values()
                .filter(|s| s.state() == SessionState::Running && !devices.contains_key(s.id()))
                .cloned()
                .collect();
            for session in gone {
                session.mark_lost();
            }
        }

        let mut added = 0;
        for (id, device) in devices {
            let replaces_lost = match self.sessions.read().get(&id) {
                Some(existing) if existing.state() == SessionState::Lost => true,
                Some(_) => continue,
                None => false,
            };

            let session = Arc::new(DeviceSession::new(device, &self.config));
            session.start()?;
            if replaces_lost {
                log::info!("device: {}  reconnected, replacing lost session", id);
            } else {
                log::info!("device: {}  new session", id);
            }
            self.sessions.write().insert(id, session);
            added += 1;
        }
        Ok(added)
    }
}

struct Monitor {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Keeps exactly one [`DeviceSession`] per discovered device.
///
/// Discovery runs either once at launch ([`DeviceRegistry::discover`]) or
/// additionally in a background thread ([`DeviceRegistry::spawn_monitor`])
/// that picks up devices plugged in later.
pub struct DeviceRegistry {
    inner: Arc<Inner>,
    monitor: Mutex<Option<Monitor>>,
}

impl DeviceRegistry {
    pub fn new(source: Arc<dyn DeviceSource>, config: CaptureConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                sessions: RwLock::new(BTreeMap::new()),
                discovery: Mutex::new(()),
                state: Mutex::new(RegistryState::Idle),
                fatal: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RegistryState {
        *self.inner.state.lock()
    }

    /// Shutdown states are final; a discovery finishing late cannot undo them.
    fn set_state(&self, state: RegistryState) {
        let mut current = self.inner.state.lock();
        let closing = |s: RegistryState| {
            matches!(s, RegistryState::Terminating | RegistryState::Terminated)
        };
        if closing(*current) && !closing(state) {
            return;
        }
        *current = state;
    }

    /// Run launch discovery as configured.
    ///
    /// Returns the number of sessions created, or
    /// [`CaptureError::NoDeviceFound`] when the overall timeout elapsed with no
    /// device known.
    pub fn discover(&self) -> Result<usize> {
        let config = &self.inner.config;
        let timeout = config.discovery_timeout;
        if self.inner.is_closing() {
            return Ok(0);
        }
        self.set_state(RegistryState::Discovering);
        log::info!(
            "Discovering devices ({:?} mode, timeout {:.1}s)",
            config.discovery_mode,
            timeout.as_secs_f64()
        );

        let result = match config.discovery_mode {
            DiscoveryMode::Once => self.inner.poll(timeout),
            DiscoveryMode::Poll => self.poll_until_found(timeout),
        };

        match result {
            Ok(added) if !self.is_empty() => {
                self.set_state(RegistryState::Running);
                Ok(added)
            }
            Ok(_) => {
                self.set_state(RegistryState::Idle);
                Err(CaptureError::NoDeviceFound { timeout })
            }
            Err(e) => {
                self.set_state(RegistryState::Idle);
                Err(e)
            }
        }
    }

    fn poll_until_found(&self, timeout: Duration) -> Result<usize> {
        let config = &self.inner.config;
        let started = Instant::now();
        let mut added = 0;
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            added += self.inner.poll(config.poll_timeout.min(remaining))?;
            if !self.is_empty() {
                return Ok(added);
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(added);
            }
            log::debug!("No device yet, retrying in {:?}", config.poll_interval);
            std::thread::sleep(config.poll_interval.min(remaining));
        }
    }

    /// One discovery call; new devices get a started session.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        self.inner.poll(timeout)
    }

    /// Integrate the result of a discovery call made elsewhere.
    pub fn integrate(&self, devices: DeviceMap) -> Result<usize> {
        let _guard = self.inner.discovery.lock();
        self.inner.integrate_locked(devices)
    }

    /// Start the background re-poll thread. No-op if already running.
    ///
    /// A failure inside the thread stops it; fetch it with
    /// [`DeviceRegistry::take_fatal_error`].
    pub fn spawn_monitor(&self) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name("xvcapture-discovery".to_string())
            .spawn(move || {
                let interval = inner.config.poll_interval;
                let timeout = inner.config.poll_timeout;
                log::debug!("Discovery monitor started (every {:?})", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Err(e) = inner.poll(timeout) {
                        log::error!("Discovery monitor stopped: {}", e);
                        *inner.fatal.lock() = Some(e);
                        break;
                    }
                }
                log::debug!("Discovery monitor exited");
            })
            .map_err(|e| CaptureError::Sdk(format!("Failed to spawn discovery thread: {}", e)))?;

        *monitor = Some(Monitor { stop_tx, thread });
        Ok(())
    }

    /// Error that ended the background monitor, if any.
    pub fn take_fatal_error(&self) -> Option<CaptureError> {
        self.inner.fatal.lock().take()
    }

    pub fn session(&self, id: &str) -> Option<Arc<DeviceSession>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Snapshot of all sessions, ordered by device id.
    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the monitor, then every session. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.state() == RegistryState::Terminated {
            return;
        }
        self.set_state(RegistryState::Terminating);

        if let Some(Monitor { stop_tx, thread }) = self.monitor.lock().take() {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                log::error!("Discovery monitor panicked");
            }
        }

        let sessions: Vec<Arc<DeviceSession>> = {
            let _guard = self.inner.discovery.lock();
            std::mem::take(&mut *self.inner.sessions.write())
                .into_values()
                .collect()
        };
        for session in sessions {
            session.stop();
        }

        self.set_state(RegistryState::Terminated);
        log::info!("Registry terminated");
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticDevice, SyntheticSource};
    use crate::types::StreamKind;

    fn device(id: &str) -> Arc<SyntheticDevice> {
        SyntheticDevice::builder(id).stream(StreamKind::Slam, 50.0).build()
    }

    fn config() -> CaptureConfig {
        CaptureConfig::default()
            .with_streams([StreamKind::Slam])
            .with_discovery_timeout(Duration::from_millis(500))
            .with_poll_interval(Duration::from_millis(20))
            .with_poll_timeout(Duration::from_millis(20))
    }

    #[test]
    fn test_discover_empty_source_fails() {
        let source = SyntheticSource::new();
        let registry = DeviceRegistry::new(source, config());
        let start = Instant::now();
        let err = registry.discover().unwrap_err();
        assert!(matches!(err, CaptureError::NoDeviceFound { .. }));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(registry.state(), RegistryState::Idle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_poll_mode_retries_until_found() {
        let source = SyntheticSource::new();
        let registry = DeviceRegistry::new(
            source.clone(),
            config()
                .with_discovery_mode(DiscoveryMode::Poll)
                .with_discovery_timeout(Duration::from_secs(5)),
        );

        let plugger = {
            let source = source.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                source.plug(device("late"));
            })
        };
        assert_eq!(registry.discover().unwrap(), 1);
        plugger.join().unwrap();
        assert!(source.discover_calls() > 1);
        assert_eq!(registry.state(), RegistryState::Running);
    }

    #[test]
    fn test_repeated_polls_never_duplicate() {
        let source = SyntheticSource::new();
        let dev = device("a");
        source.plug(dev.clone());
        let registry = DeviceRegistry::new(source.clone(), config());

        assert_eq!(registry.poll_once(Duration::ZERO).unwrap(), 1);
        let first = registry.session("a").unwrap();
        for _ in 0..5 {
            assert_eq!(registry.poll_once(Duration::ZERO).unwrap(), 0);
        }
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&first, &registry.session("a").unwrap()));
        assert_eq!(
            dev.synthetic_stream(StreamKind::Slam).unwrap().registered_callbacks(),
            1
        );

        source.plug(device("b"));
        assert_eq!(registry.poll_once(Duration::ZERO).unwrap(), 1);
        let ids: Vec<String> = registry.sessions().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_integrate_external_discovery() {
        let registry = DeviceRegistry::new(SyntheticSource::new(), config());
        let mut devices = DeviceMap::new();
        devices.insert("x".to_string(), device("x") as Arc<dyn crate::sdk::SensorDevice>);

        assert_eq!(registry.integrate(devices.clone()).unwrap(), 1);
        assert_eq!(registry.integrate(devices).unwrap(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unplug_without_tracking_keeps_session() {
        let source = SyntheticSource::new();
        source.plug(device("a"));
        source.plug(device("b"));
        let registry = DeviceRegistry::new(source.clone(), config());
        registry.poll_once(Duration::ZERO).unwrap();

        source.unplug("a");
        registry.poll_once(Duration::ZERO).unwrap();
        assert_eq!(registry.session("a").unwrap().state(), SessionState::Running);
    }

    #[test]
    fn test_lost_session_is_replaced() {
        let source = SyntheticSource::new();
        let original = device("a");
        source.plug(original.clone());
        source.plug(device("b"));
        let registry = DeviceRegistry::new(source.clone(), config().with_track_disconnects(true));
        registry.poll_once(Duration::ZERO).unwrap();

        source.unplug("a");
        registry.poll_once(Duration::ZERO).unwrap();
        let lost = registry.session("a").unwrap();
        assert_eq!(lost.state(), SessionState::Lost);
        assert!(!original.synthetic_stream(StreamKind::Slam).unwrap().is_running());

        let replugged = device("a");
        source.plug(replugged.clone());
        assert_eq!(registry.poll_once(Duration::ZERO).unwrap(), 1);
        let fresh = registry.session("a").unwrap();
        assert!(!Arc::ptr_eq(&lost, &fresh));
        assert_eq!(fresh.state(), SessionState::Running);
        assert_eq!(registry.len(), 2);
        assert!(replugged.synthetic_stream(StreamKind::Slam).unwrap().is_running());
    }

    #[test]
    fn test_monitor_picks_up_new_devices() {
        let source = SyntheticSource::new();
        source.plug(device("a"));
        let registry = DeviceRegistry::new(source.clone(), config());
        registry.discover().unwrap();
        registry.spawn_monitor().unwrap();
        registry.spawn_monitor().unwrap();

        source.plug(device("b"));
        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(registry.len(), 2);
        assert!(registry.take_fatal_error().is_none());

        registry.shutdown();
        assert_eq!(registry.state(), RegistryState::Terminated);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fatal_start_error_propagates() {
        let source = SyntheticSource::new();
        let dev = device("a");
        dev.synthetic_stream(StreamKind::Slam).unwrap().fail_starts(true);
        source.plug(dev);
        let registry = DeviceRegistry::new(source, config());

        assert!(matches!(registry.discover(), Err(CaptureError::Sdk(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_sessions_after_shutdown() {
        let source = SyntheticSource::new();
        let registry = DeviceRegistry::new(source.clone(), config());
        registry.shutdown();

        let dev = device("a");
        source.plug(dev.clone());
        assert_eq!(registry.poll_once(Duration::from_millis(20)).unwrap(), 0);
        assert_eq!(registry.integrate(source.discover(Duration::ZERO)).unwrap(), 0);
        assert_eq!(registry.discover().unwrap(), 0);
        assert!(registry.is_empty());
        assert_eq!(registry.state(), RegistryState::Terminated);
        assert!(!dev.synthetic_stream(StreamKind::Slam).unwrap().is_running());
    }

    #[test]
    fn test_shutdown_stops_streams() {
        let source = SyntheticSource::new();
        let dev = device("a");
        source.plug(dev.clone());
        let registry = DeviceRegistry::new(source, config());
        registry.discover().unwrap();

        let stream = dev.synthetic_stream(StreamKind::Slam).unwrap();
        assert!(stream.is_running());
        registry.shutdown();
        registry.shutdown();
        assert!(!stream.is_running());
        assert_eq!(stream.registered_callbacks(), 0);
    }
}
