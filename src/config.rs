//! Runtime knobs, read from `XVCAPTURE_*` environment variables.
//!
//! Parsing is lenient: an unparsable value logs a warning and falls back to
//! the default.

use crate::types::StreamKind;
use std::time::Duration;

/// How the registry looks for devices at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// One discovery call with the full timeout.
    Once,
    /// Short discovery calls with a sleep in between until a device shows up
    /// or the overall timeout elapses.
    Poll,
}

/// Which device backend the demo programs open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Synthetic,
    Xr50,
}

/// Log every Nth frame per stream kind; 0 disables sampled logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSampling {
    every: [u64; 7],
}

impl LogSampling {
    pub fn get(&self, kind: StreamKind) -> u64 {
        self.every[Self::index(kind)]
    }

    pub fn set(&mut self, kind: StreamKind, every: u64) {
        self.every[Self::index(kind)] = every;
    }

    pub fn disabled() -> Self {
        Self { every: [0; 7] }
    }

    fn index(kind: StreamKind) -> usize {
        StreamKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default()
    }
}

impl Default for LogSampling {
    fn default() -> Self {
        let mut sampling = Self::disabled();
        for kind in StreamKind::ALL {
            let every = match kind {
                StreamKind::Orientation => 100,
                StreamKind::Fisheye => 50,
                StreamKind::Color => 100,
                StreamKind::Depth => 50,
                StreamKind::Slam => 500,
                StreamKind::Imu => 100,
                StreamKind::EyeTracking => 50,
            };
            sampling.set(kind, every);
        }
        sampling
    }
}

/// Per-controller settings derived from [`CaptureConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub fps_window: Duration,
    pub log_every: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            fps_window: Duration::from_secs(1),
            log_every: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub discovery_timeout: Duration,
    pub discovery_mode: DiscoveryMode,
    /// Sleep between discovery polls, both at launch and in the background
    /// monitor.
    pub poll_interval: Duration,
    /// Timeout of each individual discovery call while polling.
    pub poll_timeout: Duration,
    pub streams: Vec<StreamKind>,
    pub fps_window: Duration,
    pub log_sampling: LogSampling,
    pub tap_capacity: usize,
    pub track_disconnects: bool,
    pub backend: Backend,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            discovery_mode: DiscoveryMode::Once,
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_millis(500),
            streams: vec![
                StreamKind::Orientation,
                StreamKind::Fisheye,
                StreamKind::Color,
                StreamKind::Slam,
            ],
            fps_window: Duration::from_secs(1),
            log_sampling: LogSampling::default(),
            tap_capacity: 256,
            track_disconnects: false,
            backend: Backend::Synthetic,
        }
    }
}

impl CaptureConfig {
    /// Defaults overridden by any `XVCAPTURE_*` variables that are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let discovery_mode = match read_env_string("XVCAPTURE_DISCOVERY_MODE", "once").as_str() {
            "once" => DiscoveryMode::Once,
            "poll" => DiscoveryMode::Poll,
            other => {
                log::warn!(
                    "Unknown XVCAPTURE_DISCOVERY_MODE='{}', using once (supported: once|poll)",
                    other
                );
                DiscoveryMode::Once
            }
        };

        let backend = match read_env_string("XVCAPTURE_BACKEND", "synthetic").as_str() {
            "synthetic" => Backend::Synthetic,
            "xr50" => Backend::Xr50,
            other => {
                log::warn!(
                    "Unknown XVCAPTURE_BACKEND='{}', using synthetic (supported: synthetic|xr50)",
                    other
                );
                Backend::Synthetic
            }
        };

        let streams = match std::env::var("XVCAPTURE_STREAMS") {
            Ok(list) => parse_stream_list(&list),
            Err(_) => defaults.streams.clone(),
        };

        let mut log_sampling = defaults.log_sampling;
        for kind in StreamKind::ALL {
            let key = format!("XVCAPTURE_LOG_EVERY_{}", kind.name().to_ascii_uppercase());
            log_sampling.set(kind, read_env_u64(&key, log_sampling.get(kind)));
        }

        Self {
            discovery_timeout: read_env_secs(
                "XVCAPTURE_DISCOVERY_TIMEOUT_S",
                defaults.discovery_timeout,
            ),
            discovery_mode,
            poll_interval: read_env_millis("XVCAPTURE_POLL_INTERVAL_MS", defaults.poll_interval),
            poll_timeout: read_env_millis("XVCAPTURE_POLL_TIMEOUT_MS", defaults.poll_timeout),
            streams,
            fps_window: read_env_millis("XVCAPTURE_FPS_WINDOW_MS", defaults.fps_window),
            log_sampling,
            tap_capacity: read_env_u64("XVCAPTURE_TAP_CAPACITY", defaults.tap_capacity as u64)
                .max(1) as usize,
            track_disconnects: read_env_bool(
                "XVCAPTURE_TRACK_DISCONNECTS",
                defaults.track_disconnects,
            ),
            backend,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Streams to capture, in start order. Repeated kinds are dropped.
    pub fn with_streams(mut self, streams: impl IntoIterator<Item = StreamKind>) -> Self {
        self.streams.clear();
        for kind in streams {
            if !self.streams.contains(&kind) {
                self.streams.push(kind);
            }
        }
        self
    }

    pub fn with_log_sampling(mut self, sampling: LogSampling) -> Self {
        self.log_sampling = sampling;
        self
    }

    pub fn with_track_disconnects(mut self, track: bool) -> Self {
        self.track_disconnects = track;
        self
    }

    pub fn controller_options(&self, kind: StreamKind) -> ControllerOptions {
        ControllerOptions {
            fps_window: self.fps_window,
            log_every: self.log_sampling.get(kind),
        }
    }
}

/// Parse a comma-separated list of stream kinds, skipping unknown names and
/// duplicates.
pub fn parse_stream_list(list: &str) -> Vec<StreamKind> {
    let mut kinds = Vec::new();
    for name in list.split(',').filter(|s| !s.trim().is_empty()) {
        match name.parse::<StreamKind>() {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(e) => log::warn!("Ignoring stream: {}", e),
        }
    }
    kinds
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or_else(|_| {
            log::warn!("Invalid {}='{}', using {}", name, v, default);
            default
        }),
        Err(_) => default,
    }
}

fn read_env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => parse_secs(&v).unwrap_or_else(|| {
            log::warn!("Invalid {}='{}', using {:?}", name, v, default);
            default
        }),
        Err(_) => default,
    }
}

/// Non-negative seconds that fit in a `Duration`.
fn parse_secs(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(read_env_u64(name, default.as_millis() as u64))
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_matches_stream_rates() {
        let sampling = LogSampling::default();
        assert_eq!(sampling.get(StreamKind::Slam), 500);
        assert_eq!(sampling.get(StreamKind::Fisheye), 50);
        assert_eq!(sampling.get(StreamKind::Orientation), 100);
        assert_eq!(LogSampling::disabled().get(StreamKind::Slam), 0);
    }

    #[test]
    fn test_parse_stream_list() {
        let kinds = parse_stream_list("slam, rgb,bogus,,slam,tof");
        assert_eq!(
            kinds,
            vec![StreamKind::Slam, StreamKind::Color, StreamKind::Depth]
        );
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs(" 2.5 "), Some(Duration::from_millis(2500)));
        assert_eq!(parse_secs("1e20"), None);
        assert_eq!(parse_secs("-1"), None);
        assert_eq!(parse_secs("NaN"), None);
        assert_eq!(parse_secs("soon"), None);
    }

    #[test]
    fn test_with_streams_drops_duplicates() {
        let config = CaptureConfig::default().with_streams([
            StreamKind::Slam,
            StreamKind::Imu,
            StreamKind::Slam,
        ]);
        assert_eq!(config.streams, vec![StreamKind::Slam, StreamKind::Imu]);
    }

    #[test]
    fn test_controller_options() {
        let config = CaptureConfig::default();
        let opts = config.controller_options(StreamKind::Color);
        assert_eq!(opts.log_every, 100);
        assert_eq!(opts.fps_window, Duration::from_secs(1));
    }
}
