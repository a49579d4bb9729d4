use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Arrival-rate meter over a trailing time window.
///
/// `fps()` is `(n - 1) / span` over the `n` ticks that fall inside the
/// window, so it is exact for a steady stream as soon as two ticks have been
/// seen. With fewer than two ticks in the window it returns `0.0`.
///
/// Not synchronized; each stream owns its own counter.
#[derive(Debug, Clone)]
pub struct FrameRateCounter {
    window: Duration,
    ticks: VecDeque<Instant>,
    total: u64,
}

impl FrameRateCounter {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            ticks: VecDeque::new(),
            total: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one arrival now.
    pub fn tic(&mut self) {
        self.tic_at(Instant::now());
    }

    /// Record one arrival at `at`. Arrivals must be passed in time order.
    pub fn tic_at(&mut self, at: Instant) {
        self.total += 1;
        self.ticks.push_back(at);
        if let Some(cutoff) = at.checked_sub(self.window) {
            while self.ticks.front().is_some_and(|t| *t <= cutoff) {
                self.ticks.pop_front();
            }
        }
    }

    /// Arrival rate as of now.
    pub fn fps(&self) -> f64 {
        self.fps_at(Instant::now())
    }

    /// Arrival rate over the window ending at `now`.
    pub fn fps_at(&self, now: Instant) -> f64 {
        let first = match now.checked_sub(self.window) {
            Some(cutoff) => self.ticks.partition_point(|t| *t <= cutoff),
            None => 0,
        };
        let n = self.ticks.len() - first;
        if n < 2 {
            return 0.0;
        }
        let span = self.ticks[self.ticks.len() - 1].saturating_duration_since(self.ticks[first]);
        if span.is_zero() {
            return 0.0;
        }
        (n - 1) as f64 / span.as_secs_f64()
    }

    /// Total ticks since creation or the last reset.
    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.ticks.clear();
        self.total = 0;
    }
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}
