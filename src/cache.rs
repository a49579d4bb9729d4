//! Single-slot hand-off of the newest frame from one producer to many readers.

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A published frame with its sequence number.
///
/// Immutable once published; readers share it through `Arc`.
#[derive(Debug)]
pub struct Stamped<T> {
    sequence: u64,
    published_at: Instant,
    frame: T,
}

impl<T> Stamped<T> {
    /// 1 for the first frame published into a cache, then strictly increasing.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn published_at(&self) -> Instant {
        self.published_at
    }

    pub fn frame(&self) -> &T {
        &self.frame
    }
}

impl<T> Deref for Stamped<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.frame
    }
}

/// Latest-frame cache.
///
/// `publish` swaps a fully built `Arc<Stamped<T>>` into the slot, so a reader
/// gets either nothing or one whole frame. `try_read` is lock-free and never
/// waits on the producer. Readers that prefer to be woken use
/// `wait_for_update`.
pub struct LatestFrameCache<T> {
    slot: ArcSwapOption<Stamped<T>>,
    next_sequence: AtomicU64,
    /// Highest published sequence; paired with `updated`.
    latest: Mutex<u64>,
    updated: Condvar,
}

impl<T> LatestFrameCache<T> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            next_sequence: AtomicU64::new(1),
            latest: Mutex::new(0),
            updated: Condvar::new(),
        }
    }

    /// Publish a new frame and wake waiting readers.
    pub fn publish(&self, frame: T) -> Arc<Stamped<T>> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let stamped = Arc::new(Stamped {
            sequence,
            published_at: Instant::now(),
            frame,
        });

        // A racing publisher with a higher sequence wins the slot.
        self.slot.rcu(|current| match current {
            Some(current) if current.sequence > sequence => Some(Arc::clone(current)),
            _ => Some(Arc::clone(&stamped)),
        });

        {
            let mut latest = self.latest.lock();
            if sequence > *latest {
                *latest = sequence;
            }
        }
        self.updated.notify_all();

        stamped
    }

    /// The most recent frame, if any was ever published.
    pub fn try_read(&self) -> Option<Arc<Stamped<T>>> {
        self.slot.load_full()
    }

    /// Sequence of the frame currently in the slot, 0 if empty.
    pub fn sequence(&self) -> u64 {
        self.slot.load().as_ref().map_or(0, |s| s.sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }

    /// Block until a frame newer than `seen` is published or `timeout`
    /// elapses. Pass 0 to accept any frame. A timeout too large to
    /// represent as an instant waits without a deadline.
    pub fn wait_for_update(&self, seen: u64, timeout: Duration) -> Option<Arc<Stamped<T>>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut latest = self.latest.lock();
        while *latest <= seen {
            match deadline {
                Some(deadline) => {
                    if self.updated.wait_until(&mut latest, deadline).timed_out() {
                        break;
                    }
                }
                None => self.updated.wait(&mut latest),
            }
        }
        let advanced = *latest > seen;
        drop(latest);

        if advanced {
            self.try_read()
        } else {
            None
        }
    }
}

impl<T> Default for LatestFrameCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LatestFrameCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestFrameCache")
            .field("sequence", &self.sequence())
            .finish()
    }
}
