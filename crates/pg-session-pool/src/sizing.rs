//! Adaptive sizing from the observed request rate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::PoolConfig;

/// Length of the rolling request-rate window.
pub(crate) const SIZING_WINDOW: Duration = Duration::from_secs(60);

/// Tracks borrow requests over a rolling window and derives the number of
/// sessions the pool should hold.
pub(crate) struct SizingController {
    min: usize,
    max: usize,
    per_connection: u64,
    requests: AtomicU64,
    window_start: Mutex<Instant>,
    target: AtomicUsize,
}

impl SizingController {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        let initial = ((config.max_connections - config.min_connections) / 2)
            .max(config.min_connections);
        Self {
            min: config.min_connections,
            max: config.max_connections,
            per_connection: config.requests_per_minute_per_connection,
            requests: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            target: AtomicUsize::new(initial),
        }
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Recompute the target if the window has elapsed.
    pub(crate) fn tick(&self) {
        if self.window_start.lock().elapsed() >= SIZING_WINDOW {
            self.recompute();
        }
    }

    /// Derive a new target from the requests seen this window, then reset
    /// the window.
    pub(crate) fn recompute(&self) -> usize {
        let count = self.requests.swap(0, Ordering::AcqRel);
        *self.window_start.lock() = Instant::now();

        let new_target = if count <= self.per_connection {
            self.min
        } else if count > self.per_connection.saturating_mul(self.max as u64) {
            tracing::warn!(
                requests = count,
                max = self.max,
                "request rate exceeds pool capacity"
            );
            self.max
        } else {
            (count.div_ceil(self.per_connection) as usize).clamp(self.min, self.max)
        };

        let previous = self.target.swap(new_target, Ordering::AcqRel);
        if previous != new_target {
            tracing::debug!(previous, target = new_target, requests = count, "pool target resized");
        }
        new_target
    }
}
