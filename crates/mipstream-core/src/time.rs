//! Time Management
//!
//! Time sources for the streaming cache:
//! - Injectable clocks so grace periods and timeouts can be driven deterministically
//! - Stopwatch for bounding per-frame work
//! - Scoped timers that report through `tracing`
//! - Rolling averages for cost estimation

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of the current instant
pub trait Clock: Send + Sync {
    /// Current instant according to this clock
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock
///
/// Clones share the same underlying instant, so a test can keep one handle
/// while the cache owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Move the clock forward by fractional seconds
    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs.max(0.0)));
    }

    /// Jump to an instant; never moves backwards
    pub fn set(&self, instant: Instant) {
        let mut now = self.now.lock();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Wall-time meter for bounding one phase of a frame
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    /// Start measuring now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Measure from now again
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in `budget`, zero once it is spent
    pub fn remaining(&self, budget: Duration) -> Duration {
        budget.saturating_sub(self.elapsed())
    }

    /// Whether spending `cost` more would stay within `budget`
    pub fn fits(&self, budget: Duration, cost: Duration) -> bool {
        let left = self.remaining(budget);
        !left.is_zero() && cost <= left
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits a `timing` trace event with the scope's duration when dropped
pub struct ScopedTimer {
    name: &'static str,
    started: Instant,
}

impl ScopedTimer {
    /// Start timing a named phase
    pub fn traced(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        tracing::trace!(
            target: "timing",
            name = self.name,
            duration_us = self.started.elapsed().as_micros() as u64,
            "phase completed"
        );
    }
}

/// Rolling average over a fixed window of duration samples
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: Vec<Duration>,
    index: usize,
    count: usize,
}

impl RollingAverage {
    /// Create a new rolling average with the given window
    pub fn new(window: usize) -> Self {
        Self {
            samples: vec![Duration::ZERO; window.max(1)],
            index: 0,
            count: 0,
        }
    }

    /// Record a new sample
    pub fn record(&mut self, sample: Duration) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    /// Mean of the recorded samples, zero before the first sample
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.samples[..self.count].iter().sum();
        total / self.count as u32
    }

    /// Number of samples currently in the window
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no samples have been recorded
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
