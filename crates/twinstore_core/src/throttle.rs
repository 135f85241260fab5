//! Rolling-average rate limiter.
//!
//! A [`Throttle`] is called once after every unit of work. It measures how
//! long the unit took, keeps a fixed window of those samples, and sleeps
//! often enough that work occupies only the desired fraction of wall time.
//! Sleeps shorter than the configured precision are not performed; the
//! owed time accumulates instead, and any oversleep is credited against
//! later sleeps, so the long-run speed converges on the target.

use crate::cancel::CancelToken;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twinstore_storage::{FetchError, FetchResult};

/// Slowest speed a throttle will target. Lower requests are raised to it.
pub const MIN_SPEED: f64 = 0.001;

/// Time source used by [`Throttle`].
pub trait Clock: Send + Sync {
    /// Returns monotonic nanoseconds since an arbitrary origin.
    fn now_nanos(&self) -> u64;

    /// Sleeps for `duration` unless `cancel` fires first. Returns false if
    /// the sleep was interrupted.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Wall clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.sleep(duration)
    }
}

/// Clock that only moves when told to. Sleeping advances it by the
/// requested duration and records the request.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<u64>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Creates a clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
    }

    /// Returns every sleep performed so far.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Returns the total time slept.
    #[must_use]
    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.sleeps.lock().push(duration);
        self.advance(duration);
        true
    }
}

/// Keeps a loop running at a fraction of its natural speed.
pub struct Throttle {
    clock: Arc<dyn Clock>,
    samples: Vec<u64>,
    next: usize,
    filled: usize,
    total: u128,
    last: Option<u64>,
    debt: f64,
    precision: Duration,
}

impl Throttle {
    /// Creates a throttle averaging over `window` samples on the system
    /// clock.
    #[must_use]
    pub fn new(window: usize, precision: Duration) -> Self {
        Self::with_clock(window, precision, Arc::new(SystemClock::new()))
    }

    /// Creates a throttle on the given clock.
    #[must_use]
    pub fn with_clock(window: usize, precision: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            samples: vec![0; window.max(1)],
            next: 0,
            filled: 0,
            total: 0,
            last: None,
            debt: 0.0,
            precision,
        }
    }

    /// Records the unit of work that just finished and sleeps if the loop
    /// is running faster than `desired_speed` (a fraction of full speed).
    ///
    /// The first call only starts the clock. A speed of 1.0 or more never
    /// sleeps; speeds below [`MIN_SPEED`] are raised to it.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Interrupted`] if `cancel` fires during a sleep.
    pub fn throttle(&mut self, desired_speed: f64, cancel: &CancelToken) -> FetchResult<()> {
        let now = self.clock.now_nanos();
        let Some(last) = self.last.replace(now) else {
            return Ok(());
        };
        self.record(now.saturating_sub(last));

        if desired_speed.is_nan() || desired_speed >= 1.0 {
            return Ok(());
        }
        let speed = desired_speed.max(MIN_SPEED);
        self.debt += self.average() * (1.0 - speed) / speed;

        let precision = self.precision.as_nanos() as f64;
        if self.debt < precision.max(1.0) {
            return Ok(());
        }
        let wanted = Duration::from_nanos(self.debt as u64);
        let before = self.clock.now_nanos();
        if !self.clock.sleep(wanted, cancel) {
            return Err(FetchError::Interrupted);
        }
        let after = self.clock.now_nanos();
        self.debt -= after.saturating_sub(before) as f64;
        self.last = Some(after);
        Ok(())
    }

    /// Forgets all samples and owed sleep.
    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0);
        self.next = 0;
        self.filled = 0;
        self.total = 0;
        self.last = None;
        self.debt = 0.0;
    }

    /// Returns the rolling average work time.
    #[must_use]
    pub fn average_work(&self) -> Duration {
        Duration::from_nanos(self.average() as u64)
    }

    fn record(&mut self, sample: u64) {
        let slot = &mut self.samples[self.next];
        self.total -= u128::from(*slot);
        *slot = sample;
        self.total += u128::from(sample);
        self.next = (self.next + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    fn average(&self) -> f64 {
        if self.filled == 0 {
            0.0
        } else {
            self.total as f64 / self.filled as f64
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("window", &self.samples.len())
            .field("average", &self.average_work())
            .field("debt_ns", &self.debt)
            .field("precision", &self.precision)
            .finish()
    }
}
