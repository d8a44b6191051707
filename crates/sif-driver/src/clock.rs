//! Time source for every bounded wait in the driver.
//!
//! Handshake flags and the SIF1 channel are polled, not waited on. The
//! polling loops take a [`Clock`] so tests can substitute [`ManualClock`],
//! whose `sleep` advances simulated time instead of blocking.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Monotonic time plus a way to pass time.
pub trait Clock: Debug + Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Let `duration` pass.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time via [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock whose origin is now
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
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated time. `sleep` advances the clock and returns immediately.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move simulated time forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        std::thread::yield_now();
    }
}

/// Poll `condition` every `interval` until it holds or `budget` elapses.
///
/// The condition is evaluated at least once, and once more after the
/// budget is spent, so a flag raised during the final sleep is not missed.
pub fn poll_until(
    clock: &dyn Clock,
    budget: Duration,
    interval: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = clock.now() + budget;
    loop {
        if condition() {
            return true;
        }
        if clock.now() >= deadline {
            return false;
        }
        clock.sleep(interval);
    }
}

/// Milliseconds in `d`, saturating, for error reporting.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
