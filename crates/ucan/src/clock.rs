use std::time::{Duration, Instant};

/// Monotonic time source for request timeouts.
///
/// Injectable so tests can step time deterministically instead of sleeping
/// against the wall clock. The epoch is arbitrary; only differences matter.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// The default clock, anchored to an `Instant` taken at construction.
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
