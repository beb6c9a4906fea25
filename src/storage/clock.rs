//! Monotonic local timestamp source
//!
//! Local timestamps are f64 milliseconds since the Unix epoch. Every value
//! handed out is strictly greater than the previous one, even when the wall
//! clock stalls or steps backwards.

use std::sync::{Mutex, PoisonError};

/// Current wall-clock time in fractional milliseconds since the epoch.
pub fn wall_clock_ms() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}

/// Smallest f64 strictly greater than a non-negative `value`.
pub fn next_after(value: f64) -> f64 {
    if value < 0.0 || value.is_nan() {
        return 0.0;
    }
    f64::from_bits(value.to_bits() + 1)
}

/// Strictly increasing timestamp source for one storage environment.
#[derive(Debug, Default)]
pub struct LocalClock {
    highest: Mutex<f64>,
}

impl LocalClock {
    /// Create a clock that has handed out nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that will only return values above `highest`
    pub fn starting_after(highest: f64) -> Self {
        Self {
            highest: Mutex::new(highest),
        }
    }

    /// Next timestamp: the wall clock, or just above the previous value if
    /// the wall clock has not moved past it.
    pub fn next(&self) -> f64 {
        let mut highest = self.highest.lock().unwrap_or_else(PoisonError::into_inner);
        let now = wall_clock_ms();
        let next = if now > *highest { now } else { next_after(*highest) };
        *highest = next;
        next
    }

    /// Record an externally observed timestamp so later values stay above it
    pub fn observe(&self, timestamp: f64) {
        let mut highest = self.highest.lock().unwrap_or_else(PoisonError::into_inner);
        if timestamp > *highest {
            *highest = timestamp;
        }
    }

    /// Highest timestamp handed out or observed
    pub fn highest(&self) -> f64 {
        *self.highest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_strictly_increasing() {
        let clock = LocalClock::new();
        let mut last = 0.0;
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_stays_above_observed_future_time() {
        let future = wall_clock_ms() + 1_000_000.0;
        let clock = LocalClock::new();
        clock.observe(future);
        assert!(clock.next() > future);
    }

    #[test]
    fn test_next_after() {
        assert!(next_after(1.0) > 1.0);
        assert_eq!(next_after(-3.0), 0.0);
    }
}
