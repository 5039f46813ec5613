//! Exponential backoff schedule
//!
//! Worker threads and the lifeguard use this to reduce vigilance when the
//! pool is calm: each timed wait grows the next delay by a constant
//! multiplier up to a ceiling, and any sign of activity resets it.

use std::time::Duration;

/// An exponential backoff between a floor and a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        debug_assert!(multiplier >= 1.0);
        Backoff {
            initial,
            max,
            multiplier,
            next: initial,
        }
    }

    /// The delay to use for the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        let grown = current.mul_f64(self.multiplier);
        self.next = grown.min(self.max);
        current
    }

    /// Return to the floor delay
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
