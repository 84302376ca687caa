//! Virtual clock for the discrete-event loop.
//!
//! [`SimClock`] only moves when the engine pops an event, so a run is
//! replayable regardless of how fast the host is.

use pdsim_grid::SimTime;
use serde::{Deserialize, Serialize};

/// Virtual simulation clock, in nanoseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    current_ns: SimTime,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_ns: 0 }
    }

    /// Current time in nanoseconds.
    pub fn now_ns(&self) -> SimTime {
        self.current_ns
    }

    /// Current time in microseconds (truncated).
    pub fn now_us(&self) -> u64 {
        self.current_ns / 1_000
    }

    /// Advance the clock to an absolute time.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `ns` is in the past.
    pub fn advance_to_ns(&mut self, ns: SimTime) {
        debug_assert!(
            ns >= self.current_ns,
            "Cannot move clock backwards: current={}ns, target={}ns",
            self.current_ns,
            ns,
        );
        self.current_ns = ns;
    }

    /// Advance the clock by a duration.
    pub fn advance_by_ns(&mut self, delta_ns: u64) {
        self.current_ns += delta_ns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_starts_at_zero() {
        let clock = SimClock::new();
        assert_eq!(clock.now_ns(), 0);
        assert_eq!(clock.now_us(), 0);
    }

    #[test]
    fn test_advance() {
        let mut clock = SimClock::new();
        clock.advance_to_ns(500);
        clock.advance_by_ns(1_700);
        assert_eq!(clock.now_ns(), 2_200);
        assert_eq!(clock.now_us(), 2); // truncation
    }

    #[test]
    #[should_panic(expected = "Cannot move clock backwards")]
    fn test_cannot_go_backwards() {
        let mut clock = SimClock::new();
        clock.advance_to_ns(100);
        clock.advance_to_ns(50);
    }
}
