//! Simulated time as reported by the timing engine.
//!
//! The [`SimClock`] never advances on its own. It follows the `cycle` values
//! carried by completion events, in nanoseconds, and refuses to run
//! backwards: a stale timestamp is logged and ignored.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Nanoseconds per simulated second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Virtual simulation clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    /// Current simulation time in nanoseconds.
    current_ns: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in nanoseconds.
    pub fn now_ns(&self) -> u64 {
        self.current_ns
    }

    /// Move the clock to a timestamp reported by the engine.
    ///
    /// Returns the time after observation, which is `ns` unless `ns` lies in
    /// the past.
    pub fn observe(&mut self, ns: u64) -> u64 {
        if ns < self.current_ns {
            warn!(
                current_ns = self.current_ns,
                reported_ns = ns,
                "timing engine reported a timestamp in the past; keeping current time"
            );
        } else {
            self.current_ns = ns;
        }
        self.current_ns
    }
}
