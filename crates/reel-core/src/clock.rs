//! Wall clock anchored to tokio's monotonic clock
//!
//! Session metadata needs epoch milliseconds while timers run on tokio time.
//! `Clock` pins an epoch value to a tokio `Instant` and derives the current
//! epoch time from the elapsed monotonic time, so paused-time tests that
//! advance tokio's clock also advance session timestamps.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_ms: u64,
    anchor: Instant,
}

impl Clock {
    /// Clock anchored to the system time
    pub fn system() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::starting_at(anchor_ms)
    }

    /// Clock that reads `epoch_ms` right now
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            anchor_ms: epoch_ms,
            anchor: Instant::now(),
        }
    }

    /// Current time in milliseconds since UNIX epoch
    pub fn now_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }

    /// Current time in fractional seconds since UNIX epoch
    pub fn now_secs(&self) -> f64 {
        self.now_ms() as f64 / 1000.0
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
