//! Sample timestamps for the scheduling loops.
//!
//! Scrape and evaluation ticks are driven by `tokio::time`, so their sample
//! timestamps are derived from it too: a wall-clock anchor plus the tokio
//! time elapsed since the anchor. Under a paused test runtime the timestamps
//! advance exactly with the virtual clock.

use tokio::time::Instant;

use crate::types::now_millis;

/// A millisecond clock anchored to wall time and advanced by tokio time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_millis: i64,
    anchor: Instant,
}

impl Clock {
    /// Anchors the clock at the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(now_millis())
    }

    /// Anchors the clock at a fixed timestamp.
    #[must_use]
    pub fn starting_at(millis: i64) -> Self {
        Self {
            anchor_millis: millis,
            anchor: Instant::now(),
        }
    }

    /// Returns the current timestamp in Unix milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Elapsed time won't exceed i64::MAX ms
    pub fn now_millis(&self) -> i64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
