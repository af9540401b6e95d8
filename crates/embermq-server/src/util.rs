//! Small helpers.

use std::time::{Duration, Instant};

/// A counter that rate-limits log output.
///
/// Accumulates counts and only reports once per interval, so hot paths
/// (dropped messages, slow clients) don't flood the log while the
/// totals stay accurate.
#[derive(Debug)]
pub struct RateLimitedCounter {
    count: u64,
    last_report: Instant,
    interval: Duration,
}

impl RateLimitedCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            count: 0,
            last_report: Instant::now(),
            interval,
        }
    }

    /// Add `n` to the counter. Returns `Some(total)` and resets when
    /// the interval has passed.
    pub fn add(&mut self, n: u64) -> Option<u64> {
        self.count += n;
        if self.count > 0 && self.last_report.elapsed() >= self.interval {
            let total = self.count;
            self.count = 0;
            self.last_report = Instant::now();
            return Some(total);
        }
        None
    }
}
