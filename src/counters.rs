//! Periodic rate counters — the "observability floor" every queue
//! push-drop and every stage rate is reported through.
//!
//! Grounded in the reader's `__log_fps` accumulate-then-log-every-60s
//! pattern: callers feed it a monotonically increasing timestamp (the
//! frame's own timestamp, not wall-clock) so behavior is identical whether
//! driven from a live bus or a paced replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Accumulates a count against a caller-supplied clock and logs the
/// average rate once per `period_s` of that clock.
struct PeriodicCounter {
    label: String,
    period_s: f64,
    count: AtomicU64,
    window_start: Mutex<f64>,
}

impl PeriodicCounter {
    fn new(label: impl Into<String>, period_s: f64) -> Self {
        PeriodicCounter {
            label: label.into(),
            period_s,
            count: AtomicU64::new(0),
            window_start: Mutex::new(f64::NAN),
        }
    }

    /// Returns `Some(average_per_second)` if a full period just elapsed
    /// and the window was reset, `None` otherwise.
    fn observe(&self, n: u64, now: f64) -> Option<f64> {
        self.count.fetch_add(n, Ordering::Relaxed);
        let mut start = self.window_start.lock().unwrap();
        if start.is_nan() {
            *start = now;
            return None;
        }
        if now >= *start + self.period_s {
            let total = self.count.swap(0, Ordering::Relaxed);
            let elapsed = now - *start;
            *start = now;
            if elapsed > 0.0 {
                Some(total as f64 / elapsed)
            } else {
                Some(0.0)
            }
        } else {
            None
        }
    }
}

/// Tracks frames/sec for a pipeline stage and logs it at `debug` level
/// every `period_s`.
pub struct FpsCounter {
    inner: PeriodicCounter,
}

impl FpsCounter {
    pub fn new(label: impl Into<String>, period_s: f64) -> Self {
        FpsCounter {
            inner: PeriodicCounter::new(label, period_s),
        }
    }

    /// Record `n` frames observed at clock value `now` (seconds). Logs and
    /// resets the window when a full period has elapsed.
    pub fn count(&self, n: u64, now: f64) {
        if let Some(avg) = self.inner.observe(n, now) {
            tracing::debug!(label = %self.inner.label, avg_fps = avg, "avg fps");
        }
    }
}

/// Tracks a drop rate for a pipeline stage and logs it at `warn` level
/// every `period_s`. Same accumulation contract as `FpsCounter`.
pub struct DropCounter {
    inner: PeriodicCounter,
}

impl DropCounter {
    pub fn new(label: impl Into<String>, period_s: f64) -> Self {
        DropCounter {
            inner: PeriodicCounter::new(label, period_s),
        }
    }

    /// Record `n` additional drops observed at clock value `now` (seconds).
    pub fn count(&self, n: u64, now: f64) {
        if let Some(avg) = self.inner.observe(n, now) {
            if avg > 0.0 {
                tracing::warn!(label = %self.inner.label, avg_drops_per_sec = avg, "drops occurring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_counter_is_silent_before_first_period_elapses() {
        let c = FpsCounter::new("can0", 60.0);
        c.count(10, 0.0);
        c.count(10, 30.0);
        // No panic, no observable output to assert on directly since logging
        // is the only side effect; this just exercises the accumulate path.
    }

    #[test]
    fn periodic_counter_reports_average_after_period() {
        let c = PeriodicCounter::new("x", 60.0);
        assert_eq!(c.observe(100, 0.0), None);
        let avg = c.observe(0, 60.0).unwrap();
        assert!((avg - (100.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn periodic_counter_resets_window_after_reporting() {
        let c = PeriodicCounter::new("x", 10.0);
        c.observe(50, 0.0);
        let first = c.observe(0, 10.0).unwrap();
        assert!((first - 5.0).abs() < 1e-9);
        c.observe(20, 15.0);
        let second = c.observe(0, 20.0).unwrap();
        assert!((second - 2.0).abs() < 1e-9);
    }
}
