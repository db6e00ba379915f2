use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free call latency accumulator shared by formatters.
#[derive(Debug, Default)]
pub struct LatencyStats {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyStats {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call.
    pub fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Number of recorded calls.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded durations in microseconds.
    pub fn total_us(&self) -> u64 {
        self.total_us.load(Ordering::Relaxed)
    }

    /// Longest recorded call in microseconds.
    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Mean call duration in microseconds, 0 when nothing was recorded.
    pub fn average_us(&self) -> f64 {
        ratio(self.total_us(), self.count())
    }

    /// Clears all counters.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_us.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

/// `part / total` as a float, 0 when `total` is 0.
pub fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Loads a relaxed counter.
pub fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Increments a relaxed counter by `n`.
pub fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average_and_max() {
        let stats = LatencyStats::new();
        stats.record(Duration::from_micros(100));
        stats.record(Duration::from_micros(300));
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.max_us(), 300);
        assert!((stats.average_us() - 200.0).abs() < f64::EPSILON);
        stats.reset();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.average_us(), 0.0);
    }

    #[test]
    fn test_ratio_zero_total() {
        assert_eq!(ratio(5, 0), 0.0);
        assert!((ratio(1, 4) - 0.25).abs() < f64::EPSILON);
    }
}
