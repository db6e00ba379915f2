//! Engine-wide counters.

use parking_lot::Mutex;
use prism_core::metrics::{bump, load};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot returned by [`StreamProcessor::statistics`](crate::StreamProcessor::statistics).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorStats {
    /// Streams created.
    pub total_streams: u64,
    /// Streams not yet in a terminal state.
    pub active_streams: u64,
    /// Streams whose final chunk and `end_streaming` succeeded.
    pub completed_streams: u64,
    /// Streams cancelled, timed out, expired or failed by a formatter.
    pub failed_streams: u64,
    /// Chunks that reached a formatter.
    pub total_chunks_processed: u64,
    /// Bytes of those chunks.
    pub total_bytes_processed: u64,
    /// Mean chunk rate over collected results.
    pub average_chunks_per_second: f64,
    /// Mean throughput over collected results.
    pub average_throughput_mbps: f64,
    /// Chunk bytes held by streams still in the table.
    pub current_memory_usage: u64,
    /// Submissions shed by backpressure.
    pub backpressure_events: u64,
}

impl ProcessorStats {
    /// Completed share of terminal streams; 1.0 when none has ended.
    pub fn success_rate(&self) -> f64 {
        let terminal = self.completed_streams + self.failed_streams;
        if terminal == 0 {
            1.0
        } else {
            self.completed_streams as f64 / terminal as f64
        }
    }
}

#[derive(Debug, Default)]
struct Throughput {
    samples: u64,
    chunks_per_second: f64,
    mbps: f64,
}

/// Lock-free counters plus a small averaged throughput record.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total_streams: AtomicU64,
    pub completed_streams: AtomicU64,
    pub failed_streams: AtomicU64,
    pub total_chunks: AtomicU64,
    pub total_bytes: AtomicU64,
    pub memory: AtomicU64,
    pub backpressure_events: AtomicU64,
    throughput: Mutex<Throughput>,
}

impl Counters {
    pub fn add_memory(&self, bytes: u64) {
        bump(&self.memory, bytes);
    }

    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| {
                Some(m.saturating_sub(bytes))
            });
    }

    pub fn record_throughput(&self, chunks_per_second: f64, mbps: f64) {
        let mut t = self.throughput.lock();
        t.samples += 1;
        t.chunks_per_second += chunks_per_second;
        t.mbps += mbps;
    }

    pub fn snapshot(&self) -> ProcessorStats {
        let total = load(&self.total_streams);
        let completed = load(&self.completed_streams);
        let failed = load(&self.failed_streams);
        let (cps, mbps) = {
            let t = self.throughput.lock();
            if t.samples == 0 {
                (0.0, 0.0)
            } else {
                let n = t.samples as f64;
                (t.chunks_per_second / n, t.mbps / n)
            }
        };
        ProcessorStats {
            total_streams: total,
            active_streams: total.saturating_sub(completed + failed),
            completed_streams: completed,
            failed_streams: failed,
            total_chunks_processed: load(&self.total_chunks),
            total_bytes_processed: load(&self.total_bytes),
            average_chunks_per_second: cps,
            average_throughput_mbps: mbps,
            current_memory_usage: load(&self.memory),
            backpressure_events: load(&self.backpressure_events),
        }
    }

    /// Zeroes chunk, byte, backpressure and throughput figures. Stream
    /// totals are kept; active streams are derived from them.
    pub fn reset(&self) {
        for counter in [&self.total_chunks, &self.total_bytes, &self.backpressure_events] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.throughput.lock() = Throughput::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_is_derived() {
        let c = Counters::default();
        bump(&c.total_streams, 5);
        bump(&c.completed_streams, 2);
        bump(&c.failed_streams, 1);
        let s = c.snapshot();
        assert_eq!(s.active_streams, 2);
        assert!((s.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_never_underflows() {
        let c = Counters::default();
        c.add_memory(10);
        c.release_memory(25);
        assert_eq!(c.snapshot().current_memory_usage, 0);
    }

    #[test]
    fn test_throughput_average_and_reset() {
        let c = Counters::default();
        c.record_throughput(10.0, 1.0);
        c.record_throughput(30.0, 3.0);
        let s = c.snapshot();
        assert!((s.average_chunks_per_second - 20.0).abs() < 1e-9);
        assert!((s.average_throughput_mbps - 2.0).abs() < 1e-9);
        bump(&c.total_chunks, 3);
        c.reset();
        assert_eq!(c.snapshot().total_chunks_processed, 0);
        assert_eq!(c.snapshot().average_chunks_per_second, 0.0);
    }

    #[test]
    fn test_success_rate_without_terminal_streams() {
        assert_eq!(ProcessorStats::default().success_rate(), 1.0);
    }
}
