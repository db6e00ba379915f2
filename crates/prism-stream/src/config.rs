//! Processor options and tuning presets.

use prism_core::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How chunks of one stream are scheduled onto the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrdering {
    /// One shared queue drained by every worker. Chunks of the same stream
    /// may be processed out of submission order.
    #[default]
    Relaxed,
    /// Chunks of one stream run strictly in submission order, by at most
    /// one worker at a time.
    PerStream,
}

impl fmt::Display for ChunkOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkOrdering::Relaxed => "relaxed",
            ChunkOrdering::PerStream => "per_stream",
        })
    }
}

fn default_thread_pool_size() -> usize {
    4
}

fn default_buffer_size_mb() -> usize {
    64
}

fn default_backpressure_threshold() -> usize {
    1000
}

fn default_max_concurrent_streams() -> usize {
    1000
}

fn default_chunk_timeout_ms() -> u64 {
    5000
}

fn default_stream_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

/// Options of the streaming engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Worker threads, 1..=32.
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Pooled 1 MiB buffers, 1..=4096.
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: usize,
    /// Chunks accepted per stream before submissions are shed.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
    /// Streams alive at once.
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    /// Queue wait after which a chunk is logged as late.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Age after which a stream fails.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    /// Record throughput averages.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    /// Reported in diagnostics; chunks are not compressed in memory.
    #[serde(default)]
    pub enable_compression: bool,
    /// Scheduling of same-stream chunks.
    #[serde(default)]
    pub ordering: ChunkOrdering,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: default_thread_pool_size(),
            buffer_size_mb: default_buffer_size_mb(),
            backpressure_threshold: default_backpressure_threshold(),
            max_concurrent_streams: default_max_concurrent_streams(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            enable_metrics: true,
            enable_compression: false,
            ordering: ChunkOrdering::Relaxed,
        }
    }
}

impl ProcessorConfig {
    /// Checks every field against its accepted range.
    pub fn validate(&self) -> PrismResult<()> {
        let fail = |msg: String| Err(PrismError::Config(msg));
        if !(1..=32).contains(&self.thread_pool_size) {
            return fail(format!(
                "thread_pool_size {} outside 1..=32",
                self.thread_pool_size
            ));
        }
        if !(1..=4096).contains(&self.buffer_size_mb) {
            return fail(format!(
                "buffer_size_mb {} outside 1..=4096",
                self.buffer_size_mb
            ));
        }
        if self.backpressure_threshold == 0 {
            return fail("backpressure_threshold must be at least 1".into());
        }
        if self.max_concurrent_streams == 0 {
            return fail("max_concurrent_streams must be at least 1".into());
        }
        if self.chunk_timeout_ms == 0 || self.stream_timeout_ms == 0 {
            return fail("timeouts must be at least 1 ms".into());
        }
        Ok(())
    }

    /// Chunk timeout as a duration.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// Stream timeout as a duration.
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    /// Byte ceiling used by the health check: twice the buffer pool.
    pub fn memory_limit_bytes(&self) -> u64 {
        (self.buffer_size_mb as u64) * 2 * 1024 * 1024
    }
}

/// More workers, buffers and queue headroom.
pub fn optimize_for_throughput(config: &ProcessorConfig) -> ProcessorConfig {
    ProcessorConfig {
        thread_pool_size: (config.thread_pool_size * 2).min(16),
        buffer_size_mb: (config.buffer_size_mb * 2).min(4096),
        backpressure_threshold: config.backpressure_threshold * 2,
        enable_compression: false,
        chunk_timeout_ms: config.chunk_timeout_ms * 2,
        ..config.clone()
    }
}

/// Fewer workers and shorter queues so chunks spend less time waiting.
pub fn optimize_for_latency(config: &ProcessorConfig) -> ProcessorConfig {
    ProcessorConfig {
        thread_pool_size: (config.thread_pool_size / 2).max(2),
        buffer_size_mb: (config.buffer_size_mb / 2).max(16),
        backpressure_threshold: (config.backpressure_threshold / 2).max(100),
        chunk_timeout_ms: (config.chunk_timeout_ms / 2).max(1000),
        ..config.clone()
    }
}

/// Smallest footprint: two workers, a quarter of the buffers.
pub fn optimize_for_memory(config: &ProcessorConfig) -> ProcessorConfig {
    ProcessorConfig {
        thread_pool_size: 2,
        buffer_size_mb: (config.buffer_size_mb / 4).max(8),
        backpressure_threshold: (config.backpressure_threshold / 4).max(50),
        enable_compression: true,
        max_concurrent_streams: (config.max_concurrent_streams / 2).max(100),
        ..config.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ordering, ChunkOrdering::Relaxed);
        assert_eq!(config.stream_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = ProcessorConfig {
            thread_pool_size: 33,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.thread_pool_size = 4;
        config.buffer_size_mb = 0;
        assert!(config.validate().is_err());
        config.buffer_size_mb = 64;
        config.backpressure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml_style() {
        let config: ProcessorConfig =
            serde_json::from_str(r#"{"thread_pool_size": 8, "ordering": "per_stream"}"#).unwrap();
        assert_eq!(config.thread_pool_size, 8);
        assert_eq!(config.ordering, ChunkOrdering::PerStream);
        assert_eq!(config.backpressure_threshold, 1000);
    }

    #[test]
    fn test_throughput_preset() {
        let tuned = optimize_for_throughput(&ProcessorConfig::default());
        assert_eq!(tuned.thread_pool_size, 8);
        assert_eq!(tuned.buffer_size_mb, 128);
        assert_eq!(tuned.backpressure_threshold, 2000);
        assert_eq!(tuned.chunk_timeout_ms, 10_000);
        assert!(!tuned.enable_compression);
        assert_eq!(optimize_for_throughput(&tuned).thread_pool_size, 16);
        assert_eq!(
            optimize_for_throughput(&optimize_for_throughput(&tuned)).thread_pool_size,
            16
        );
    }

    #[test]
    fn test_latency_preset_floors() {
        let small = ProcessorConfig {
            thread_pool_size: 2,
            buffer_size_mb: 20,
            backpressure_threshold: 150,
            chunk_timeout_ms: 1500,
            ..Default::default()
        };
        let tuned = optimize_for_latency(&small);
        assert_eq!(tuned.thread_pool_size, 2);
        assert_eq!(tuned.buffer_size_mb, 16);
        assert_eq!(tuned.backpressure_threshold, 100);
        assert_eq!(tuned.chunk_timeout_ms, 1000);
    }

    #[test]
    fn test_memory_preset() {
        let tuned = optimize_for_memory(&ProcessorConfig::default());
        assert_eq!(tuned.thread_pool_size, 2);
        assert_eq!(tuned.buffer_size_mb, 16);
        assert_eq!(tuned.backpressure_threshold, 250);
        assert_eq!(tuned.max_concurrent_streams, 500);
        assert!(tuned.enable_compression);
        assert!(tuned.validate().is_ok());
    }
}
