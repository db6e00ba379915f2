//! Concurrent streaming session engine.
//!
//! Many response streams share one fixed worker pool. Each stream is bound
//! to a [`Formatter`](prism_core::Formatter) when it is created, receives
//! chunks through [`StreamProcessor::process_chunk`], and yields a TOON
//! document once its final chunk has been processed.
//!
//! # Main types
//!
//! - [`StreamProcessor`]: stream table, worker pool and backpressure.
//! - [`ProcessorConfig`]: pool size, limits, timeouts and [`ChunkOrdering`].
//! - [`ChunkTicket`]: per-chunk completion handle, awaitable or blocking.
//! - [`ProcessorStats`]: counters exposed by [`StreamProcessor::statistics`].
//! - [`BufferPool`]: reusable buffers that stage oversized chunks.

pub mod config;
pub mod context;
pub mod pool;
pub mod processor;
pub mod stats;
pub mod ticket;

pub use config::{
    optimize_for_latency, optimize_for_memory, optimize_for_throughput, ChunkOrdering,
    ProcessorConfig,
};
pub use context::{generate_stream_id, StreamPhase};
pub use pool::{BufferPool, PoolStats, BUFFER_SIZE_BYTES};
pub use processor::StreamProcessor;
pub use stats::ProcessorStats;
pub use ticket::ChunkTicket;
