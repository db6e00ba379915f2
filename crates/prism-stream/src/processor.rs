//! The streaming session engine.
//!
//! A fixed pool of OS threads drains one task queue shared by every stream.
//! Submissions return a [`ChunkTicket`] immediately; [`StreamProcessor::get_result`]
//! blocks until the stream reaches a terminal state or its deadline.

use crate::config::{ChunkOrdering, ProcessorConfig};
use crate::context::{generate_stream_id, StreamContext, StreamPhase, StreamState, Task};
use crate::pool::BufferPool;
use crate::stats::{Counters, ProcessorStats};
use crate::ticket::ChunkTicket;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use prism_core::metrics::{bump, ratio};
use prism_core::{codes, Formatter, PrismError, PrismResult, ProcessingContext, ProcessingResult};
use prism_toon::{content_type_for, ToonCodec, ToonContent, ToonDocument};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Chunks above this size are staged through a pooled buffer.
const STAGING_THRESHOLD: usize = 64 * 1024;

enum Job {
    /// One chunk, looked up by stream id when a worker picks it up.
    Chunk(Task),
    /// Run the next task of a per-stream queue.
    Drain(String),
}

impl Job {
    fn reject(self, shared: &Shared) {
        match self {
            Job::Chunk(task) => task.resolve(false),
            Job::Drain(id) => {
                if let Some(ctx) = shared.lookup(&id) {
                    ctx.reject_pending();
                }
            }
        }
    }
}

struct Shared {
    config: RwLock<ProcessorConfig>,
    streams: RwLock<HashMap<String, Arc<StreamContext>>>,
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    /// Workers exit when this moves past the value they were started with.
    generation: AtomicU64,
    counters: Counters,
    pool: BufferPool,
    codec: ToonCodec,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Shared {
    fn lookup(&self, stream_id: &str) -> Option<Arc<StreamContext>> {
        self.streams.read().get(stream_id).cloned()
    }

    fn enqueue(&self, job: Job) {
        let mut queue = self.queue.lock();
        if self.shutdown.load(Ordering::Acquire) {
            drop(queue);
            job.reject(self);
            return;
        }
        queue.push_back(job);
        drop(queue);
        self.available.notify_one();
    }

    fn next_job(&self, generation: u64) -> Option<Job> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire)
                || self.generation.load(Ordering::Acquire) != generation
            {
                return None;
            }
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            self.available.wait(&mut queue);
        }
    }

    fn worker_loop(&self, generation: u64) {
        debug!(generation, "Worker started");
        while let Some(job) = self.next_job(generation) {
            match job {
                Job::Chunk(task) => match self.lookup(&task.stream_id) {
                    Some(ctx) => self.run_task(&ctx, task),
                    None => {
                        debug!(stream_id = %task.stream_id, "Chunk for unknown stream dropped");
                        task.resolve(false);
                    }
                },
                Job::Drain(id) => self.drain(&id),
            }
        }
        debug!(generation, "Worker stopped");
    }

    fn drain(&self, stream_id: &str) {
        let Some(ctx) = self.lookup(stream_id) else {
            return;
        };
        let next = {
            let mut pending = ctx.pending.lock();
            let next = pending.pop_front();
            if next.is_none() {
                ctx.scheduled.store(false, Ordering::Release);
            }
            next
        };
        let Some(task) = next else {
            return;
        };
        self.run_task(&ctx, task);

        let more = {
            let pending = ctx.pending.lock();
            if pending.is_empty() {
                ctx.scheduled.store(false, Ordering::Release);
                false
            } else {
                true
            }
        };
        if more {
            self.enqueue(Job::Drain(ctx.stream_id.clone()));
        }
    }

    fn run_task(&self, ctx: &StreamContext, task: Task) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(ctx, &task)));
        let ok = match outcome {
            Ok(ok) => ok,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(stream_id = %ctx.stream_id, panic = %msg, "Formatter panicked while processing a chunk");
                let mut state = ctx.state.lock();
                self.finish(
                    ctx,
                    &mut state,
                    StreamPhase::Failed,
                    Some(format!("Formatter panicked: {msg}")),
                );
                false
            }
        };
        task.resolve(ok);
    }

    fn process(&self, ctx: &StreamContext, task: &Task) -> bool {
        let (stream_timeout, chunk_timeout) = {
            let config = self.config.read();
            (config.stream_timeout(), config.chunk_timeout())
        };
        let mut state = ctx.state.lock();
        if !state.phase.is_active() {
            debug!(stream_id = %ctx.stream_id, phase = ?state.phase, "Chunk for inactive stream dropped");
            return false;
        }
        if ctx.created.elapsed() > stream_timeout {
            warn!(stream_id = %ctx.stream_id, "Stream timeout");
            self.finish(
                ctx,
                &mut state,
                StreamPhase::TimedOut,
                Some("Stream timeout".into()),
            );
            return false;
        }
        let waited = task.enqueued.elapsed();
        if waited > chunk_timeout {
            warn!(
                stream_id = %ctx.stream_id,
                waited_ms = waited.as_millis() as u64,
                "Chunk exceeded its timeout, processing anyway"
            );
        }

        self.stage(&mut state, &task.data);
        let len = task.data.len();
        state.total_bytes += len;
        state.total_chunks += 1;
        bump(&self.counters.total_chunks, 1);
        bump(&self.counters.total_bytes, len as u64);
        self.counters.add_memory(len as u64);

        let result = ctx
            .formatter
            .process_streaming_chunk(&task.data, task.is_final, &ctx.context);
        if !result.success {
            let msg = result
                .error_message
                .unwrap_or_else(|| "Chunk processing failed".to_string());
            warn!(stream_id = %ctx.stream_id, error = %msg, "Formatter rejected a chunk");
            self.finish(ctx, &mut state, StreamPhase::Failed, Some(msg));
            return false;
        }
        state.content.push_str(&result.processed_content);
        state.tool_calls.extend(result.extracted_tool_calls);
        state.merge_reasoning(result.reasoning);
        debug!(
            stream_id = %ctx.stream_id,
            chunk_bytes = len,
            chunks = state.total_chunks,
            "Chunk processed"
        );

        if task.is_final {
            return self.finalize(ctx, &mut state);
        }
        true
    }

    fn stage(&self, state: &mut StreamState, data: &str) {
        if data.len() > STAGING_THRESHOLD {
            let mut staged = self.pool.checkout();
            staged.extend_from_slice(data.as_bytes());
            state.chunk_buffer.push_str(&String::from_utf8_lossy(&staged));
        } else {
            state.chunk_buffer.push_str(data);
        }
    }

    fn finalize(&self, ctx: &StreamContext, state: &mut StreamState) -> bool {
        ctx.transition(state, StreamPhase::Finalizing, None);
        let end = ctx.formatter.end_streaming(&ctx.context);
        if !end.success {
            let msg = end
                .error_message
                .unwrap_or_else(|| "end_streaming failed".to_string());
            warn!(stream_id = %ctx.stream_id, error = %msg, "Formatter failed to finish the stream");
            self.finish(ctx, state, StreamPhase::Failed, Some(msg));
            return false;
        }
        if !end.processed_content.is_empty() {
            state.content = end.processed_content;
        }
        if !end.output_format.is_empty() {
            state.output_format = Some(end.output_format);
        }
        state.tool_calls.extend(end.extracted_tool_calls);
        state.merge_reasoning(end.reasoning);
        self.finish(ctx, state, StreamPhase::Finalized, None);
        debug!(
            stream_id = %ctx.stream_id,
            chunks = state.total_chunks,
            tools = state.tool_calls.len(),
            "Stream finalized"
        );
        true
    }

    /// Records the stream's single outcome.
    fn finish(
        &self,
        ctx: &StreamContext,
        state: &mut StreamState,
        phase: StreamPhase,
        error: Option<String>,
    ) {
        if !ctx.transition(state, phase, error) {
            return;
        }
        if phase == StreamPhase::Finalized {
            bump(&self.counters.completed_streams, 1);
        } else {
            ctx.formatter.abort_streaming(&ctx.context);
            bump(&self.counters.failed_streams, 1);
        }
    }

    fn remove_stream(&self, stream_id: &str) -> Option<Arc<StreamContext>> {
        let ctx = self.streams.write().remove(stream_id)?;
        let bytes = ctx.state.lock().total_bytes;
        self.counters.release_memory(bytes as u64);
        ctx.reject_pending();
        Some(ctx)
    }
}

/// Multiplexes many concurrent response streams over a worker pool.
///
/// Dropping the processor shuts it down: workers are joined and queued
/// chunks resolve `false`.
pub struct StreamProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamProcessor {
    /// Starts a processor with the default TOON codec.
    pub fn new(config: ProcessorConfig) -> PrismResult<Self> {
        Self::with_codec(config, ToonCodec::default())
    }

    /// Starts a processor whose results are encoded with `codec`.
    pub fn with_codec(config: ProcessorConfig, codec: ToonCodec) -> PrismResult<Self> {
        config.validate()?;
        let threads = config.thread_pool_size;
        let pool = BufferPool::new(config.buffer_size_mb);
        let processor = Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                streams: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                counters: Counters::default(),
                pool,
                codec,
            }),
            workers: Mutex::new(Vec::new()),
        };
        processor.spawn_workers(&mut processor.workers.lock(), threads)?;
        info!(workers = threads, "Stream processor started");
        Ok(processor)
    }

    fn spawn_workers(&self, workers: &mut Vec<JoinHandle<()>>, count: usize) -> PrismResult<()> {
        let generation = self.shared.generation.load(Ordering::Acquire);
        for i in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("prism-worker-{i}"))
                .spawn(move || shared.worker_loop(generation))?;
            workers.push(handle);
        }
        Ok(())
    }

    fn restart_workers(&self, count: usize) -> PrismResult<()> {
        let mut workers = self.workers.lock();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        {
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited with a panic");
            }
        }
        self.spawn_workers(&mut workers, count)?;
        info!(workers = count, "Worker pool restarted");
        Ok(())
    }

    // --- Stream lifecycle ---

    /// Registers a stream bound to `formatter` and returns its id.
    ///
    /// Fails with [`PrismError::Capacity`] when `max_concurrent_streams`
    /// streams are alive, and with [`PrismError::Formatter`] when the
    /// formatter refuses to begin.
    pub fn create_stream(
        &self,
        mut context: ProcessingContext,
        formatter: Arc<dyn Formatter>,
    ) -> PrismResult<String> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(PrismError::Stream("Processor is shut down".into()));
        }
        let stream_id = generate_stream_id();
        context.streaming_mode = true;
        context.stream_id = Some(stream_id.clone());
        let max = self.shared.config.read().max_concurrent_streams;
        let mut streams = self.shared.streams.write();
        if streams.len() >= max {
            warn!(max, "Stream rejected at capacity");
            return Err(PrismError::Capacity(format!(
                "Maximum concurrent streams reached ({max})"
            )));
        }
        if !formatter.begin_streaming(&context) {
            return Err(PrismError::Formatter(format!(
                "{} refused to begin streaming",
                formatter.name()
            )));
        }
        let provider = context.provider_name.clone();
        streams.insert(
            stream_id.clone(),
            Arc::new(StreamContext::new(stream_id.clone(), context, formatter)),
        );
        drop(streams);
        bump(&self.shared.counters.total_streams, 1);
        info!(stream_id = %stream_id, provider = %provider, "Stream created");
        Ok(stream_id)
    }

    /// Submits one chunk.
    ///
    /// The ticket resolves `false` without enqueueing when the stream is
    /// unknown or inactive, or under backpressure: the stream already had
    /// `backpressure_threshold` chunks accepted, or the stream table holds
    /// `max_concurrent_streams` streams.
    pub fn process_chunk(
        &self,
        stream_id: &str,
        data: impl Into<String>,
        is_final: bool,
    ) -> ChunkTicket {
        let Some(ctx) = self.shared.lookup(stream_id) else {
            debug!(stream_id = %stream_id, "Chunk for unknown stream rejected");
            return ChunkTicket::resolved(false);
        };
        if self.shared.shutdown.load(Ordering::Acquire) || !ctx.accepting.load(Ordering::Acquire)
        {
            debug!(stream_id = %stream_id, "Chunk for inactive stream rejected");
            return ChunkTicket::resolved(false);
        }
        let (threshold, max_streams, ordering) = {
            let config = self.shared.config.read();
            (
                config.backpressure_threshold,
                config.max_concurrent_streams,
                config.ordering,
            )
        };
        // A full stream table sheds chunks until a stream is collected.
        let live = self.shared.streams.read().len();
        if live >= max_streams || !ctx.reserve_chunk(threshold) {
            bump(&self.shared.counters.backpressure_events, 1);
            warn!(stream_id = %stream_id, live, threshold, "Backpressure: chunk rejected");
            return ChunkTicket::resolved(false);
        }

        let (task, ticket) = Task::new(stream_id, data.into(), is_final);
        match ordering {
            ChunkOrdering::Relaxed => self.shared.enqueue(Job::Chunk(task)),
            ChunkOrdering::PerStream => {
                let schedule = {
                    let mut pending = ctx.pending.lock();
                    pending.push_back(task);
                    !ctx.scheduled.swap(true, Ordering::AcqRel)
                };
                if schedule {
                    self.shared.enqueue(Job::Drain(ctx.stream_id.clone()));
                }
            }
        }
        ticket
    }

    /// Waits for the stream to end, then removes it and returns its result.
    ///
    /// Waiting stops at `created + stream_timeout_ms`, which fails the
    /// stream with "Stream timeout".
    pub fn get_result(&self, stream_id: &str) -> ProcessingResult {
        let started = Instant::now();
        let Some(ctx) = self.shared.lookup(stream_id) else {
            return ProcessingResult::failure(
                format!("Stream not found: {stream_id}"),
                codes::STREAMING_ERROR,
            );
        };
        let deadline = ctx.created + self.shared.config.read().stream_timeout();
        let result = {
            let mut state = ctx.state.lock();
            while state.phase.is_active() {
                if ctx.done.wait_until(&mut state, deadline).timed_out() {
                    if state.phase.is_active() {
                        warn!(stream_id = %stream_id, "Stream timeout while waiting for result");
                        self.shared.finish(
                            &ctx,
                            &mut state,
                            StreamPhase::TimedOut,
                            Some("Stream timeout".into()),
                        );
                    }
                    break;
                }
            }
            self.assemble(&ctx, &mut state, started)
        };
        self.shared.remove_stream(stream_id);
        result
    }

    fn assemble(
        &self,
        ctx: &StreamContext,
        state: &mut StreamState,
        started: Instant,
    ) -> ProcessingResult {
        if state.phase != StreamPhase::Finalized {
            let msg = state
                .error_message
                .clone()
                .unwrap_or_else(|| "Stream ended without finalizing".to_string());
            return ProcessingResult::failure(msg, codes::STREAMING_ERROR)
                .with_metadata("stream_id", json!(ctx.stream_id))
                .with_metadata("total_chunks", json!(state.total_chunks))
                .with_metadata("total_bytes", json!(state.total_bytes));
        }

        let elapsed = ctx.created.elapsed().as_secs_f64().max(1e-9);
        let chunks_per_second = state.total_chunks as f64 / elapsed;
        let throughput_mbps = (state.total_bytes as f64 * 8.0) / 1_000_000.0 / elapsed;
        if self.shared.config.read().enable_metrics {
            self.shared
                .counters
                .record_throughput(chunks_per_second, throughput_mbps);
        }

        // Raw chunks stand in when the formatter produced nothing visible.
        let content = if state.content.is_empty() && state.tool_calls.is_empty() {
            std::mem::take(&mut state.chunk_buffer)
        } else {
            std::mem::take(&mut state.content)
        };
        let tools = std::mem::take(&mut state.tool_calls);
        let reasoning = state.reasoning.take();
        let format = state
            .output_format
            .as_deref()
            .unwrap_or(&ctx.context.original_format);

        let mut doc = ToonDocument::new(ToonContent {
            content_type: content_type_for(format).to_string(),
            format: Some("complete".to_string()),
            content,
        })
        .meta("stream_id", ctx.stream_id.as_str())
        .meta("provider", ctx.context.provider_name.as_str())
        .meta("model", ctx.context.model_name.as_str())
        .meta("total_chunks", state.total_chunks.to_string())
        .meta("total_bytes", state.total_bytes.to_string())
        .meta("streaming_complete", "true");
        doc.tools = tools;
        doc.thinking = reasoning;

        let toon = match self.shared.codec.encode(&doc) {
            Ok(toon) => toon,
            Err(e) => {
                warn!(stream_id = %ctx.stream_id, error = %e, "TOON serialization failed");
                return ProcessingResult::failure(
                    format!("TOON serialization failed: {e}"),
                    codes::PROCESSING_ERROR,
                );
            }
        };

        let mut result = ProcessingResult::success(toon, "toon")
            .with_metadata("stream_id", json!(ctx.stream_id))
            .with_metadata("total_chunks", json!(state.total_chunks))
            .with_metadata("total_bytes", json!(state.total_bytes))
            .with_metadata("streaming_complete", json!(true))
            .with_metadata(
                "processor_stats",
                json!({
                    "chunks_per_second": chunks_per_second,
                    "throughput_mbps": throughput_mbps,
                }),
            )
            .with_processing_time(started.elapsed());
        result.tokens_processed = doc.content.content.len() / 4;
        result.extracted_tool_calls = doc.tools;
        result.reasoning = doc.thinking;
        result.streaming_mode = true;
        result
    }

    /// Marks the stream cancelled. Returns `false` for unknown streams;
    /// cancelling twice is harmless.
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        let Some(ctx) = self.shared.lookup(stream_id) else {
            return false;
        };
        {
            let mut state = ctx.state.lock();
            if state.phase.is_active() {
                info!(stream_id = %stream_id, "Stream cancelled");
            }
            self.shared.finish(
                &ctx,
                &mut state,
                StreamPhase::Cancelled,
                Some("Stream cancelled".into()),
            );
        }
        ctx.reject_pending();
        true
    }

    /// Whether the stream exists and still accepts chunks.
    pub fn is_stream_active(&self, stream_id: &str) -> bool {
        self.shared
            .lookup(stream_id)
            .is_some_and(|ctx| ctx.accepting.load(Ordering::Acquire))
    }

    /// Ids of every stream in the table, sorted.
    pub fn active_stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.streams.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Fails and removes streams older than twice the stream timeout that
    /// have not finalized. Returns how many were removed.
    pub fn cleanup_expired_streams(&self) -> usize {
        let limit = self.shared.config.read().stream_timeout() * 2;
        let candidates: Vec<Arc<StreamContext>> = self
            .shared
            .streams
            .read()
            .values()
            .filter(|ctx| ctx.created.elapsed() > limit)
            .cloned()
            .collect();
        let mut removed = 0;
        for ctx in candidates {
            {
                let mut state = ctx.state.lock();
                if state.phase == StreamPhase::Finalized {
                    continue;
                }
                self.shared.finish(
                    &ctx,
                    &mut state,
                    StreamPhase::Failed,
                    Some("Stream expired".into()),
                );
            }
            if self.shared.remove_stream(&ctx.stream_id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Expired streams cleaned up");
        }
        removed
    }

    // --- Configuration ---

    /// Validates and applies `config`. On error the previous configuration
    /// stays in place. A new pool size restarts the workers; queued chunks
    /// are kept.
    pub fn configure(&self, config: ProcessorConfig) -> PrismResult<()> {
        config.validate()?;
        let threads = config.thread_pool_size;
        let buffers = config.buffer_size_mb;
        let previous = std::mem::replace(&mut *self.shared.config.write(), config);
        self.shared.pool.ensure(buffers);
        if previous.thread_pool_size != threads {
            self.restart_workers(threads)?;
        }
        info!(workers = threads, "Processor configuration applied");
        Ok(())
    }

    /// Active configuration.
    pub fn configuration(&self) -> ProcessorConfig {
        self.shared.config.read().clone()
    }

    // --- Reporting ---

    /// Counter snapshot.
    pub fn statistics(&self) -> ProcessorStats {
        self.shared.counters.snapshot()
    }

    /// Zeroes chunk, byte, throughput and backpressure counters.
    pub fn reset_statistics(&self) {
        self.shared.counters.reset();
        info!("Processor statistics reset");
    }

    /// Statistics, configuration, pool state and one entry per stream.
    pub fn diagnostics(&self) -> Value {
        let stats = self.statistics();
        let mut statistics = serde_json::to_value(&stats).unwrap_or_default();
        statistics["success_rate"] = json!(stats.success_rate());
        let contexts: Vec<Arc<StreamContext>> =
            self.shared.streams.read().values().cloned().collect();
        let mut streams: Vec<Value> = contexts
            .iter()
            .map(|ctx| {
                let state = ctx.state.lock();
                json!({
                    "stream_id": ctx.stream_id,
                    "provider": ctx.context.provider_name,
                    "model": ctx.context.model_name,
                    "chunks_received": state.total_chunks,
                    "bytes_received": state.total_bytes,
                    "age_ms": ctx.created.elapsed().as_millis() as u64,
                    "phase": state.phase,
                    "is_active": state.phase.is_active(),
                    "is_finalized": state.phase == StreamPhase::Finalized,
                })
            })
            .collect();
        streams.sort_by(|a, b| a["stream_id"].as_str().cmp(&b["stream_id"].as_str()));
        json!({
            "statistics": statistics,
            "configuration": self.configuration(),
            "thread_pool": {
                "worker_threads": self.workers.lock().len(),
                "shutdown_requested": self.shared.shutdown.load(Ordering::Acquire),
            },
            "buffer_pool": self.shared.pool.stats(),
            "streams": streams,
        })
    }

    /// Liveness, memory, success-rate and backpressure checks.
    pub fn health_check(&self) -> Value {
        let stats = self.statistics();
        let config = self.configuration();
        let thread_pool_responsive = {
            let workers = self.workers.lock();
            !self.shared.shutdown.load(Ordering::Acquire)
                && !workers.is_empty()
                && workers.iter().all(|h| !h.is_finished())
        };
        let memory_within_limits = stats.current_memory_usage < config.memory_limit_bytes();
        let success_rate = stats.success_rate();
        let acceptable_success_rate = success_rate >= 0.95;
        let backpressure_ratio = ratio(stats.backpressure_events, stats.total_chunks_processed);
        let acceptable_backpressure = backpressure_ratio <= 0.1;
        let overall_healthy = thread_pool_responsive
            && memory_within_limits
            && acceptable_success_rate
            && acceptable_backpressure;
        json!({
            "status": if overall_healthy { "healthy" } else { "unhealthy" },
            "timestamp": Utc::now().timestamp(),
            "thread_pool_responsive": thread_pool_responsive,
            "memory_within_limits": memory_within_limits,
            "acceptable_success_rate": acceptable_success_rate,
            "acceptable_backpressure": acceptable_backpressure,
            "overall_healthy": overall_healthy,
            "performance_metrics": {
                "average_chunks_per_second": stats.average_chunks_per_second,
                "average_throughput_mbps": stats.average_throughput_mbps,
                "success_rate": success_rate,
                "backpressure_ratio": backpressure_ratio,
                "current_memory_usage": stats.current_memory_usage,
            },
        })
    }

    /// Stops and joins every worker. Chunks still queued resolve `false`.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited with a panic");
            }
        }
        let leftover: Vec<Job> = self.shared.queue.lock().drain(..).collect();
        let dropped = leftover.len();
        for job in leftover {
            job.reject(&self.shared);
        }
        let contexts: Vec<Arc<StreamContext>> =
            self.shared.streams.read().values().cloned().collect();
        for ctx in contexts {
            ctx.reject_pending();
        }
        info!(dropped, "Stream processor stopped");
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
