//! Per-stream state.

use crate::ticket::ChunkTicket;
use parking_lot::{Condvar, Mutex};
use prism_core::{Formatter, ProcessingContext, ToolCall};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

static STREAM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `stream_<unix_ms>_<counter>_<rand 1000..=9999>`.
pub fn generate_stream_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let n = STREAM_COUNTER.fetch_add(1, Ordering::Relaxed);
    let salt = rand::thread_rng().gen_range(1000..=9999);
    format!("stream_{ms}_{n}_{salt}")
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Accepting chunks.
    Active,
    /// Final chunk seen; `end_streaming` running.
    Finalizing,
    /// Completed successfully.
    Finalized,
    /// Cancelled by the caller.
    Cancelled,
    /// Stream timeout elapsed.
    TimedOut,
    /// A formatter failed or panicked, or the expiry sweep removed it.
    Failed,
}

impl StreamPhase {
    /// Whether chunks may still be processed.
    pub fn is_active(self) -> bool {
        matches!(self, StreamPhase::Active | StreamPhase::Finalizing)
    }

    /// Whether the stream has recorded its outcome.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// One chunk waiting for a worker.
#[derive(Debug)]
pub(crate) struct Task {
    pub stream_id: String,
    pub data: String,
    pub is_final: bool,
    pub enqueued: Instant,
    pub done: oneshot::Sender<bool>,
}

impl Task {
    pub fn new(stream_id: &str, data: String, is_final: bool) -> (Self, ChunkTicket) {
        let (done, ticket) = ChunkTicket::pending();
        let task = Self {
            stream_id: stream_id.to_string(),
            data,
            is_final,
            enqueued: Instant::now(),
            done,
        };
        (task, ticket)
    }

    pub fn resolve(self, ok: bool) {
        let _ = self.done.send(ok);
    }
}

/// Accumulators guarded by the stream's mutex.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub phase: StreamPhase,
    pub chunk_buffer: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub reasoning: Option<String>,
    /// Format the formatter reported when it finished the stream.
    pub output_format: Option<String>,
    pub total_bytes: usize,
    pub total_chunks: usize,
    pub error_message: Option<String>,
}

impl StreamState {
    pub fn merge_reasoning(&mut self, reasoning: Option<String>) {
        let Some(r) = reasoning.filter(|r| !r.is_empty()) else {
            return;
        };
        match &mut self.reasoning {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(&r);
            }
            None => self.reasoning = Some(r),
        }
    }
}

/// A live stream bound to one formatter.
pub(crate) struct StreamContext {
    pub stream_id: String,
    pub context: ProcessingContext,
    pub formatter: Arc<dyn Formatter>,
    pub created: Instant,
    pub state: Mutex<StreamState>,
    /// Signalled on every terminal transition.
    pub done: Condvar,
    /// Mirrors `state.phase.is_active()` for lock-free submission checks.
    pub accepting: AtomicBool,
    /// Chunks accepted for enqueue; drives per-stream backpressure.
    pub accepted_chunks: AtomicUsize,
    /// Tasks of a per-stream executor, in submission order.
    pub pending: Mutex<VecDeque<Task>>,
    /// A drain job for this stream is queued or running.
    pub scheduled: AtomicBool,
}

impl StreamContext {
    pub fn new(stream_id: String, context: ProcessingContext, formatter: Arc<dyn Formatter>) -> Self {
        Self {
            stream_id,
            context,
            formatter,
            created: Instant::now(),
            state: Mutex::new(StreamState {
                phase: StreamPhase::Active,
                chunk_buffer: String::new(),
                content: String::new(),
                tool_calls: Vec::new(),
                reasoning: None,
                output_format: None,
                total_bytes: 0,
                total_chunks: 0,
                error_message: None,
            }),
            done: Condvar::new(),
            accepting: AtomicBool::new(true),
            accepted_chunks: AtomicUsize::new(0),
            pending: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Moves an active stream into `phase`. Returns `false` when the stream
    /// already had an outcome.
    pub fn transition(
        &self,
        state: &mut StreamState,
        phase: StreamPhase,
        error: Option<String>,
    ) -> bool {
        if state.phase.is_terminal() {
            return false;
        }
        state.phase = phase;
        if error.is_some() {
            state.error_message = error;
        }
        if phase.is_terminal() {
            self.accepting.store(false, Ordering::Release);
            self.done.notify_all();
        }
        true
    }

    /// Reserves a slot under `threshold`. Fails once the stream has
    /// accepted `threshold` chunks.
    pub fn reserve_chunk(&self, threshold: usize) -> bool {
        self.accepted_chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < threshold).then_some(n + 1)
            })
            .is_ok()
    }

    /// Resolves every task left in the per-stream queue.
    pub fn reject_pending(&self) {
        let drained: Vec<Task> = self.pending.lock().drain(..).collect();
        for task in drained {
            task.resolve(false);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use prism_formatters::MarkdownNormalizer;

    fn ctx() -> StreamContext {
        StreamContext::new(
            generate_stream_id(),
            ProcessingContext::new("openai", "gpt-4o").streaming(),
            Arc::new(MarkdownNormalizer::new()),
        )
    }

    #[test]
    fn test_stream_id_shape() {
        let id = generate_stream_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "stream");
        let ms: i64 = parts[1].parse().unwrap();
        assert!(ms >= chrono::Utc::now().timestamp_millis() - 60_000);
        let salt: u32 = parts[3].parse().unwrap();
        assert!((1000..=9999).contains(&salt));
        assert_ne!(generate_stream_id(), generate_stream_id());
    }

    #[test]
    fn test_single_terminal_transition() {
        let c = ctx();
        let mut state = c.state.lock();
        assert!(c.transition(&mut state, StreamPhase::Finalizing, None));
        assert!(c.accepting.load(Ordering::Acquire));
        assert!(c.transition(&mut state, StreamPhase::Finalized, None));
        assert!(!c.transition(&mut state, StreamPhase::Failed, Some("late".into())));
        assert_eq!(state.phase, StreamPhase::Finalized);
        assert!(state.error_message.is_none());
        assert!(!c.accepting.load(Ordering::Acquire));
    }

    #[test]
    fn test_reserve_chunk_threshold() {
        let c = ctx();
        assert!(c.reserve_chunk(2));
        assert!(c.reserve_chunk(2));
        assert!(!c.reserve_chunk(2));
        assert_eq!(c.accepted_chunks.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_reasoning_merge() {
        let c = ctx();
        let mut state = c.state.lock();
        state.merge_reasoning(Some("a".into()));
        state.merge_reasoning(None);
        state.merge_reasoning(Some(String::new()));
        state.merge_reasoning(Some("b".into()));
        assert_eq!(state.reasoning.as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_reject_pending_resolves_false() {
        let c = ctx();
        let (task, ticket) = Task::new(&c.stream_id, "x".into(), false);
        c.pending.lock().push_back(task);
        c.reject_pending();
        assert!(!ticket.wait());
    }
}
