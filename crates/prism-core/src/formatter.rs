use crate::context::{ProcessingContext, ProcessingResult};
use crate::exchange::{Request, Response};
use chrono::Utc;

/// Capability interface implemented by every provider adapter and utility
/// formatter.
///
/// All methods take `&self` and must be safe to call from several threads
/// at once: the streaming engine drives the streaming hooks from worker
/// threads while callers may run `postprocess_response` on the same value.
/// Streaming hooks keep per-instance state, so one instance should be bound
/// to one stream at a time.
///
/// Failures are reported inside [`ProcessingResult`]; no method panics or
/// returns an error type.
pub trait Formatter: Send + Sync {
    /// Unique name used for registry lookup.
    fn name(&self) -> &str;

    /// Semantic version of the implementation.
    fn version(&self) -> &str;

    /// One-line human description.
    fn description(&self) -> &str;

    /// Input formats understood.
    fn supported_formats(&self) -> &[&'static str];

    /// Output formats produced.
    fn output_formats(&self) -> &[&'static str];

    /// Providers whose responses this formatter understands.
    fn supported_providers(&self) -> &[&'static str];

    /// Free-form capability tags.
    fn capabilities(&self) -> &[&'static str];

    /// Adjusts an outbound request body for the provider.
    fn preprocess_request(&self, request: &Request) -> ProcessingResult;

    /// Normalizes a complete provider response.
    fn postprocess_response(
        &self,
        response: &Response,
        context: &ProcessingContext,
    ) -> ProcessingResult;

    /// Prepares for a chunk sequence. Returning `false` refuses the stream.
    fn begin_streaming(&self, _context: &ProcessingContext) -> bool {
        true
    }

    /// Processes one chunk, returning its incremental visible content.
    fn process_streaming_chunk(
        &self,
        chunk: &str,
        _is_final: bool,
        _context: &ProcessingContext,
    ) -> ProcessingResult {
        ProcessingResult::passthrough(chunk)
    }

    /// Completes a chunk sequence.
    ///
    /// Non-empty `processed_content` in the returned result replaces the
    /// content accumulated from individual chunks.
    fn end_streaming(&self, _context: &ProcessingContext) -> ProcessingResult {
        ProcessingResult::passthrough(String::new())
    }

    /// Drops per-stream state for a stream that will not be finished,
    /// such as one cancelled or timed out.
    fn abort_streaming(&self, _context: &ProcessingContext) {}

    /// Applies a map of recognized options. Unknown keys are ignored.
    fn configure(&self, _options: &serde_json::Value) -> bool {
        true
    }

    /// Whether the current configuration is usable.
    fn validate_configuration(&self) -> bool {
        true
    }

    /// Current configuration as JSON.
    fn configuration(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Counters and derived rates.
    fn get_metrics(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Resets counters.
    fn reset_metrics(&self) {}

    /// Liveness report.
    fn health_check(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "healthy",
            "timestamp": Utc::now().timestamp(),
        })
    }

    /// Identity and status report.
    fn get_diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version(),
            "status": "active",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Formatter for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn supported_formats(&self) -> &[&'static str] {
            &["text"]
        }
        fn output_formats(&self) -> &[&'static str] {
            &["text"]
        }
        fn supported_providers(&self) -> &[&'static str] {
            &["any"]
        }
        fn capabilities(&self) -> &[&'static str] {
            &[]
        }
        fn preprocess_request(&self, request: &Request) -> ProcessingResult {
            ProcessingResult::success(request.data.to_string(), "json")
        }
        fn postprocess_response(
            &self,
            response: &Response,
            _context: &ProcessingContext,
        ) -> ProcessingResult {
            ProcessingResult::success(response.data.clone(), "text")
        }
    }

    #[test]
    fn test_default_streaming_hooks_pass_through() {
        let echo = Echo;
        let ctx = ProcessingContext::new("any", "m");
        assert!(echo.begin_streaming(&ctx));
        let chunk = echo.process_streaming_chunk("hello", false, &ctx);
        assert!(chunk.success);
        assert!(chunk.streaming_mode);
        assert_eq!(chunk.processed_content, "hello");
        let end = echo.end_streaming(&ctx);
        assert!(end.success);
        assert!(end.processed_content.is_empty());
    }

    #[test]
    fn test_default_reports() {
        let echo = Echo;
        assert_eq!(echo.health_check()["status"], "healthy");
        let diag = echo.get_diagnostics();
        assert_eq!(diag["name"], "echo");
        assert_eq!(diag["status"], "active");
        assert!(echo.configure(&serde_json::json!({"anything": 1})));
    }
}
