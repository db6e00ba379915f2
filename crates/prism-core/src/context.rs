use crate::tool::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request (or per-stream) context handed to every formatter call.
///
/// Created once by the caller and read-only downstream. `provider_name`
/// selects provider-specific rules; unknown providers degrade to the
/// common rule sets instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingContext {
    /// Provider that produced the response (`anthropic`, `openai`, ...).
    pub provider_name: String,
    /// Model identifier reported by the provider.
    pub model_name: String,
    /// Format of the raw payload (`json`, `markdown`, `text`, ...).
    #[serde(default = "default_original_format")]
    pub original_format: String,
    /// Output formats the caller accepts, in preference order.
    #[serde(default = "default_requested_formats")]
    pub requested_formats: Vec<String>,
    /// Whether the response arrives as a chunk sequence.
    #[serde(default)]
    pub streaming_mode: bool,
    /// Stream this context belongs to. Formatters key their streaming
    /// state by it so one instance can serve several streams at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Opaque provider configuration blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
    /// When processing started.
    #[serde(default = "Utc::now")]
    pub processing_start: DateTime<Utc>,
}

fn default_original_format() -> String {
    "json".to_string()
}

fn default_requested_formats() -> Vec<String> {
    vec!["toon".to_string()]
}

impl ProcessingContext {
    /// Creates a context for the given provider and model.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_name: provider.into(),
            model_name: model.into(),
            original_format: default_original_format(),
            requested_formats: default_requested_formats(),
            streaming_mode: false,
            stream_id: None,
            provider_config: None,
            processing_start: Utc::now(),
        }
    }

    /// Sets the original payload format.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.original_format = format.into();
        self
    }

    /// Marks the context as streaming.
    pub fn streaming(mut self) -> Self {
        self.streaming_mode = true;
        self
    }

    /// Binds the context to a stream and marks it as streaming.
    pub fn with_stream_id(mut self, id: impl Into<String>) -> Self {
        self.stream_id = Some(id.into());
        self.streaming_mode = true;
        self
    }

    /// Key for per-stream formatter state. Contexts without a stream id
    /// share the empty key.
    pub fn stream_key(&self) -> &str {
        self.stream_id.as_deref().unwrap_or_default()
    }

    /// Attaches an opaque provider configuration.
    pub fn with_provider_config(mut self, config: serde_json::Value) -> Self {
        self.provider_config = Some(config);
        self
    }
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Outcome of a single formatter call.
///
/// Produced once per preprocess, postprocess, streaming-chunk or
/// end-streaming call and not mutated by the receiver afterwards.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    /// Whether the call produced usable content.
    pub success: bool,
    /// Primary payload, raw or TOON-encoded.
    pub processed_content: String,
    /// Format of `processed_content`.
    pub output_format: String,
    /// Tool calls in extraction order.
    pub extracted_tool_calls: Vec<ToolCall>,
    /// Reasoning separated from the visible content.
    pub reasoning: Option<String>,
    /// Wall-clock time spent in the call.
    pub processing_time: Duration,
    /// Rough token estimate of the processed content.
    pub tokens_processed: usize,
    /// Failure description when `success` is false.
    pub error_message: Option<String>,
    /// Open key-value bag.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Whether the result belongs to a streaming call.
    pub streaming_mode: bool,
}

impl ProcessingResult {
    /// A successful result carrying `content`.
    pub fn success(content: impl Into<String>, output_format: impl Into<String>) -> Self {
        Self {
            success: true,
            processed_content: content.into(),
            output_format: output_format.into(),
            ..Default::default()
        }
    }

    /// A failed result; `code` lands in `metadata["error_code"]`.
    pub fn failure(message: impl Into<String>, code: &str) -> Self {
        let mut result = Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        };
        if !code.is_empty() {
            result
                .metadata
                .insert("error_code".to_string(), serde_json::json!(code));
        }
        result
    }

    /// A streaming passthrough of `content`.
    pub fn passthrough(content: impl Into<String>) -> Self {
        Self {
            success: true,
            processed_content: content.into(),
            output_format: "text".to_string(),
            streaming_mode: true,
            ..Default::default()
        }
    }

    /// Inserts a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Sets the processing time.
    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time = elapsed;
        self
    }

    /// The categorizing error code, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.metadata.get("error_code").and_then(|v| v.as_str())
    }

    /// JSON view for CLI output and diagnostics.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success,
            "processed_content": self.processed_content,
            "output_format": self.output_format,
            "extracted_tool_calls": self
                .extracted_tool_calls
                .iter()
                .map(ToolCall::to_json)
                .collect::<Vec<_>>(),
            "reasoning": self.reasoning,
            "processing_time_ms": self.processing_time.as_secs_f64() * 1000.0,
            "tokens_processed": self.tokens_processed,
            "error_message": self.error_message,
            "metadata": self.metadata,
            "streaming_mode": self.streaming_mode,
        })
    }
}

/// Rough token estimate used across formatters: four bytes per token.
pub fn estimate_tokens(content: &str) -> usize {
    content.len() / 4
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults() {
        let ctx = ProcessingContext::new("openai", "gpt-4o");
        assert_eq!(ctx.original_format, "json");
        assert_eq!(ctx.requested_formats, vec!["toon".to_string()]);
        assert!(!ctx.streaming_mode);
        assert!(ctx.provider_config.is_none());
    }

    #[test]
    fn test_context_deserializes_with_defaults() {
        let ctx: ProcessingContext =
            serde_json::from_str(r#"{"provider_name":"cerebras","model_name":"llama"}"#).unwrap();
        assert_eq!(ctx.provider_name, "cerebras");
        assert_eq!(ctx.original_format, "json");
    }

    #[test]
    fn test_stream_key_follows_stream_id() {
        let plain = ProcessingContext::new("anthropic", "claude");
        assert_eq!(plain.stream_key(), "");
        let bound = plain.with_stream_id("stream_1_2_3");
        assert_eq!(bound.stream_key(), "stream_1_2_3");
        assert!(bound.streaming_mode);
    }

    #[test]
    fn test_failure_sets_error_code() {
        let result = ProcessingResult::failure("too big", "input_too_large");
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("input_too_large"));
        assert_eq!(result.error_message.as_deref(), Some("too big"));
    }

    #[test]
    fn test_passthrough_is_streaming() {
        let result = ProcessingResult::passthrough("abc");
        assert!(result.success);
        assert!(result.streaming_mode);
        assert_eq!(result.processed_content, "abc");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
