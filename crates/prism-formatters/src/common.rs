//! Helpers shared by the formatters.

use prism_core::{codes, ProcessingContext, ProcessingResult, Response, ToolCall, ToolStatus};
use parking_lot::Mutex;
use prism_toon::ToonCodec;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// `<invoke name="...">…</invoke>` elements.
pub const INVOKE_PATTERN: &str = r#"(?is)<invoke[^>]*name\s*=\s*"([^"]+)"[^>]*>(.*?)</invoke>"#;

/// `<parameter name="...">…</parameter>` elements.
pub const PARAMETER_PATTERN: &str =
    r#"(?is)<parameter[^>]*name\s*=\s*"([^"]+)"[^>]*>(.*?)</parameter>"#;

/// Parses `text` as JSON, retrying on the span from the first `{` to the
/// last `}` when the whole text does not parse.
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Reads tool arguments that may arrive as an object or as a JSON string.
///
/// Returns the structured value and whether it parsed as a JSON object.
/// Unparsable strings are kept under `raw_key`.
pub fn arguments_value(raw: &Value, raw_key: &str) -> (Value, bool) {
    match raw {
        Value::Object(_) => (raw.clone(), true),
        Value::String(s) if s.trim().is_empty() => (json!({}), true),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v @ Value::Object(_)) => (v, true),
            Ok(other) => (json!({ raw_key: other }), false),
            Err(_) => (json!({ raw_key: s }), false),
        },
        Value::Null => (json!({}), true),
        other => (json!({ raw_key: other }), false),
    }
}

/// A parameter value: JSON when it parses, the trimmed string otherwise.
pub fn parameter_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Extracts every `<invoke>` element inside `block` as a completed call.
pub fn parse_invokes(block: &str, invoke: &Regex, parameter: &Regex) -> Vec<ToolCall> {
    invoke
        .captures_iter(block)
        .map(|caps| {
            let name = caps.get(1).map_or("", |m| m.as_str()).trim();
            let body = caps.get(2).map_or("", |m| m.as_str());
            let mut params = serde_json::Map::new();
            for p in parameter.captures_iter(body) {
                let key = p.get(1).map_or("", |m| m.as_str()).trim();
                let value = p.get(2).map_or("", |m| m.as_str());
                params.insert(key.to_string(), parameter_value(value));
            }
            ToolCall::new(name, Value::Object(params)).with_status(ToolStatus::Completed)
        })
        .collect()
}

/// Reads an OpenAI-shaped `tool_calls[]` entry.
///
/// Returns `None` when the entry has no function name.
pub fn openai_tool_call(entry: &Value, status: ToolStatus) -> Option<(ToolCall, bool)> {
    let function = &entry["function"];
    let name = function["name"].as_str().filter(|n| !n.is_empty())?;
    let (params, ok) = arguments_value(&function["arguments"], "raw_arguments");
    let call = ToolCall::new(name, params)
        .with_id(entry["id"].as_str().unwrap_or_default())
        .with_status(status);
    Some((call, ok))
}

/// Failed result for a response the provider itself marked unsuccessful.
pub fn provider_failure(response: &Response) -> ProcessingResult {
    let message = if response.error_message.is_empty() {
        "no error message".to_string()
    } else {
        response.error_message.clone()
    };
    ProcessingResult::failure(
        format!("Provider returned status {}: {message}", response.status_code),
        codes::PROCESSING_ERROR,
    )
}

/// Payload type of visible text: `markdown` when it carries fences or
/// headings, `text` otherwise.
pub fn text_kind(content: &str) -> &'static str {
    let markdown = content.contains("```")
        || content
            .lines()
            .any(|l| l.starts_with("# ") || l.starts_with("## ") || l.starts_with("### "));
    if markdown {
        "markdown"
    } else {
        "text"
    }
}

/// Applies `f` to the text between the matches of `code`, copying the
/// matches through untouched.
pub fn map_outside_code(text: &str, code: Option<&Regex>, f: impl Fn(&str) -> String) -> String {
    let Some(code) = code else {
        return f(text);
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in code.find_iter(text) {
        out.push_str(&f(&text[last..m.start()]));
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&f(&text[last..]));
    out
}

/// Finishes a postprocess call: encodes `working` as TOON and moves its
/// extracted fields onto the returned result.
pub fn render_toon(
    codec: &ToonCodec,
    mut working: ProcessingResult,
    context: &ProcessingContext,
    started: Instant,
) -> ProcessingResult {
    working.tokens_processed = prism_core::estimate_tokens(&working.processed_content);
    working.streaming_mode = context.streaming_mode;
    match codec.serialize_result(&working, context) {
        Ok(toon) => {
            working.processed_content = toon;
            working.output_format = "toon".to_string();
            working.processing_time = started.elapsed();
            working
        }
        Err(e) => {
            warn!(provider = %context.provider_name, error = %e, "TOON serialization failed");
            ProcessingResult::failure(
                format!("TOON serialization failed: {e}"),
                codes::PROCESSING_ERROR,
            )
            .with_processing_time(started.elapsed())
        }
    }
}

/// Streaming state of one formatter, one slot per stream.
///
/// Slots are keyed by [`ProcessingContext::stream_key`], so streams that
/// share a formatter instance never touch each other's buffers.
#[derive(Debug)]
pub struct StreamSlots<S> {
    slots: Mutex<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S> Default for StreamSlots<S> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Default> StreamSlots<S> {
    /// Installs `state` for the context's stream, replacing any leftover.
    pub fn begin(&self, context: &ProcessingContext, state: S) {
        self.slots
            .lock()
            .insert(context.stream_key().to_string(), Arc::new(Mutex::new(state)));
    }

    /// The live slot of the context's stream, if it was begun.
    pub fn get(&self, context: &ProcessingContext) -> Option<Arc<Mutex<S>>> {
        self.slots.lock().get(context.stream_key()).cloned()
    }

    /// Removes the context's stream and hands back its state.
    pub fn finish(&self, context: &ProcessingContext) -> Option<S> {
        let slot = self.slots.lock().remove(context.stream_key())?;
        let state = match Arc::try_unwrap(slot) {
            Ok(state) => state.into_inner(),
            Err(shared) => {
                let mut guard = shared.lock();
                std::mem::take(&mut *guard)
            }
        };
        Some(state)
    }

    /// Number of streams currently open.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Event read from a server-sent-events stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A `data:` payload that parsed as JSON.
    Data(Value),
    /// The `[DONE]` sentinel.
    Done,
}

/// Reassembles `data:` lines that may be split across chunks.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    /// Whether `chunk` starts like an SSE stream.
    pub fn looks_like_sse(chunk: &str) -> bool {
        let head = chunk.trim_start();
        head.starts_with("data:") || head.starts_with("event:") || head.starts_with(':')
    }

    /// Appends `chunk` and returns the events completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();
        while let Some(line_end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=line_end).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing line that was not newline terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&line)
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    serde_json::from_str(data).ok().map(SseEvent::Data)
}
