//! OpenAI chat-completions formatter.
//!
//! The payload shape decides the extraction path: modern `tool_calls`,
//! legacy `function_call`, bare structured JSON output, or legacy text
//! completions. Every response is screened for script, SQL-injection and
//! path-traversal idioms before it is parsed.

use crate::common::{
    openai_tool_call, provider_failure, render_toon, text_kind, SseBuffer, SseEvent, StreamSlots,
};
use crate::guard::{ContentGuard, MAX_INPUT_BYTES};
use chrono::Utc;
use parking_lot::RwLock;
use prism_core::metrics::{bump, load, ratio};
use prism_core::{
    codes, estimate_tokens, Formatter, LatencyStats, OptionReader, PatternTable,
    ProcessingContext, ProcessingResult, Request, Response, ToolCall, ToolStatus,
};
use prism_toon::ToonCodec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const NAME: &str = "openai-gpt-formatter";
const DEFAULT_MAX_FUNCTION_CALLS: usize = 10;
const PERFORMANCE_TARGET_US: f64 = 40_000.0;

const PATTERNS: &[(&str, &str)] = &[
    ("trailing_comma", r",\s*([}\]])"),
    ("stream_artifacts", r#"\[DONE\]|data:\s*\{|:\s*"?DONE"?"#),
];

/// Payload shapes told apart by [`OpenAiFormatter::detect_format_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFormat {
    /// `choices[0].message.tool_calls`.
    FunctionCalling,
    /// `choices[0].message.function_call`.
    LegacyFunction,
    /// A JSON object that is not a completion.
    StructuredOutput,
    /// A plain chat completion.
    ChatCompletion,
    /// `choices[0].text` or a root `text` field.
    LegacyFormat,
    /// Not JSON at all.
    Text,
    /// JSON that is not an object.
    Unknown,
}

impl OpenAiFormat {
    /// Wire name used in result metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenAiFormat::FunctionCalling => "function-calling",
            OpenAiFormat::LegacyFunction => "legacy-function",
            OpenAiFormat::StructuredOutput => "structured-output",
            OpenAiFormat::ChatCompletion => "chat-completion",
            OpenAiFormat::LegacyFormat => "legacy-format",
            OpenAiFormat::Text => "text",
            OpenAiFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OpenAiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options recognized by the OpenAI formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Map legacy `function_call` and text completions.
    #[serde(default = "default_true")]
    pub support_legacy_formats: bool,
    /// Mark calls with unparsable arguments as failed.
    #[serde(default = "default_true")]
    pub strict_function_validation: bool,
    /// Validate and repair bare JSON outputs.
    #[serde(default = "default_true")]
    pub enable_structured_outputs: bool,
    /// Check `required` fields of `response_format` schemas.
    #[serde(default = "default_true")]
    pub validate_tool_schemas: bool,
    /// Keep reasoning content reported by the model.
    #[serde(default)]
    pub preserve_thinking: bool,
    /// Calls kept per response; the rest are dropped.
    #[serde(default = "default_max_function_calls")]
    pub max_function_calls: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_function_calls() -> usize {
    DEFAULT_MAX_FUNCTION_CALLS
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            support_legacy_formats: true,
            strict_function_validation: true,
            enable_structured_outputs: true,
            validate_tool_schemas: true,
            preserve_thinking: false,
            max_function_calls: default_max_function_calls(),
        }
    }
}

impl OpenAiConfig {
    fn is_valid(&self) -> bool {
        (1..=50).contains(&self.max_function_calls)
    }
}

#[derive(Debug, Default)]
struct Counters {
    latency: LatencyStats,
    function_calls_processed: AtomicU64,
    structured_outputs_validated: AtomicU64,
    legacy_formats_processed: AtomicU64,
    validation_errors: AtomicU64,
    streaming_chunks_processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    Sse,
    Raw,
}

#[derive(Debug, Default)]
struct StreamState {
    started: Option<Instant>,
    mode: Option<StreamMode>,
    sse: SseBuffer,
    text: String,
    reasoning: String,
    calls: BTreeMap<u64, (String, String, String)>,
    legacy_call: Option<(String, String)>,
}

#[derive(Debug)]
struct Analysis {
    format: OpenAiFormat,
    content: String,
    content_kind: &'static str,
    tools: Vec<ToolCall>,
    reasoning: Option<String>,
}

/// Formatter for OpenAI and OpenAI-compatible chat completions.
pub struct OpenAiFormatter {
    config: RwLock<OpenAiConfig>,
    patterns: PatternTable,
    guard: ContentGuard,
    codec: ToonCodec,
    counters: Counters,
    stream: StreamSlots<StreamState>,
}

impl Default for OpenAiFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiFormatter {
    /// Creates a formatter with default options.
    pub fn new() -> Self {
        Self::with_config(OpenAiConfig::default())
    }

    /// Creates a formatter with the given options.
    pub fn with_config(config: OpenAiConfig) -> Self {
        Self {
            config: RwLock::new(config),
            patterns: PatternTable::build("openai", PATTERNS),
            guard: ContentGuard::with_threats(MAX_INPUT_BYTES),
            codec: ToonCodec::default(),
            counters: Counters::default(),
            stream: StreamSlots::default(),
        }
    }

    /// Removes trailing commas before `}` and `]`.
    pub fn repair_json(&self, text: &str) -> String {
        match self.patterns.get("trailing_comma") {
            Some(re) => re.replace_all(text, "$1").into_owned(),
            None => text.to_string(),
        }
    }

    /// Classifies a payload by its JSON shape.
    pub fn detect_format_type(&self, text: &str) -> OpenAiFormat {
        let body = match serde_json::from_str::<Value>(text.trim()) {
            Ok(body) => body,
            Err(_) => match serde_json::from_str::<Value>(&self.repair_json(text.trim())) {
                Ok(Value::Object(_)) => return OpenAiFormat::StructuredOutput,
                _ => return OpenAiFormat::Text,
            },
        };
        classify(&body)
    }

    /// Validates a structured output, repairing trailing commas.
    ///
    /// Returns the compact JSON, or the reason it was rejected.
    pub fn validate_structured_output(
        &self,
        text: &str,
        schema: Option<&Value>,
    ) -> Result<String, String> {
        let value = match serde_json::from_str::<Value>(text.trim()) {
            Ok(v) => v,
            Err(first) => serde_json::from_str::<Value>(&self.repair_json(text.trim()))
                .map_err(|_| format!("Invalid structured output JSON: {first}"))?,
        };
        if !value.is_object() {
            return Err("Structured output must be a JSON object".to_string());
        }
        let validate_schema = self.config.read().validate_tool_schemas;
        if let (true, Some(required)) = (
            validate_schema,
            schema.and_then(|s| s["required"].as_array()),
        ) {
            for field in required.iter().filter_map(Value::as_str) {
                if value.get(field).is_none() {
                    return Err(format!("Missing required field: {field}"));
                }
            }
        }
        Ok(value.to_string())
    }

    /// Extracts calls from a parsed completion.
    ///
    /// Reads `tool_calls` first and, when legacy formats are enabled and
    /// there are none, the single `function_call`.
    pub fn extract_function_calls(&self, body: &Value) -> Vec<ToolCall> {
        let config = self.config.read().clone();
        let message = &body["choices"][0]["message"];
        let mut calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| openai_tool_call(entry, ToolStatus::Completed))
                    .map(|(call, ok)| self.checked(call, ok, config.strict_function_validation))
                    .collect()
            })
            .unwrap_or_default();

        if calls.is_empty() && config.support_legacy_formats {
            let function = &message["function_call"];
            if function["name"].is_string() {
                let entry = json!({ "function": function });
                if let Some((call, ok)) = openai_tool_call(&entry, ToolStatus::Completed) {
                    bump(&self.counters.legacy_formats_processed, 1);
                    calls.push(self.checked(call, ok, config.strict_function_validation));
                }
            }
        }

        if calls.len() > config.max_function_calls {
            warn!(
                found = calls.len(),
                max = config.max_function_calls,
                "Dropping function calls over the limit"
            );
            calls.truncate(config.max_function_calls);
        }
        bump(&self.counters.function_calls_processed, calls.len() as u64);
        calls
    }

    fn checked(&self, call: ToolCall, arguments_ok: bool, strict: bool) -> ToolCall {
        if arguments_ok || !strict {
            return call;
        }
        bump(&self.counters.validation_errors, 1);
        debug!(tool = %call.name, "Function arguments are not a JSON object");
        call.with_status(ToolStatus::Failed)
    }

    fn strip_artifacts(&self, text: &str) -> String {
        let cleaned = match self.patterns.get("stream_artifacts") {
            Some(re) => re.replace_all(text, "").into_owned(),
            None => text.to_string(),
        };
        cleaned.trim().to_string()
    }

    fn analyze(&self, raw: &str) -> Analysis {
        let config = self.config.read().clone();
        let format = self.detect_format_type(raw);
        let body = serde_json::from_str::<Value>(raw.trim()).unwrap_or(Value::Null);
        let message = &body["choices"][0]["message"];
        let reasoning = if config.preserve_thinking {
            message["reasoning_content"]
                .as_str()
                .or_else(|| message["reasoning"].as_str())
                .filter(|r| !r.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        let (content, tools) = match format {
            OpenAiFormat::FunctionCalling | OpenAiFormat::LegacyFunction => (
                message["content"].as_str().unwrap_or_default().to_string(),
                self.extract_function_calls(&body),
            ),
            OpenAiFormat::ChatCompletion => (
                message["content"].as_str().unwrap_or_default().to_string(),
                Vec::new(),
            ),
            OpenAiFormat::LegacyFormat if config.support_legacy_formats => {
                bump(&self.counters.legacy_formats_processed, 1);
                let text = body["choices"][0]["text"]
                    .as_str()
                    .or_else(|| body["text"].as_str())
                    .unwrap_or_default();
                (text.to_string(), Vec::new())
            }
            OpenAiFormat::StructuredOutput if config.enable_structured_outputs => {
                match self.validate_structured_output(raw, None) {
                    Ok(json) => {
                        bump(&self.counters.structured_outputs_validated, 1);
                        return Analysis {
                            format,
                            content: json,
                            content_kind: "json",
                            tools: Vec::new(),
                            reasoning,
                        };
                    }
                    Err(reason) => {
                        bump(&self.counters.validation_errors, 1);
                        debug!(reason, "Structured output rejected");
                        (raw.trim().to_string(), Vec::new())
                    }
                }
            }
            OpenAiFormat::Text => (self.strip_artifacts(raw), Vec::new()),
            _ => (raw.trim().to_string(), Vec::new()),
        };
        Analysis {
            format,
            content_kind: text_kind(&content),
            content,
            tools,
            reasoning,
        }
    }

    fn handle_delta(&self, state: &mut StreamState, event: &Value, visible: &mut String) {
        let delta = &event["choices"][0]["delta"];
        if let Some(content) = delta["content"].as_str() {
            state.text.push_str(content);
            visible.push_str(content);
        }
        if let Some(reasoning) = delta["reasoning_content"].as_str() {
            state.reasoning.push_str(reasoning);
        }
        if let Some(entries) = delta["tool_calls"].as_array() {
            for entry in entries {
                let index = entry["index"].as_u64().unwrap_or(0);
                let slot = state
                    .calls
                    .entry(index)
                    .or_insert_with(|| (String::new(), String::new(), String::new()));
                if let Some(id) = entry["id"].as_str() {
                    slot.0 = id.to_string();
                }
                if let Some(name) = entry["function"]["name"].as_str() {
                    slot.1.push_str(name);
                }
                if let Some(args) = entry["function"]["arguments"].as_str() {
                    slot.2.push_str(args);
                }
            }
        }
        let function = &delta["function_call"];
        if function.is_object() {
            let slot = state
                .legacy_call
                .get_or_insert_with(|| (String::new(), String::new()));
            if let Some(name) = function["name"].as_str() {
                slot.0.push_str(name);
            }
            if let Some(args) = function["arguments"].as_str() {
                slot.1.push_str(args);
            }
        }
    }

    fn finish_stream_calls(&self, state: &mut StreamState) -> Vec<ToolCall> {
        let config = self.config.read().clone();
        let mut entries: Vec<Value> = std::mem::take(&mut state.calls)
            .into_values()
            .map(|(id, name, args)| {
                json!({ "id": id, "function": { "name": name, "arguments": args } })
            })
            .collect();
        if let Some((name, args)) = state.legacy_call.take() {
            entries.push(json!({ "function": { "name": name, "arguments": args } }));
        }
        let mut calls: Vec<ToolCall> = entries
            .iter()
            .filter_map(|entry| openai_tool_call(entry, ToolStatus::Completed))
            .map(|(call, ok)| self.checked(call, ok, config.strict_function_validation))
            .collect();
        calls.truncate(config.max_function_calls);
        bump(&self.counters.function_calls_processed, calls.len() as u64);
        calls
    }
}

fn classify(body: &Value) -> OpenAiFormat {
    let Some(object) = body.as_object() else {
        return OpenAiFormat::Unknown;
    };
    let choice = &body["choices"][0];
    let message = &choice["message"];
    if message.get("tool_calls").is_some_and(|v| !v.is_null()) {
        return OpenAiFormat::FunctionCalling;
    }
    if message.get("function_call").is_some_and(|v| !v.is_null()) {
        return OpenAiFormat::LegacyFunction;
    }
    if choice.get("text").is_some() || (object.contains_key("text") && !object.contains_key("choices"))
    {
        return OpenAiFormat::LegacyFormat;
    }
    if !object.contains_key("choices") {
        return OpenAiFormat::StructuredOutput;
    }
    OpenAiFormat::ChatCompletion
}

impl Formatter for OpenAiFormatter {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "OpenAI completions: tool calls, legacy function calls and structured outputs"
    }

    fn supported_formats(&self) -> &[&'static str] {
        &[
            "function-calling",
            "legacy-function",
            "structured-output",
            "chat-completion",
            "legacy-format",
            "streaming-json",
        ]
    }

    fn output_formats(&self) -> &[&'static str] {
        &[
            "toon",
            "json",
            "normalized-text",
            "structured-data",
            "function-calls",
        ]
    }

    fn supported_providers(&self) -> &[&'static str] {
        &["openai", "openai-compatibility"]
    }

    fn capabilities(&self) -> &[&'static str] {
        &[
            "function-calling",
            "structured-outputs",
            "legacy-support",
            "streaming-support",
            "json-validation",
            "schema-validation",
            "security-validation",
        ]
    }

    fn preprocess_request(&self, request: &Request) -> ProcessingResult {
        let started = Instant::now();
        let config = self.config.read().clone();
        let Some(body) = request.data.as_object() else {
            return ProcessingResult::failure(
                "Request body must be a JSON object",
                codes::VALIDATION_ERROR,
            );
        };
        let mut body = body.clone();

        if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
            for tool in tools.iter_mut() {
                let Some(function) = tool.get_mut("function").and_then(Value::as_object_mut) else {
                    continue;
                };
                if !function.get("name").is_some_and(Value::is_string) {
                    bump(&self.counters.validation_errors, 1);
                    return ProcessingResult::failure(
                        "Tool function missing required 'name' field",
                        codes::VALIDATION_ERROR,
                    );
                }
                function
                    .entry("type")
                    .or_insert_with(|| json!("function"));
                if !function.get("parameters").is_some_and(Value::is_object) {
                    function.insert(
                        "parameters".to_string(),
                        json!({"type": "object", "properties": {}}),
                    );
                }
            }
        }

        if config.enable_structured_outputs {
            if let Some(format) = body.get_mut("response_format").and_then(Value::as_object_mut) {
                if format.get("type").and_then(Value::as_str) == Some("json_object") {
                    format.entry("schema").or_insert_with(|| json!({}));
                }
            }
        }

        body.insert(
            "_openai_metadata".to_string(),
            json!({
                "preprocessed_at": Utc::now().timestamp(),
                "legacy_support": config.support_legacy_formats,
                "strict_validation": config.strict_function_validation,
                "structured_outputs": config.enable_structured_outputs,
            }),
        );

        let mut result =
            ProcessingResult::success(Value::Object(body).to_string(), "openai-preprocessed")
                .with_processing_time(started.elapsed());
        result.tokens_processed = estimate_tokens(&request.data.to_string());
        result
    }

    fn postprocess_response(
        &self,
        response: &Response,
        context: &ProcessingContext,
    ) -> ProcessingResult {
        let started = Instant::now();
        if !response.success {
            return provider_failure(response);
        }
        let raw = match self.guard.screen(&response.data).resolve(&response.data) {
            Ok(raw) => raw,
            Err(failure) => {
                bump(&self.counters.validation_errors, 1);
                return failure.with_processing_time(started.elapsed());
            }
        };

        let analysis = self.analyze(&raw);
        self.counters.latency.record(started.elapsed());
        debug!(
            format = %analysis.format,
            tools = analysis.tools.len(),
            "OpenAI response processed"
        );

        let format = analysis.format;
        let mut working = ProcessingResult::success(analysis.content, analysis.content_kind)
            .with_metadata("provider", json!("openai"))
            .with_metadata("format_type", json!(format.as_str()))
            .with_metadata("function_calls_count", json!(analysis.tools.len()))
            .with_metadata(
                "structured_output",
                json!(format == OpenAiFormat::StructuredOutput),
            )
            .with_metadata(
                "legacy_processed",
                json!(format == OpenAiFormat::LegacyFormat),
            );
        working.extracted_tool_calls = analysis.tools;
        working.reasoning = analysis.reasoning;
        render_toon(&self.codec, working, context, started)
    }

    fn begin_streaming(&self, context: &ProcessingContext) -> bool {
        self.stream.begin(
            context,
            StreamState {
                started: Some(Instant::now()),
                ..Default::default()
            },
        );
        debug!(stream_id = context.stream_key(), "OpenAI streaming started");
        true
    }

    fn process_streaming_chunk(
        &self,
        chunk: &str,
        is_final: bool,
        context: &ProcessingContext,
    ) -> ProcessingResult {
        let Some(slot) = self.stream.get(context) else {
            return ProcessingResult::failure("Streaming not initialized", codes::STREAMING_ERROR);
        };
        let mut state = slot.lock();
        bump(&self.counters.streaming_chunks_processed, 1);
        let mode = *state.mode.get_or_insert(if SseBuffer::looks_like_sse(chunk) {
            StreamMode::Sse
        } else {
            StreamMode::Raw
        });
        if mode == StreamMode::Raw {
            state.text.push_str(chunk);
            return ProcessingResult::passthrough(chunk);
        }

        let mut events = state.sse.push(chunk);
        if is_final {
            events.extend(state.sse.finish());
        }
        let mut visible = String::new();
        for event in &events {
            if let SseEvent::Data(data) = event {
                self.handle_delta(&mut state, data, &mut visible);
            }
        }
        ProcessingResult::passthrough(visible)
    }

    fn end_streaming(&self, context: &ProcessingContext) -> ProcessingResult {
        let Some(mut state) = self.stream.finish(context) else {
            return ProcessingResult::failure("Streaming not active", codes::STREAMING_ERROR);
        };
        let started = Instant::now();

        let (content, tools, reasoning) = match state.mode {
            Some(StreamMode::Sse) => {
                if let Some(SseEvent::Data(data)) = state.sse.finish() {
                    let mut ignored = String::new();
                    self.handle_delta(&mut state, &data, &mut ignored);
                }
                let tools = self.finish_stream_calls(&mut state);
                let reasoning = Some(std::mem::take(&mut state.reasoning))
                    .filter(|r| !r.is_empty() && self.config.read().preserve_thinking);
                (std::mem::take(&mut state.text), tools, reasoning)
            }
            _ => {
                let analysis = self.analyze(&state.text);
                (analysis.content, analysis.tools, analysis.reasoning)
            }
        };
        self.counters.latency.record(started.elapsed());

        let elapsed_ms = state
            .started
            .map_or(0, |s| u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX));
        let mut result = ProcessingResult::success(content, "text")
            .with_metadata("streaming_completed", json!(true))
            .with_metadata("total_streaming_time_ms", json!(elapsed_ms))
            .with_processing_time(started.elapsed());
        result.tokens_processed = estimate_tokens(&result.processed_content);
        result.extracted_tool_calls = tools;
        result.reasoning = reasoning;
        result.streaming_mode = true;
        result
    }

    fn abort_streaming(&self, context: &ProcessingContext) {
        self.stream.finish(context);
    }

    fn configure(&self, options: &Value) -> bool {
        let Some(reader) = OptionReader::new(NAME, options) else {
            warn!(formatter = NAME, "Configuration must be a JSON object");
            return false;
        };
        let mut next = self.config.read().clone();
        reader.bool("support_legacy_formats", &mut next.support_legacy_formats);
        reader.bool(
            "strict_function_validation",
            &mut next.strict_function_validation,
        );
        reader.bool("enable_structured_outputs", &mut next.enable_structured_outputs);
        reader.bool("validate_tool_schemas", &mut next.validate_tool_schemas);
        reader.bool("preserve_thinking", &mut next.preserve_thinking);
        let mut max_calls = i64::try_from(next.max_function_calls).unwrap_or(i64::MAX);
        reader.int_in("max_function_calls", 1..=50, 10, &mut max_calls);
        next.max_function_calls = usize::try_from(max_calls).unwrap_or(DEFAULT_MAX_FUNCTION_CALLS);

        if !next.is_valid() {
            warn!(formatter = NAME, "Rejecting invalid configuration");
            return false;
        }
        *self.config.write() = next;
        info!(formatter = NAME, "Configuration applied");
        true
    }

    fn validate_configuration(&self) -> bool {
        self.config.read().is_valid()
    }

    fn configuration(&self) -> Value {
        serde_json::to_value(&*self.config.read()).unwrap_or_default()
    }

    fn get_metrics(&self) -> Value {
        let c = &self.counters;
        let count = c.latency.count();
        let errors = load(&c.validation_errors);
        json!({
            "total_processing_count": count,
            "total_processing_time_us": c.latency.total_us(),
            "average_processing_time_us": c.latency.average_us(),
            "max_processing_time_us": c.latency.max_us(),
            "function_calls_processed": load(&c.function_calls_processed),
            "structured_outputs_validated": load(&c.structured_outputs_validated),
            "legacy_formats_processed": load(&c.legacy_formats_processed),
            "validation_errors": errors,
            "streaming_chunks_processed": load(&c.streaming_chunks_processed),
            "success_rate": if count == 0 { 1.0 } else { 1.0 - ratio(errors.min(count), count) },
        })
    }

    fn reset_metrics(&self) {
        let c = &self.counters;
        c.latency.reset();
        for counter in [
            &c.function_calls_processed,
            &c.structured_outputs_validated,
            &c.legacy_formats_processed,
            &c.validation_errors,
            &c.streaming_chunks_processed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn health_check(&self) -> Value {
        let sample = json!({"choices": [{"message": {"tool_calls": [
            {"function": {"name": "test_function", "arguments": "{\"param\": \"value\"}"}}
        ]}}]});
        let extraction_ok = sample["choices"][0]["message"]["tool_calls"]
            .as_array()
            .and_then(|calls| calls.first())
            .and_then(|entry| openai_tool_call(entry, ToolStatus::Completed))
            .is_some_and(|(_, ok)| ok);
        let structured_ok = self
            .validate_structured_output(r#"{"test": "validation", "number": 42,}"#, None)
            .is_ok();
        let config_ok = self.validate_configuration();
        let healthy = extraction_ok && structured_ok && config_ok;
        let metrics = self.get_metrics();
        json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "timestamp": Utc::now().timestamp(),
            "function_call_extraction": extraction_ok,
            "structured_output_validation": structured_ok,
            "configuration_valid": config_ok,
            "patterns_available": self.patterns.len() == PATTERNS.len(),
            "recent_performance": {
                "avg_processing_time_us": metrics["average_processing_time_us"],
                "success_rate": metrics["success_rate"],
                "validation_errors": metrics["validation_errors"],
            },
        })
    }

    fn get_diagnostics(&self) -> Value {
        let config = self.config.read().clone();
        let average = self.counters.latency.average_us();
        let count = self.counters.latency.count();
        let mut limitations = Vec::new();
        if !config.support_legacy_formats {
            limitations.push("Legacy format support disabled");
        }
        if !config.enable_structured_outputs {
            limitations.push("Structured output validation disabled");
        }
        if ratio(load(&self.counters.validation_errors), count) > 0.1 {
            limitations.push("High validation error rate");
        }
        json!({
            "name": NAME,
            "version": self.version(),
            "status": "active",
            "active_streams": self.stream.active(),
            "configuration": self.configuration(),
            "metrics": self.get_metrics(),
            "capabilities": {
                "function_calling": true,
                "structured_outputs": config.enable_structured_outputs,
                "legacy_support": config.support_legacy_formats,
                "streaming": true,
                "json_validation": true,
                "schema_validation": config.validate_tool_schemas,
            },
            "performance_analysis": {
                "average_processing_time_us": average,
                "meets_performance_target": average < PERFORMANCE_TARGET_US,
                "function_call_rate": ratio(load(&self.counters.function_calls_processed), count),
            },
            "limitations": limitations,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx() -> ProcessingContext {
        ProcessingContext::new("openai", "gpt-4o")
    }

    #[test]
    fn test_detect_format_type() {
        let f = OpenAiFormatter::new();
        let cases = [
            (
                r#"{"choices":[{"message":{"tool_calls":[]}}]}"#,
                OpenAiFormat::FunctionCalling,
            ),
            (
                r#"{"choices":[{"message":{"function_call":{"name":"f"}}}]}"#,
                OpenAiFormat::LegacyFunction,
            ),
            (r#"{"answer": 42}"#, OpenAiFormat::StructuredOutput),
            (r#"{"answer": 42,}"#, OpenAiFormat::StructuredOutput),
            (r#"{"text": "old"}"#, OpenAiFormat::LegacyFormat),
            (r#"{"choices":[{"text":"old"}]}"#, OpenAiFormat::LegacyFormat),
            (
                r#"{"choices":[{"message":{"content":"hi"}}]}"#,
                OpenAiFormat::ChatCompletion,
            ),
            ("plain words", OpenAiFormat::Text),
            ("[1, 2]", OpenAiFormat::Unknown),
        ];
        for (input, expected) in cases {
            assert_eq!(f.detect_format_type(input), expected, "input {input}");
        }
    }

    #[test]
    fn test_tool_call_extraction() {
        let f = OpenAiFormatter::new();
        let body = json!({"choices":[{"message":{"tool_calls":[{"id":"call_123","function":{"name":"get_weather","arguments":"{\"location\":\"New York\"}"}}]}}]});
        let calls = f.extract_function_calls(&body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].id, "call_123");
        assert_eq!(calls[0].parameters["location"], "New York");
        assert_eq!(calls[0].status, ToolStatus::Completed);
    }

    #[test]
    fn test_strict_validation_marks_failed() {
        let f = OpenAiFormatter::new();
        let body = json!({"choices":[{"message":{"tool_calls":[{"id":"c1","function":{"name":"f","arguments":"{broken"}}]}}]});
        let calls = f.extract_function_calls(&body);
        assert_eq!(calls[0].status, ToolStatus::Failed);
        assert_eq!(calls[0].parameters["raw_arguments"], "{broken");

        assert!(f.configure(&json!({"strict_function_validation": false})));
        let calls = f.extract_function_calls(&body);
        assert_eq!(calls[0].status, ToolStatus::Completed);
    }

    #[test]
    fn test_legacy_function_call() {
        let f = OpenAiFormatter::new();
        let body = json!({"choices":[{"message":{"function_call":{"name":"lookup","arguments":"{\"id\":7}"}}}]});
        let calls = f.extract_function_calls(&body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["id"], 7);

        assert!(f.configure(&json!({"support_legacy_formats": false})));
        assert!(f.extract_function_calls(&body).is_empty());
    }

    #[test]
    fn test_max_function_calls_truncates() {
        let f = OpenAiFormatter::new();
        assert!(f.configure(&json!({"max_function_calls": 2})));
        let entries: Vec<Value> = (0..5)
            .map(|i| json!({"id": format!("c{i}"), "function": {"name": "f", "arguments": "{}"}}))
            .collect();
        let body = json!({"choices":[{"message":{"tool_calls": entries}}]});
        assert_eq!(f.extract_function_calls(&body).len(), 2);
    }

    #[test]
    fn test_structured_output_repair_and_schema() {
        let f = OpenAiFormatter::new();
        assert_eq!(
            f.validate_structured_output(r#"{"a": [1, 2,], "b": 3,}"#, None)
                .unwrap(),
            r#"{"a":[1,2],"b":3}"#
        );
        let schema = json!({"required": ["name"]});
        let err = f
            .validate_structured_output(r#"{"other": 1}"#, Some(&schema))
            .unwrap_err();
        assert!(err.contains("name"));
        assert!(f.validate_structured_output("[1]", None).is_err());
    }

    #[test]
    fn test_postprocess_security_violation() {
        let f = OpenAiFormatter::new();
        let response = Response::ok("openai", r#"{"choices":[{"message":{"content":"<script>alert(1)</script>"}}]}"#);
        let result = f.postprocess_response(&response, &ctx());
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(codes::SECURITY_VIOLATION));
    }

    #[test]
    fn test_postprocess_metadata() {
        let f = OpenAiFormatter::new();
        let response = Response::ok("openai", r#"{"text": "legacy answer"}"#);
        let result = f.postprocess_response(&response, &ctx());
        assert!(result.success);
        assert_eq!(result.metadata["format_type"], "legacy-format");
        assert_eq!(result.metadata["legacy_processed"], true);
        assert!(result.processed_content.contains("[CONTENT: legacy answer]"));
    }

    #[test]
    fn test_preprocess_validates_tools() {
        let f = OpenAiFormatter::new();
        let missing = Request::new(json!({"tools": [{"function": {"description": "x"}}]}));
        let result = f.preprocess_request(&missing);
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(codes::VALIDATION_ERROR));

        let ok = Request::new(json!({"tools": [{"function": {"name": "f", "parameters": "bad"}}]}));
        let result = f.preprocess_request(&ok);
        assert!(result.success);
        let body: Value = serde_json::from_str(&result.processed_content).unwrap();
        assert_eq!(body["tools"][0]["function"]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert!(body["_openai_metadata"]["preprocessed_at"].is_i64());
    }

    #[test]
    fn test_streaming_sse_deltas() {
        let f = OpenAiFormatter::new();
        let ctx = ctx().streaming();
        assert!(f.begin_streaming(&ctx));
        let a = f.process_streaming_chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            false,
            &ctx,
        );
        assert_eq!(a.processed_content, "Hello");
        f.process_streaming_chunk(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"loc\"}}]}}]}\n",
            false,
            &ctx,
        );
        f.process_streaming_chunk(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ation\\\":\\\"Oslo\\\"}\"}}]}}]}\ndata: [DONE]\n",
            true,
            &ctx,
        );
        let end = f.end_streaming(&ctx);
        assert!(end.success);
        assert_eq!(end.processed_content, "Hello");
        assert_eq!(end.extracted_tool_calls.len(), 1);
        assert_eq!(end.extracted_tool_calls[0].id, "call_9");
        assert_eq!(end.extracted_tool_calls[0].parameters["location"], "Oslo");
    }

    #[test]
    fn test_streaming_requires_begin() {
        let f = OpenAiFormatter::new();
        let result = f.process_streaming_chunk("x", false, &ctx());
        assert_eq!(result.error_code(), Some(codes::STREAMING_ERROR));
    }

    #[test]
    fn test_configure_max_calls_fallback() {
        let f = OpenAiFormatter::new();
        assert!(f.configure(&json!({"max_function_calls": 500, "unknown": true})));
        assert_eq!(f.configuration()["max_function_calls"], 10);
        assert!(f.validate_configuration());
    }
}
