//! Cerebras formatter tuned for latency.
//!
//! Extraction runs against a wall-clock budget. Once the budget is spent the
//! formatter stops and returns the raw payload tagged as a fast failover.

use crate::common::{
    arguments_value, openai_tool_call, provider_failure, render_toon, text_kind, SseBuffer,
    SseEvent, StreamSlots,
};
use crate::guard::{ContentGuard, MAX_INPUT_BYTES};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use prism_core::metrics::{bump, load, ratio};
use prism_core::{
    codes, estimate_tokens, Formatter, LatencyStats, OptionReader, PatternTable,
    ProcessingContext, ProcessingResult, Request, Response, ToolCall, ToolStatus,
};
use prism_toon::ToonCodec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NAME: &str = "cerebras-speed-formatter";
const DEFAULT_BUDGET_MS: u64 = 50;
const STREAM_BUFFER_LIMIT: usize = 1024 * 1024;
const SPEED_TARGET_US: f64 = 50_000.0;

const PATTERNS: &[(&str, &str)] = &[
    (
        "fast_tool",
        r#"\{"type":"function_call","function":\{[^}]*\}\}"#,
    ),
    ("json_fragment", r"\{(?:[^{}]|\{[^{}]*\})*\}"),
    ("artifacts", r#"\[DONE\]|data:\s*\{|:\s*"?DONE"?"#),
    ("whitespace", r"\s+"),
];

/// Options recognized by the Cerebras formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CerebrasConfig {
    /// Apply request defaults and the lightweight text normalization.
    #[serde(default = "default_true")]
    pub optimize_speed: bool,
    /// Log every extraction at debug level.
    #[serde(default)]
    pub enable_detailed_metrics: bool,
    /// Reuse the compiled fragment patterns across calls.
    #[serde(default = "default_true")]
    pub cache_tool_patterns: bool,
    /// Processing budget per call; 0 always fails over.
    #[serde(default = "default_budget_ms")]
    pub max_processing_time_ms: u64,
    /// Return the raw payload once the budget is spent.
    #[serde(default = "default_true")]
    pub enable_fast_failover: bool,
}

fn default_true() -> bool {
    true
}

fn default_budget_ms() -> u64 {
    DEFAULT_BUDGET_MS
}

impl Default for CerebrasConfig {
    fn default() -> Self {
        Self {
            optimize_speed: true,
            enable_detailed_metrics: false,
            cache_tool_patterns: true,
            max_processing_time_ms: DEFAULT_BUDGET_MS,
            enable_fast_failover: true,
        }
    }
}

impl CerebrasConfig {
    fn is_valid(&self) -> bool {
        self.max_processing_time_ms <= 1000
    }
}

/// Shape of the payload the calls were found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadShape {
    /// Whole-body `choices[0].message.tool_calls`.
    ChatCompletion,
    /// `{"type":"function_call","function":{..}}` fragments.
    FunctionFragment,
    /// A generic JSON fragment carrying `function_call`.
    LegacyFragment,
    /// Nothing recognizable.
    Plain,
}

impl PayloadShape {
    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadShape::ChatCompletion => "chat-completion",
            PayloadShape::FunctionFragment => "function-fragment",
            PayloadShape::LegacyFragment => "legacy-fragment",
            PayloadShape::Plain => "plain",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    latency: LatencyStats,
    tool_calls_extracted: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fast_failovers_triggered: AtomicU64,
}

#[derive(Debug, Default)]
struct StreamState {
    started: Option<Instant>,
    buffer: String,
    failed_over: bool,
}

/// Outcome of a budgeted extraction.
#[derive(Debug)]
enum Extraction {
    Done {
        shape: PayloadShape,
        tools: Vec<ToolCall>,
    },
    OverBudget,
}

/// Latency-first formatter for Cerebras responses.
pub struct CerebrasFormatter {
    config: RwLock<CerebrasConfig>,
    patterns: PatternTable,
    guard: ContentGuard,
    codec: ToonCodec,
    counters: Counters,
    shapes_seen: Mutex<HashSet<PayloadShape>>,
    stream: StreamSlots<StreamState>,
}

impl Default for CerebrasFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl CerebrasFormatter {
    /// Creates a formatter with default options.
    pub fn new() -> Self {
        Self::with_config(CerebrasConfig::default())
    }

    /// Creates a formatter with the given options.
    pub fn with_config(config: CerebrasConfig) -> Self {
        Self {
            config: RwLock::new(config),
            patterns: PatternTable::build("cerebras", PATTERNS),
            guard: ContentGuard::new(MAX_INPUT_BYTES),
            codec: ToonCodec::default(),
            counters: Counters::default(),
            shapes_seen: Mutex::new(HashSet::new()),
            stream: StreamSlots::default(),
        }
    }

    fn over_budget(&self, started: Instant) -> bool {
        let config = self.config.read();
        if !config.enable_fast_failover {
            return false;
        }
        config.max_processing_time_ms == 0
            || started.elapsed() > Duration::from_millis(config.max_processing_time_ms)
    }

    /// Minimal result carrying the untouched payload.
    pub fn fast_failover(&self, raw: &str, context: &ProcessingContext) -> ProcessingResult {
        bump(&self.counters.fast_failovers_triggered, 1);
        debug!(provider = %context.provider_name, "Fast failover applied");
        let mut result = ProcessingResult::success(raw, "basic")
            .with_metadata("fast_failover", json!(true))
            .with_metadata("reason", json!("processing_time_exceeded"));
        result.streaming_mode = context.streaming_mode;
        result
    }

    /// Strips stream artifacts and collapses whitespace when speed
    /// optimization is on.
    pub fn fast_normalize(&self, content: &str) -> String {
        if !self.config.read().optimize_speed {
            return content.to_string();
        }
        let mut out = content.to_string();
        if let Some(re) = self.patterns.get("artifacts") {
            out = re.replace_all(&out, "").into_owned();
        }
        if let Some(re) = self.patterns.get("whitespace") {
            out = re.replace_all(&out, " ").into_owned();
        }
        out.trim().to_string()
    }

    /// Extracts calls without a time budget.
    pub fn extract_tool_calls(&self, content: &str) -> Vec<ToolCall> {
        match self.extract(content, None) {
            Extraction::Done { tools, .. } => tools,
            Extraction::OverBudget => Vec::new(),
        }
    }

    fn extract(&self, content: &str, started: Option<Instant>) -> Extraction {
        let over = |at: Option<Instant>| at.is_some_and(|s| self.over_budget(s));

        if let Ok(body) = serde_json::from_str::<Value>(content.trim()) {
            if let Some(entries) = body["choices"][0]["message"]["tool_calls"].as_array() {
                let tools: Vec<ToolCall> = entries
                    .iter()
                    .filter_map(|entry| openai_tool_call(entry, ToolStatus::Pending))
                    .map(|(call, _)| call)
                    .collect();
                return self.finish(PayloadShape::ChatCompletion, tools);
            }
        }
        if over(started) {
            return Extraction::OverBudget;
        }

        let mut tools = Vec::new();
        if let Some(re) = self.patterns.get("fast_tool") {
            for m in re.find_iter(content) {
                let Ok(fragment) = serde_json::from_str::<Value>(m.as_str()) else {
                    continue;
                };
                let function = &fragment["function"];
                let Some(name) = function["name"].as_str() else {
                    continue;
                };
                let (params, _) = arguments_value(&function["arguments"], "raw_arguments");
                tools.push(
                    ToolCall::new(name, params)
                        .with_id(fragment["id"].as_str().unwrap_or_default())
                        .with_status(ToolStatus::Pending),
                );
            }
        }
        if !tools.is_empty() {
            return self.finish(PayloadShape::FunctionFragment, tools);
        }
        if over(started) {
            return Extraction::OverBudget;
        }

        if let Some(re) = self.patterns.get("json_fragment") {
            for m in re.find_iter(content) {
                if !m.as_str().contains("function_call") {
                    continue;
                }
                let Ok(fragment) = serde_json::from_str::<Value>(m.as_str()) else {
                    continue;
                };
                let call = &fragment["function_call"];
                if let Some(name) = call["name"].as_str() {
                    let (params, _) = arguments_value(&call["arguments"], "raw_arguments");
                    tools.push(ToolCall::new(name, params).with_status(ToolStatus::Pending));
                    break;
                }
            }
        }
        if over(started) {
            return Extraction::OverBudget;
        }
        let shape = if tools.is_empty() {
            PayloadShape::Plain
        } else {
            PayloadShape::LegacyFragment
        };
        self.finish(shape, tools)
    }

    fn finish(&self, shape: PayloadShape, tools: Vec<ToolCall>) -> Extraction {
        let cached = self.config.read().cache_tool_patterns;
        let hit = cached && !self.shapes_seen.lock().insert(shape);
        if hit {
            bump(&self.counters.cache_hits, 1);
        } else {
            bump(&self.counters.cache_misses, 1);
        }
        bump(&self.counters.tool_calls_extracted, tools.len() as u64);
        if self.config.read().enable_detailed_metrics {
            debug!(shape = shape.as_str(), tools = tools.len(), hit, "Cerebras extraction");
        }
        Extraction::Done { shape, tools }
    }

    fn visible_text(&self, raw: &str) -> String {
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(body) => body["choices"][0]["message"]["content"]
                .as_str()
                .or_else(|| body["choices"][0]["text"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.fast_normalize(raw)),
            Err(_) => self.fast_normalize(raw),
        }
    }

    fn stream_text(buffer: &str) -> Option<String> {
        if !SseBuffer::looks_like_sse(buffer) {
            return None;
        }
        let mut sse = SseBuffer::default();
        let mut events = sse.push(buffer);
        events.extend(sse.finish());
        let text = events
            .iter()
            .filter_map(|event| match event {
                SseEvent::Data(data) => data["choices"][0]["delta"]["content"].as_str(),
                SseEvent::Done => None,
            })
            .collect();
        Some(text)
    }
}

impl Formatter for CerebrasFormatter {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "Cerebras responses: fast tool-call extraction under a latency budget"
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["json", "text", "markdown", "cerebras-raw", "streaming-json"]
    }

    fn output_formats(&self) -> &[&'static str] {
        &["toon", "json", "normalized-text", "structured-data"]
    }

    fn supported_providers(&self) -> &[&'static str] {
        &["cerebras", "cerebras-ai"]
    }

    fn capabilities(&self) -> &[&'static str] {
        &[
            "speed-optimization",
            "fast-tool-calls",
            "streaming-support",
            "minimal-overhead",
            "toon-formatting",
            "performance-metrics",
            "fast-failover",
        ]
    }

    fn preprocess_request(&self, request: &Request) -> ProcessingResult {
        let started = Instant::now();
        let Some(body) = request.data.as_object() else {
            return ProcessingResult::failure(
                "Request body must be a JSON object",
                codes::VALIDATION_ERROR,
            );
        };
        let mut body = body.clone();
        if self.config.read().optimize_speed {
            body.entry("temperature").or_insert_with(|| json!(0.1));
            body.entry("max_tokens").or_insert_with(|| json!(2048));
            body.insert(
                "_cerebras_optimization".to_string(),
                json!({
                    "speed_priority": true,
                    "minimize_latency": true,
                    "fast_tool_mode": true,
                }),
            );
            if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
                for function in tools
                    .iter_mut()
                    .filter_map(|tool| tool.get_mut("function").and_then(Value::as_object_mut))
                {
                    function.insert("_optimize".to_string(), json!(true));
                }
            }
        }
        let mut result =
            ProcessingResult::success(Value::Object(body).to_string(), "cerebras-optimized")
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
            Err(failure) => return failure.with_processing_time(started.elapsed()),
        };
        if self.over_budget(started) {
            return self.fast_failover(&response.data, context);
        }

        let (shape, tools) = match self.extract(&raw, Some(started)) {
            Extraction::Done { shape, tools } => (shape, tools),
            Extraction::OverBudget => return self.fast_failover(&response.data, context),
        };
        let content = self.visible_text(&raw);
        self.counters.latency.record(started.elapsed());

        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let kind = text_kind(&content);
        let mut working = ProcessingResult::success(content, kind)
            .with_metadata("provider", json!("cerebras"))
            .with_metadata("processing_time_us", json!(elapsed_us))
            .with_metadata("speed_optimized", json!(self.config.read().optimize_speed))
            .with_metadata("tool_calls_count", json!(tools.len()))
            .with_metadata("payload_shape", json!(shape.as_str()));
        working.extracted_tool_calls = tools;
        render_toon(&self.codec, working, context, started)
    }

    fn begin_streaming(&self, context: &ProcessingContext) -> bool {
        self.stream.begin(
            context,
            StreamState {
                started: Some(Instant::now()),
                buffer: String::with_capacity(4096),
                failed_over: false,
            },
        );
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
        if state.failed_over {
            return ProcessingResult::passthrough(chunk).with_metadata("fast_failover", json!(true));
        }
        state.buffer.push_str(chunk);
        if state.buffer.len() > STREAM_BUFFER_LIMIT && self.config.read().enable_fast_failover {
            warn!(
                size = state.buffer.len(),
                limit = STREAM_BUFFER_LIMIT,
                stream_id = context.stream_key(),
                "Streaming buffer limit exceeded"
            );
            // Earlier chunks already went out; only this one is left to emit.
            state.failed_over = true;
            state.buffer = String::new();
            return self.fast_failover(chunk, context);
        }

        // Tool calls are extracted once, in end_streaming.
        let mut result = ProcessingResult::passthrough(chunk);
        if is_final {
            result = result
                .with_metadata("final_chunk", json!(true))
                .with_metadata("total_buffer_size", json!(state.buffer.len()));
        }
        result
    }

    fn end_streaming(&self, context: &ProcessingContext) -> ProcessingResult {
        let Some(state) = self.stream.finish(context) else {
            return ProcessingResult::failure("Streaming not active", codes::STREAMING_ERROR);
        };
        if state.failed_over {
            // Empty content keeps the chunks already emitted.
            let mut result = ProcessingResult::success("", "basic")
                .with_metadata("streaming_completed", json!(true))
                .with_metadata("fast_failover", json!(true));
            result.streaming_mode = true;
            return result;
        }
        let started = Instant::now();
        let tools = self.extract_tool_calls(&state.buffer);
        let content =
            Self::stream_text(&state.buffer).unwrap_or_else(|| self.visible_text(&state.buffer));
        self.counters.latency.record(started.elapsed());

        let total_ms = state
            .started
            .map_or(0, |s| u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX));
        let mut result = ProcessingResult::success(content, "text")
            .with_metadata("streaming_completed", json!(true))
            .with_metadata("total_streaming_time_ms", json!(total_ms))
            .with_processing_time(started.elapsed());
        result.tokens_processed = estimate_tokens(&result.processed_content);
        result.extracted_tool_calls = tools;
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
        reader.bool("optimize_speed", &mut next.optimize_speed);
        reader.bool("enable_detailed_metrics", &mut next.enable_detailed_metrics);
        reader.bool("cache_tool_patterns", &mut next.cache_tool_patterns);
        reader.bool("enable_fast_failover", &mut next.enable_fast_failover);
        let mut budget = i64::try_from(next.max_processing_time_ms).unwrap_or(i64::MAX);
        reader.int_in(
            "max_processing_time_ms",
            0..=1000,
            DEFAULT_BUDGET_MS as i64,
            &mut budget,
        );
        next.max_processing_time_ms = u64::try_from(budget).unwrap_or(DEFAULT_BUDGET_MS);

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
        let hits = load(&c.cache_hits);
        let misses = load(&c.cache_misses);
        json!({
            "total_processing_count": c.latency.count(),
            "total_processing_time_us": c.latency.total_us(),
            "average_processing_time_us": c.latency.average_us(),
            "max_processing_time_us": c.latency.max_us(),
            "tool_calls_extracted": load(&c.tool_calls_extracted),
            "cache_hits": hits,
            "cache_misses": misses,
            "cache_hit_rate": ratio(hits, hits + misses),
            "fast_failovers_triggered": load(&c.fast_failovers_triggered),
            "speed_optimization_enabled": self.config.read().optimize_speed,
        })
    }

    fn reset_metrics(&self) {
        let c = &self.counters;
        c.latency.reset();
        for counter in [
            &c.tool_calls_extracted,
            &c.cache_hits,
            &c.cache_misses,
            &c.fast_failovers_triggered,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.shapes_seen.lock().clear();
    }

    fn health_check(&self) -> Value {
        let timer = Instant::now();
        let _ = self.extract(r#"{"test": "speed_validation"}"#, None);
        let check_us = u64::try_from(timer.elapsed().as_micros()).unwrap_or(u64::MAX);
        let config_ok = self.validate_configuration();
        let metrics = self.get_metrics();
        json!({
            "status": if config_ok { "healthy" } else { "unhealthy" },
            "timestamp": Utc::now().timestamp(),
            "speed_validation_us": check_us,
            "speed_within_target": check_us < 10_000,
            "pattern_cache_available": self.patterns.len() == PATTERNS.len(),
            "configuration_valid": config_ok,
            "processing_stats": {
                "avg_processing_time_us": metrics["average_processing_time_us"],
                "total_processed": metrics["total_processing_count"],
                "cache_hit_rate": metrics["cache_hit_rate"],
            },
        })
    }

    fn get_diagnostics(&self) -> Value {
        let average = self.counters.latency.average_us();
        let metrics = self.get_metrics();
        let hit_rate = metrics["cache_hit_rate"].as_f64().unwrap_or_default();
        let mut recommendations = Vec::new();
        if average > 30_000.0 {
            recommendations.push("Consider enabling more aggressive speed optimizations");
        }
        if hit_rate < 0.8 {
            recommendations.push("Pattern cache may need tuning");
        }
        if !self.config.read().optimize_speed {
            recommendations.push("Speed optimization is disabled");
        }
        json!({
            "name": NAME,
            "version": self.version(),
            "status": "active",
            "active_streams": self.stream.active(),
            "configuration": self.configuration(),
            "metrics": metrics,
            "performance_analysis": {
                "average_processing_speed_us": average,
                "meets_speed_target": average < SPEED_TARGET_US,
                "cache_efficiency": hit_rate,
                "fast_failover_utilization": load(&self.counters.fast_failovers_triggered) > 0,
            },
            "recommendations": recommendations,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx() -> ProcessingContext {
        ProcessingContext::new("cerebras", "llama3.1-8b")
    }

    #[test]
    fn test_whole_json_tool_calls_are_pending() {
        let f = CerebrasFormatter::new();
        let body = r#"{"choices":[{"message":{"content":"","tool_calls":[{"id":"c1","function":{"name":"search","arguments":"{\"q\":\"rust\"}"}}]}}]}"#;
        let calls = f.extract_tool_calls(body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].parameters["q"], "rust");
        assert_eq!(calls[0].status, ToolStatus::Pending);
    }

    #[test]
    fn test_fast_fragment_extraction() {
        let f = CerebrasFormatter::new();
        let text = r#"calling {"type":"function_call","function":{"name":"ping"}} and {"type":"function_call","function":{"name":"pong","arguments":"x"}}"#;
        let calls = f.extract_tool_calls(text);
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["ping", "pong"]);
        assert_eq!(calls[1].parameters["raw_arguments"], "x");
    }

    #[test]
    fn test_generic_function_call_fragment() {
        let f = CerebrasFormatter::new();
        let text = r#"result: {"function_call": {"name": "lookup"}} done"#;
        let calls = f.extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].status, ToolStatus::Pending);
    }

    #[test]
    fn test_zero_budget_fails_over_with_raw_content() {
        let f = CerebrasFormatter::new();
        assert!(f.configure(&json!({"max_processing_time_ms": 0})));
        let raw = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
        let result = f.postprocess_response(&Response::ok("cerebras", raw), &ctx());
        assert!(result.success);
        assert_eq!(result.processed_content, raw);
        assert_eq!(result.output_format, "basic");
        assert_eq!(result.metadata["fast_failover"], true);
        assert_eq!(result.metadata["reason"], "processing_time_exceeded");
        assert_eq!(f.get_metrics()["fast_failovers_triggered"], 1);
    }

    #[test]
    fn test_failover_disabled_processes_normally() {
        let f = CerebrasFormatter::new();
        assert!(f.configure(&json!({"max_processing_time_ms": 0, "enable_fast_failover": false})));
        let result = f.postprocess_response(
            &Response::ok("cerebras", r#"{"choices":[{"message":{"content":"hi"}}]}"#),
            &ctx(),
        );
        assert_eq!(result.output_format, "toon");
        assert!(result.processed_content.contains("[CONTENT: hi]"));
        assert_eq!(result.metadata["provider"], "cerebras");
    }

    #[test]
    fn test_cache_counts_per_shape() {
        let f = CerebrasFormatter::new();
        f.extract_tool_calls("plain text");
        f.extract_tool_calls("more plain text");
        f.extract_tool_calls(r#"{"type":"function_call","function":{"name":"a"}}"#);
        let metrics = f.get_metrics();
        assert_eq!(metrics["cache_misses"], 2);
        assert_eq!(metrics["cache_hits"], 1);

        assert!(f.configure(&json!({"cache_tool_patterns": false})));
        f.extract_tool_calls("plain text");
        assert_eq!(f.get_metrics()["cache_misses"], 3);
    }

    #[test]
    fn test_preprocess_speed_defaults() {
        let f = CerebrasFormatter::new();
        let request = Request::new(json!({
            "temperature": 0.7,
            "tools": [{"type": "function", "function": {"name": "f"}}]
        }));
        let result = f.preprocess_request(&request);
        let body: Value = serde_json::from_str(&result.processed_content).unwrap();
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["_cerebras_optimization"]["speed_priority"], true);
        assert_eq!(body["tools"][0]["function"]["_optimize"], true);
    }

    #[test]
    fn test_streaming_collects_sse_content() {
        let f = CerebrasFormatter::new();
        let ctx = ctx().streaming();
        assert!(f.begin_streaming(&ctx));
        let a = f.process_streaming_chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Fast \"}}]}\n",
            false,
            &ctx,
        );
        assert!(a.success);
        f.process_streaming_chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"reply\"}}]}\ndata: [DONE]\n",
            true,
            &ctx,
        );
        let end = f.end_streaming(&ctx);
        assert!(end.success);
        assert_eq!(end.processed_content, "Fast reply");
        assert!(f.end_streaming(&ctx).error_code() == Some(codes::STREAMING_ERROR));
    }

    #[test]
    fn test_streaming_overflow_fails_over() {
        let f = CerebrasFormatter::new();
        let ctx = ctx().streaming();
        f.begin_streaming(&ctx);
        assert!(f.process_streaming_chunk("head ", false, &ctx).success);
        let big = "x".repeat(STREAM_BUFFER_LIMIT + 1);
        let result = f.process_streaming_chunk(&big, false, &ctx);
        assert_eq!(result.metadata["fast_failover"], true);
        assert_eq!(result.processed_content.len(), big.len());
        assert_eq!(f.get_metrics()["fast_failovers_triggered"], 1);

        let after = f.process_streaming_chunk("tail", true, &ctx);
        assert_eq!(after.processed_content, "tail");
        assert_eq!(after.metadata["fast_failover"], true);
        assert_eq!(f.get_metrics()["fast_failovers_triggered"], 1);

        let end = f.end_streaming(&ctx);
        assert!(end.success);
        assert!(end.processed_content.is_empty());
        assert!(end.extracted_tool_calls.is_empty());
    }

    #[test]
    fn test_streaming_tool_calls_reported_once() {
        let f = CerebrasFormatter::new();
        let ctx = ctx().with_stream_id("stream_tools");
        assert!(f.begin_streaming(&ctx));
        f.process_streaming_chunk(r#"{"choices":[{"message":{"content":null,"#, false, &ctx);
        let last = f.process_streaming_chunk(
            r#""tool_calls":[{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"Paris\"}"}}]}}]}"#,
            true,
            &ctx,
        );
        assert!(last.success);
        assert!(last.extracted_tool_calls.is_empty());
        assert_eq!(last.metadata["final_chunk"], true);

        let end = f.end_streaming(&ctx);
        assert_eq!(end.extracted_tool_calls.len(), 1);
        assert_eq!(end.extracted_tool_calls[0].name, "get_weather");
    }

    #[test]
    fn test_configure_out_of_range_budget_falls_back() {
        let f = CerebrasFormatter::new();
        assert!(f.configure(&json!({"max_processing_time_ms": 5000})));
        assert_eq!(f.configuration()["max_processing_time_ms"], 50);
    }
}
