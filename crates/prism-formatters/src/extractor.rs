//! Provider-agnostic tool-call extractor.
//!
//! Picks JSON or XML parsing by provider, falls back to recovery regexes
//! when the payload does not parse, and validates every call's name and
//! arguments before it is emitted.

use crate::common::{
    arguments_value, parse_invokes, provider_failure, render_toon, text_kind, StreamSlots,
    INVOKE_PATTERN, PARAMETER_PATTERN,
};
use crate::guard::ContentGuard;
use chrono::Utc;
use parking_lot::RwLock;
use prism_core::metrics::{bump, load};
use prism_core::{
    codes, estimate_tokens, Formatter, LatencyStats, OptionReader, PatternTable,
    ProcessingContext, ProcessingResult, Request, Response, ToolCall, ToolStatus,
};
use prism_toon::ToonCodec;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const NAME: &str = "tool-call-extractor";
const MAX_TOOL_NAME_LEN: usize = 100;

const PATTERNS: &[(&str, &str)] = &[
    ("invoke", INVOKE_PATTERN),
    ("parameter", PARAMETER_PATTERN),
    ("tool_use", r"(?is)<tool_use>(.*?)</tool_use>"),
    ("xml_marker", r"(?i)<(?:function_calls|invoke|tool_use)\b"),
    (
        "recover_named",
        r#"\{\s*"name"\s*:\s*"([^"]+)"\s*,\s*"arguments"\s*:\s*("(?:[^"\\]|\\.)*"|\{[^{}]*\})\s*\}"#,
    ),
    ("recover_invoke", r#"(?i)<invoke[^>]*name\s*=\s*"([^"]+)""#),
    (
        "common_fragment",
        r#"\{\s*"(?:tool|name)"\s*:\s*"[^"]+"[^{}]*(?:\{[^{}]*\}[^{}]*)*\}"#,
    ),
];

/// How a provider's payload is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `tool_calls[]`, `functions[]`, `choices[].message.tool_calls`.
    Json,
    /// `<invoke>` and `<tool_use>` elements.
    Xml,
    /// JSON first, XML when JSON found nothing.
    JsonThenXml,
    /// Loose JSON fragments anywhere in the text.
    Common,
}

impl Strategy {
    /// Strategy used for `provider`.
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "cerebras" | "openai" => Strategy::Json,
            "anthropic" => Strategy::Xml,
            "synthetic" => Strategy::JsonThenXml,
            _ => Strategy::Common,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_content_size() -> usize {
    1024 * 1024
}

fn default_max_tool_calls() -> usize {
    10
}

/// Options recognized by the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Reject threat idioms in the payload and in each call.
    #[serde(default = "default_true")]
    pub enable_security_validation: bool,
    /// Run recovery regexes when the payload does not parse.
    #[serde(default = "default_true")]
    pub enable_error_recovery: bool,
    /// Largest accepted payload in bytes.
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    /// Calls kept per payload.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// Names accepted even when they contain other characters.
    #[serde(default)]
    pub allowed_tool_names: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            enable_security_validation: true,
            enable_error_recovery: true,
            max_content_size: default_max_content_size(),
            max_tool_calls: default_max_tool_calls(),
            allowed_tool_names: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    fn is_valid(&self) -> bool {
        self.max_content_size > 0 && self.max_tool_calls > 0
    }
}

#[derive(Debug, Default)]
struct Stats {
    latency: LatencyStats,
    total_extractions: AtomicU64,
    successful_extractions: AtomicU64,
    tools_extracted: AtomicU64,
    json_parse_failures: AtomicU64,
    xml_parse_failures: AtomicU64,
    security_blocks: AtomicU64,
}

#[derive(Debug, Default)]
struct StreamState {
    provider: String,
    buffer: String,
}

/// Identifier for calls whose source carries none: `tc_` and six digits.
pub fn extractor_call_id() -> String {
    format!("tc_{}", rand::thread_rng().gen_range(100_000..=999_999))
}

/// Extracts tool calls from any provider's payload.
pub struct ToolCallExtractor {
    config: RwLock<ExtractorConfig>,
    patterns: PatternTable,
    guard: ContentGuard,
    codec: ToonCodec,
    stats: Stats,
    stream: StreamSlots<StreamState>,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallExtractor {
    /// Creates an extractor with default options.
    pub fn new() -> Self {
        Self::with_config(ExtractorConfig::default())
    }

    /// Creates an extractor with the given options.
    pub fn with_config(config: ExtractorConfig) -> Self {
        let guard = ContentGuard::with_threats(config.max_content_size);
        Self {
            config: RwLock::new(config),
            patterns: PatternTable::build("extractor", PATTERNS),
            guard,
            codec: ToonCodec::default(),
            stats: Stats::default(),
            stream: StreamSlots::default(),
        }
    }

    /// Whether `name` may be emitted.
    pub fn is_valid_tool_name(&self, name: &str) -> bool {
        if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
            return false;
        }
        let config = self.config.read();
        config.allowed_tool_names.iter().any(|n| n == name)
            || name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    fn accept(&self, call: &ToolCall) -> bool {
        if !self.is_valid_tool_name(&call.name) {
            debug!(tool = %call.name, "Dropping call with invalid name");
            return false;
        }
        if self.config.read().enable_security_validation {
            let screened = format!("{}{}", call.name, call.parameters);
            if let Some(rule) = self.guard.scan(&screened) {
                bump(&self.stats.security_blocks, 1);
                warn!(tool = %call.name, rule, "Dropping call with unsafe arguments");
                return false;
            }
        }
        true
    }

    fn call_from_entry(entry: &Value) -> Option<ToolCall> {
        let (name, args) = if let Some(function) = entry.get("function") {
            (function["name"].as_str()?, &function["arguments"])
        } else if let Some(name) = entry["name"].as_str() {
            let args = entry
                .get("arguments")
                .or_else(|| entry.get("input"))
                .or_else(|| entry.get("parameters"))
                .unwrap_or(&Value::Null);
            (name, args)
        } else {
            (entry["tool"].as_str()?, &entry["args"])
        };
        let (params, _) = arguments_value(args, "raw_arguments");
        let id = entry["id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .map_or_else(extractor_call_id, str::to_string);
        Some(
            ToolCall::new(name, params)
                .with_id(id)
                .with_status(ToolStatus::Pending),
        )
    }

    /// Calls from `tool_calls[]`, `functions[]` and
    /// `choices[].message.tool_calls`. Unparsable payloads go through the
    /// recovery regex when recovery is enabled.
    pub fn extract_json_tool_calls(&self, content: &str) -> Vec<ToolCall> {
        let body = match serde_json::from_str::<Value>(content.trim()) {
            Ok(body) => body,
            Err(e) => {
                bump(&self.stats.json_parse_failures, 1);
                debug!(error = %e, "JSON tool-call payload did not parse");
                return if self.config.read().enable_error_recovery {
                    self.recover_json(content)
                } else {
                    Vec::new()
                };
            }
        };
        let mut entries: Vec<&Value> = Vec::new();
        for key in ["tool_calls", "functions"] {
            if let Some(list) = body[key].as_array() {
                entries.extend(list);
            }
        }
        if let Some(choices) = body["choices"].as_array() {
            for choice in choices {
                if let Some(list) = choice["message"]["tool_calls"].as_array() {
                    entries.extend(list);
                }
            }
        }
        entries
            .into_iter()
            .filter_map(Self::call_from_entry)
            .filter(|call| self.accept(call))
            .collect()
    }

    fn recover_json(&self, content: &str) -> Vec<ToolCall> {
        let Some(re) = self.patterns.get("recover_named") else {
            return Vec::new();
        };
        re.captures_iter(content)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str();
                let raw = caps.get(2)?.as_str();
                let args = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
                let (params, _) = arguments_value(&args, "raw_arguments");
                Some(
                    ToolCall::new(name, params)
                        .with_id(extractor_call_id())
                        .with_status(ToolStatus::Pending),
                )
            })
            .filter(|call| self.accept(call))
            .collect()
    }

    /// Calls from `<invoke>` elements and `<tool_use>` blocks.
    ///
    /// A payload that carries tool markup but yields nothing counts as an
    /// XML failure and goes through recovery when enabled.
    pub fn extract_xml_tool_calls(&self, content: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        if let (Some(invoke), Some(parameter)) =
            (self.patterns.get("invoke"), self.patterns.get("parameter"))
        {
            calls.extend(
                parse_invokes(content, invoke, parameter)
                    .into_iter()
                    .map(|c| c.with_id(extractor_call_id()).with_status(ToolStatus::Pending)),
            );
        }
        if let Some(tool_use) = self.patterns.get("tool_use") {
            for caps in tool_use.captures_iter(content) {
                let body = caps.get(1).map_or("", |m| m.as_str());
                if body.contains("<invoke") {
                    continue;
                }
                match serde_json::from_str::<Value>(body.trim()) {
                    Ok(entry) => calls.extend(Self::call_from_entry(&entry)),
                    Err(_) => debug!("tool_use block is not JSON"),
                }
            }
        }
        let has_markup = self
            .patterns
            .get("xml_marker")
            .is_some_and(|re| re.is_match(content));
        if calls.is_empty() && has_markup {
            bump(&self.stats.xml_parse_failures, 1);
            if self.config.read().enable_error_recovery {
                calls = self.recover_xml(content);
            }
        }
        calls.retain(|call| self.accept(call));
        calls
    }

    fn recover_xml(&self, content: &str) -> Vec<ToolCall> {
        let Some(re) = self.patterns.get("recover_invoke") else {
            return Vec::new();
        };
        re.captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|name| {
                ToolCall::new(name.as_str().trim(), json!({}))
                    .with_id(extractor_call_id())
                    .with_status(ToolStatus::Pending)
            })
            .collect()
    }

    fn extract_common(&self, content: &str) -> Vec<ToolCall> {
        let Some(re) = self.patterns.get("common_fragment") else {
            return Vec::new();
        };
        re.find_iter(content)
            .filter_map(|m| serde_json::from_str::<Value>(m.as_str()).ok())
            .filter_map(|entry| Self::call_from_entry(&entry))
            .filter(|call| self.accept(call))
            .collect()
    }

    /// Extracts, validates and caps the calls in `content`.
    pub fn extract_tool_calls(&self, content: &str, provider: &str) -> Vec<ToolCall> {
        let mut calls = match Strategy::for_provider(provider) {
            Strategy::Json => self.extract_json_tool_calls(content),
            Strategy::Xml => self.extract_xml_tool_calls(content),
            Strategy::JsonThenXml => {
                let calls = self.extract_json_tool_calls(content);
                if calls.is_empty() {
                    self.extract_xml_tool_calls(content)
                } else {
                    calls
                }
            }
            Strategy::Common => Vec::new(),
        };
        if calls.is_empty() {
            calls = self.extract_common(content);
        }
        let max = self.config.read().max_tool_calls;
        if calls.len() > max {
            warn!(found = calls.len(), max, "Dropping tool calls over the limit");
            calls.truncate(max);
        }
        calls
    }

    fn screen(&self, content: &str) -> Result<(), ProcessingResult> {
        let config = self.config.read();
        if content.len() > config.max_content_size {
            return Err(ProcessingResult::failure(
                format!(
                    "Content size {} exceeds maximum {} bytes",
                    content.len(),
                    config.max_content_size
                ),
                codes::INPUT_TOO_LARGE,
            ));
        }
        if config.enable_security_validation {
            if let Some(rule) = self.guard.scan(content) {
                return Err(ProcessingResult::failure(
                    format!("Content contains malicious patterns ({rule})"),
                    codes::SECURITY_VIOLATION,
                ));
            }
        }
        Ok(())
    }
}

impl Formatter for ToolCallExtractor {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "Tool-call extraction from JSON, XML and free text with recovery"
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["text", "json", "xml", "mixed"]
    }

    fn output_formats(&self) -> &[&'static str] {
        &["toon", "json"]
    }

    fn supported_providers(&self) -> &[&'static str] {
        &["cerebras", "openai", "anthropic", "synthetic"]
    }

    fn capabilities(&self) -> &[&'static str] {
        &[
            "tool-extraction",
            "security-validation",
            "json-parsing",
            "xml-parsing",
            "error-recovery",
            "provider-specific",
        ]
    }

    fn preprocess_request(&self, request: &Request) -> ProcessingResult {
        let mut result = ProcessingResult::success(request.data.to_string(), "json");
        result.tokens_processed = estimate_tokens(&result.processed_content);
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
        bump(&self.stats.total_extractions, 1);
        if let Err(failure) = self.screen(&response.data) {
            bump(&self.stats.security_blocks, 1);
            self.stats.latency.record(started.elapsed());
            return failure.with_processing_time(started.elapsed());
        }

        let calls = self.extract_tool_calls(&response.data, &context.provider_name);
        bump(&self.stats.successful_extractions, 1);
        bump(&self.stats.tools_extracted, calls.len() as u64);
        self.stats.latency.record(started.elapsed());
        debug!(
            provider = %context.provider_name,
            tools = calls.len(),
            "Tool-call extraction completed"
        );

        let kind = if serde_json::from_str::<Value>(&response.data).is_ok() {
            "json"
        } else {
            text_kind(&response.data)
        };
        let mut working = ProcessingResult::success(response.data.clone(), kind)
            .with_metadata("tool_calls_extracted", json!(calls.len()))
            .with_metadata("provider", json!(context.provider_name));
        working.extracted_tool_calls = calls;
        render_toon(&self.codec, working, context, started)
    }

    fn begin_streaming(&self, context: &ProcessingContext) -> bool {
        self.stream.begin(
            context,
            StreamState {
                provider: context.provider_name.clone(),
                buffer: String::new(),
            },
        );
        true
    }

    fn process_streaming_chunk(
        &self,
        chunk: &str,
        _is_final: bool,
        context: &ProcessingContext,
    ) -> ProcessingResult {
        let Some(slot) = self.stream.get(context) else {
            return ProcessingResult::failure("Streaming not initialized", codes::STREAMING_ERROR);
        };
        slot.lock().buffer.push_str(chunk);
        ProcessingResult::passthrough(chunk)
    }

    fn end_streaming(&self, context: &ProcessingContext) -> ProcessingResult {
        let Some(state) = self.stream.finish(context) else {
            return ProcessingResult::failure("Streaming not active", codes::STREAMING_ERROR);
        };
        let started = Instant::now();
        bump(&self.stats.total_extractions, 1);
        if let Err(failure) = self.screen(&state.buffer) {
            bump(&self.stats.security_blocks, 1);
            return failure;
        }
        let calls = self.extract_tool_calls(&state.buffer, &state.provider);
        bump(&self.stats.successful_extractions, 1);
        bump(&self.stats.tools_extracted, calls.len() as u64);
        self.stats.latency.record(started.elapsed());

        // Empty content keeps the accumulated stream text.
        let mut result = ProcessingResult::success(String::new(), "text")
            .with_metadata("tool_calls_extracted", json!(calls.len()))
            .with_processing_time(started.elapsed());
        result.extracted_tool_calls = calls;
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
        reader.bool(
            "enable_security_validation",
            &mut next.enable_security_validation,
        );
        reader.bool("enable_error_recovery", &mut next.enable_error_recovery);
        reader.usize_min("max_content_size", 1, &mut next.max_content_size);
        reader.usize_min("max_tool_calls", 1, &mut next.max_tool_calls);
        reader.strings("allowed_tool_names", &mut next.allowed_tool_names);
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
        let s = &self.stats;
        json!({
            "total_extractions": load(&s.total_extractions),
            "successful_extractions": load(&s.successful_extractions),
            "tools_extracted": load(&s.tools_extracted),
            "json_parse_failures": load(&s.json_parse_failures),
            "xml_parse_failures": load(&s.xml_parse_failures),
            "security_blocks": load(&s.security_blocks),
            "average_time_us": s.latency.average_us(),
            "max_time_us": s.latency.max_us(),
        })
    }

    fn reset_metrics(&self) {
        let s = &self.stats;
        s.latency.reset();
        for counter in [
            &s.total_extractions,
            &s.successful_extractions,
            &s.tools_extracted,
            &s.json_parse_failures,
            &s.xml_parse_failures,
            &s.security_blocks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn health_check(&self) -> Value {
        let valid = self.validate_configuration();
        json!({
            "status": if valid { "healthy" } else { "unhealthy" },
            "timestamp": Utc::now().timestamp(),
            "valid_configuration": valid,
            "streaming_active": self.stream.active() > 0,
            "stats": self.get_metrics(),
        })
    }

    fn get_diagnostics(&self) -> Value {
        json!({
            "name": NAME,
            "version": self.version(),
            "status": "active",
            "config": self.configuration(),
            "stats": self.get_metrics(),
            "patterns": self.patterns.iter().map(|p| p.name).collect::<Vec<_>>(),
            "active_streams": self.stream.active(),
        })
    }
}
