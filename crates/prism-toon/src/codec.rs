use crate::document::{SectionInfo, ToonAnalysis, ToonContent, ToonDocument};
use crate::error::ToonError;
use crate::escape::{escape, escape_value, unescape, unescape_value};
use crate::section::{check_sections, split_sections, strip_separator, Section};
use chrono::{DateTime, SecondsFormat, Utc};
use prism_core::{ProcessingContext, ProcessingResult, Response, ToolCall, ToolStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::time::Instant;
use tracing::debug;

/// Codec options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToonConfig {
    /// Emit the META section.
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    /// Emit the TOOLS section.
    #[serde(default = "default_true")]
    pub include_tools: bool,
    /// Emit the THINKING section.
    #[serde(default = "default_true")]
    pub include_thinking: bool,
    /// Emit timestamps in META and per tool call.
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,
    /// Largest CONTENT payload accepted for encoding, in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    /// Escaped payloads at or above this size use a sized raw block.
    #[serde(default = "default_inline_content_threshold")]
    pub inline_content_threshold: usize,
    /// Spaces per level in [`ToonCodec::json_to_toon`].
    #[serde(default = "default_indent")]
    pub indent: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_content_length() -> usize {
    1_000_000
}

fn default_inline_content_threshold() -> usize {
    1000
}

fn default_indent() -> usize {
    2
}

impl Default for ToonConfig {
    fn default() -> Self {
        Self {
            include_metadata: true,
            include_tools: true,
            include_thinking: true,
            preserve_timestamps: true,
            max_content_length: default_max_content_length(),
            inline_content_threshold: default_inline_content_threshold(),
            indent: default_indent(),
        }
    }
}

const META_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Encoder/decoder for the tagged-section wire format.
///
/// ```text
/// # META
/// provider: anthropic
///
/// # CONTENT
/// [TYPE: text]
/// [FORMAT: complete]
/// [CONTENT: Hello]
///
/// # TOOLS
/// [CALL: search]
/// [ID: call_1]
/// [PARAM: {"q":"rust"}]
/// [STATUS: completed]
///
/// # THINKING
/// [REASONING: look it up first]
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToonCodec {
    config: ToonConfig,
}

impl ToonCodec {
    /// Creates a codec with the given options.
    pub fn new(config: ToonConfig) -> Self {
        Self { config }
    }

    /// Active options.
    pub fn config(&self) -> &ToonConfig {
        &self.config
    }

    // --- Encoding ---

    /// Encodes a document. Sections are emitted in the fixed order
    /// META, CONTENT, TOOLS, THINKING.
    pub fn encode(&self, doc: &ToonDocument) -> Result<String, ToonError> {
        let size = doc.content.content.len();
        if size > self.config.max_content_length {
            return Err(ToonError::ContentTooLarge {
                size,
                max: self.config.max_content_length,
            });
        }

        let mut out = String::with_capacity(size + 256);
        if self.config.include_metadata && !doc.metadata.is_empty() {
            self.write_meta(&mut out, &doc.metadata);
        }
        self.write_content(&mut out, &doc.content);
        if self.config.include_tools && !doc.tools.is_empty() {
            self.write_tools(&mut out, &doc.tools);
        }
        if self.config.include_thinking {
            if let Some(thinking) = doc.thinking.as_deref().filter(|t| !t.is_empty()) {
                self.write_thinking(&mut out, thinking);
            }
        }
        Ok(out)
    }

    /// Encodes a provider response with extracted tool calls and reasoning.
    pub fn serialize_response(
        &self,
        response: &Response,
        context: &ProcessingContext,
        tools: &[ToolCall],
        thinking: Option<&str>,
    ) -> Result<String, ToonError> {
        let content = if response.success || !response.data.is_empty() {
            response.data.clone()
        } else {
            response.error_message.clone()
        };
        let provider = if context.provider_name.is_empty() {
            response.provider_name.as_str()
        } else {
            context.provider_name.as_str()
        };

        let mut doc = ToonDocument::new(ToonContent {
            content_type: content_type_for(&context.original_format).to_string(),
            format: Some(format_for(response.success).to_string()),
            content,
        })
        .meta("provider", provider)
        .meta("model", context.model_name.as_str())
        .meta("original_format", context.original_format.as_str())
        .meta("response_time_ms", response.response_time_ms.to_string())
        .meta("success", response.success.to_string())
        .meta("status_code", response.status_code.to_string())
        .meta("streaming_mode", context.streaming_mode.to_string());
        if self.config.preserve_timestamps {
            doc = doc.meta("timestamp", meta_timestamp(Utc::now()));
        }
        doc.tools = tools.to_vec();
        doc.thinking = thinking.map(str::to_string);
        self.encode(&doc)
    }

    /// Encodes a formatter's working result.
    ///
    /// The content type follows `result.output_format` when it names a
    /// payload type, otherwise the context's original format. Result
    /// metadata is copied into META.
    pub fn serialize_result(
        &self,
        result: &ProcessingResult,
        context: &ProcessingContext,
    ) -> Result<String, ToonError> {
        let content_type = match result.output_format.as_str() {
            t @ ("json" | "markdown" | "text") => t,
            _ => content_type_for(&context.original_format),
        };
        let mut doc = ToonDocument::new(ToonContent {
            content_type: content_type.to_string(),
            format: Some(format_for(result.success).to_string()),
            content: result.processed_content.clone(),
        })
        .meta("provider", context.provider_name.as_str())
        .meta("model", context.model_name.as_str())
        .meta("original_format", context.original_format.as_str())
        .meta("success", result.success.to_string())
        .meta("streaming_mode", context.streaming_mode.to_string());
        if self.config.preserve_timestamps {
            doc = doc.meta("timestamp", meta_timestamp(Utc::now()));
        }
        if let Some(error) = &result.error_message {
            doc = doc.meta("error", error.as_str());
        }
        for (key, value) in &result.metadata {
            doc.metadata.insert(key.clone(), meta_value(value));
        }
        doc.tools = result.extracted_tool_calls.clone();
        doc.thinking = result.reasoning.clone();
        self.encode(&doc)
    }

    /// Encodes arbitrary JSON as a `json` CONTENT payload with the given
    /// metadata.
    pub fn serialize_data(
        &self,
        data: &serde_json::Value,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, ToonError> {
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| ToonError::Malformed(format!("unserializable data: {e}")))?;
        let mut doc = ToonDocument::new(ToonContent {
            content_type: "json".to_string(),
            format: Some("complete".to_string()),
            content,
        });
        doc.metadata = metadata.clone();
        self.encode(&doc)
    }

    /// Renders JSON as an indented `key: value` listing.
    ///
    /// Arrays use `[i]: value`; nested values are written inline as JSON.
    pub fn json_to_toon(&self, value: &serde_json::Value, level: usize) -> String {
        let pad = " ".repeat(level * self.config.indent);
        let mut out = String::new();
        match value {
            serde_json::Value::Object(map) => {
                for (key, v) in map {
                    let _ = writeln!(out, "{pad}{key}: {}", meta_value(v));
                }
            }
            serde_json::Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    let _ = writeln!(out, "{pad}[{i}]: {}", meta_value(v));
                }
            }
            other => {
                let _ = writeln!(out, "{}", meta_value(other));
            }
        }
        out
    }

    fn write_meta(&self, out: &mut String, metadata: &BTreeMap<String, String>) {
        out.push_str("# META\n");
        for (key, value) in metadata {
            let line = format!("{}: {}", escape_value(key), escape_value(value));
            out.push_str(&escape(&line));
            out.push('\n');
        }
        out.push('\n');
    }

    fn write_content(&self, out: &mut String, content: &ToonContent) {
        out.push_str("# CONTENT\n");
        let _ = writeln!(out, "[TYPE: {}]", escape_value(&content.content_type));
        if let Some(format) = &content.format {
            let _ = writeln!(out, "[FORMAT: {}]", escape_value(format));
        }
        let escaped = escape(&content.content);
        if escaped.contains(['\n', '\r']) || escaped.len() >= self.config.inline_content_threshold
        {
            let _ = writeln!(out, "[CONTENT_SIZE: {} bytes]", escaped.len());
            out.push_str(&escaped);
            out.push('\n');
        } else {
            let _ = writeln!(out, "[CONTENT: {escaped}]");
        }
        out.push('\n');
    }

    fn write_tools(&self, out: &mut String, tools: &[ToolCall]) {
        out.push_str("# TOOLS\n");
        for call in tools {
            let _ = writeln!(out, "[CALL: {}]", escape_value(&call.name));
            let _ = writeln!(out, "[ID: {}]", escape_value(&call.id));
            let _ = writeln!(out, "[PARAM: {}]", call.parameters);
            let _ = writeln!(out, "[STATUS: {}]", call.status);
            if let Some(result) = &call.result {
                let _ = writeln!(out, "[RESULT: {result}]");
            }
            if self.config.preserve_timestamps {
                let _ = writeln!(
                    out,
                    "[TIME: {}]",
                    call.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
                );
            }
            out.push('\n');
        }
    }

    fn write_thinking(&self, out: &mut String, thinking: &str) {
        out.push_str("# THINKING\n");
        let _ = writeln!(out, "[REASONING: {}]", escape(thinking));
        out.push('\n');
    }

    // --- Decoding ---

    /// Checks section structure without decoding bodies.
    pub fn validate(&self, text: &str) -> Result<(), ToonError> {
        check_sections(&split_sections(text))
    }

    /// Decodes a document.
    pub fn decode(&self, text: &str) -> Result<ToonDocument, ToonError> {
        let started = Instant::now();
        let sections = split_sections(text);
        check_sections(&sections)?;

        let mut doc = ToonDocument::default();
        let mut seen = HashSet::new();
        for raw in &sections {
            let section = Section::from_name(raw.name)
                .ok_or_else(|| ToonError::InvalidSection(raw.name.to_string()))?;
            if !seen.insert(section) {
                return Err(ToonError::Malformed(format!("duplicate section: {section}")));
            }
            match section {
                Section::Meta => doc.metadata = parse_meta(raw.body),
                Section::Content => doc.content = parse_content(raw.body)?,
                Section::Tools => doc.tools = parse_tools(raw.body),
                Section::Thinking => doc.thinking = parse_thinking(raw.body),
            }
        }
        doc.parse_time = started.elapsed();
        debug!(
            sections = sections.len(),
            tools = doc.tools.len(),
            bytes = text.len(),
            "Decoded TOON document"
        );
        Ok(doc)
    }

    /// Body of the first section named `section`, without the trailing
    /// separator line.
    pub fn extract_section(&self, text: &str, section: Section) -> Option<String> {
        split_sections(text)
            .into_iter()
            .find(|raw| raw.name == section.as_str())
            .map(|raw| strip_separator(raw.body).to_string())
    }

    /// Size report for a document. Works on invalid documents too.
    pub fn analyze(&self, text: &str) -> ToonAnalysis {
        let sections: Vec<SectionInfo> = split_sections(text)
            .into_iter()
            .map(|raw| SectionInfo {
                name: raw.name.to_string(),
                size_bytes: raw.body.len(),
                line_count: raw.body.lines().count(),
            })
            .collect();
        ToonAnalysis {
            total_size_bytes: text.len(),
            line_count: text.lines().count(),
            section_count: sections.len(),
            sections,
        }
    }
}

/// Maps an original payload format onto a CONTENT type.
pub fn content_type_for(original_format: &str) -> &'static str {
    match original_format.to_ascii_lowercase().as_str() {
        "json" => "json",
        "markdown" | "md" => "markdown",
        _ => "text",
    }
}

fn format_for(success: bool) -> &'static str {
    if success {
        "complete"
    } else {
        "error"
    }
}

fn meta_timestamp(at: DateTime<Utc>) -> String {
    at.format(META_TIMESTAMP_FORMAT).to_string()
}

/// Strings as-is; everything else JSON-encoded.
fn meta_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `[KEY: value]` on one line.
fn tag<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix('[')?
        .strip_suffix(']')?
        .strip_prefix(key)?
        .strip_prefix(": ")
}

fn parse_meta(body: &str) -> BTreeMap<String, String> {
    body.lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let line = unescape(line);
            let (key, value) = line
                .split_once(": ")
                .or_else(|| line.split_once(':'))?;
            Some((unescape_value(key.trim()), unescape_value(value)))
        })
        .collect()
}

fn parse_content(body: &str) -> Result<ToonContent, ToonError> {
    let mut content = ToonContent::default();
    let mut rest = body;
    while !rest.is_empty() {
        let (line, after) = match rest.find('\n') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        rest = after;

        if let Some(v) = tag(line, "TYPE") {
            content.content_type = unescape_value(v);
        } else if let Some(v) = tag(line, "FORMAT") {
            content.format = Some(unescape_value(v));
        } else if let Some(v) = tag(line, "CONTENT") {
            content.content = unescape(v);
        } else if let Some(v) = tag(line, "CONTENT_SIZE") {
            let size: usize = v
                .strip_suffix(" bytes")
                .unwrap_or(v)
                .trim()
                .parse()
                .map_err(|_| ToonError::Malformed(format!("invalid CONTENT_SIZE marker: {v}")))?;
            let block = after.get(..size).ok_or_else(|| {
                ToonError::Malformed(format!(
                    "content block shorter than declared CONTENT_SIZE {size}"
                ))
            })?;
            content.content = unescape(block);
            rest = &after[size..];
            rest = rest.strip_prefix('\n').unwrap_or(rest);
        }
    }
    Ok(content)
}

#[derive(Default)]
struct ToolRecord {
    name: String,
    id: Option<String>,
    parameters: Option<serde_json::Value>,
    status: ToolStatus,
    result: Option<serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
}

impl ToolRecord {
    fn finish(self) -> ToolCall {
        let mut call = ToolCall::new(
            self.name,
            self.parameters.unwrap_or_else(|| serde_json::json!({})),
        )
            .with_status(self.status)
            .with_id(self.id.unwrap_or_default());
        call.result = self.result;
        if let Some(ts) = self.timestamp {
            call.timestamp = ts;
        }
        call
    }
}

fn parse_json_or_raw(raw: &str, raw_key: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ raw_key: raw }))
}

fn parse_tools(body: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut current: Option<ToolRecord> = None;
    for line in body.lines() {
        if let Some(name) = tag(line, "CALL") {
            if let Some(done) = current.take() {
                calls.push(done.finish());
            }
            current = Some(ToolRecord {
                name: unescape_value(name),
                ..Default::default()
            });
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        if let Some(v) = tag(line, "ID") {
            record.id = Some(unescape_value(v));
        } else if let Some(v) = tag(line, "PARAM") {
            record.parameters = Some(parse_json_or_raw(v, "parameters_raw"));
        } else if let Some(v) = tag(line, "STATUS") {
            record.status = ToolStatus::parse(v);
        } else if let Some(v) = tag(line, "RESULT") {
            record.result = Some(parse_json_or_raw(v, "result_raw"));
        } else if let Some(v) = tag(line, "TIME") {
            record.timestamp = DateTime::parse_from_rfc3339(v)
                .ok()
                .map(|t| t.with_timezone(&Utc));
        }
    }
    if let Some(done) = current {
        calls.push(done.finish());
    }
    calls
}

fn parse_thinking(body: &str) -> Option<String> {
    let body = strip_separator(body);
    let exact = body
        .strip_suffix("]\n")
        .and_then(|b| b.strip_prefix("[REASONING: "));
    let inner = match exact {
        Some(inner) => inner.to_string(),
        None => {
            let trimmed = body.trim_end();
            match trimmed
                .strip_prefix("[REASONING: ")
                .and_then(|b| b.strip_suffix(']'))
            {
                Some(inner) => inner.to_string(),
                None => trimmed.to_string(),
            }
        }
    };
    if inner.is_empty() {
        None
    } else {
        Some(unescape(&inner))
    }
}
