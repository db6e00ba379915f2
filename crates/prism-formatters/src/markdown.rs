//! Provider-aware Markdown normalizer.
//!
//! Runs a provider rewrite table, then the common fixes: fence languages,
//! whitespace, list markers and heading spacing. Text inside fenced code
//! blocks is never touched by the whitespace, list or heading passes.

use crate::common::{map_outside_code, provider_failure, render_toon, StreamSlots};
use chrono::Utc;
use parking_lot::RwLock;
use prism_core::metrics::{bump, load};
use prism_core::{
    codes, estimate_tokens, Formatter, LatencyStats, OptionReader, PatternTable,
    ProcessingContext, ProcessingResult, Request, Response,
};
use prism_toon::ToonCodec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const NAME: &str = "markdown-normalizer";

const COMMON_PATTERNS: &[(&str, &str)] = &[
    ("code_block", r"(?s)```.*?```"),
    ("blank_runs", r"\n{3,}"),
    ("trailing_space", r"(?m)[ \t]+$"),
    ("list_marker", r"(?m)^([ \t]*)[*+][ \t]+"),
    ("heading", r"(?m)^(#{1,6})[ \t]*([^#\s].*)$"),
];

const INJECTION_PATTERNS: &[(&str, &str)] = &[
    ("script_block", r"(?is)<script[^>]*>.*?</script>"),
    ("javascript_uri", r"(?i)javascript\s*:"),
    ("eval_call", r"(?i)eval\s*\("),
    ("document_access", r"(?i)document\s*\."),
    ("window_access", r"(?i)window\s*\."),
];

/// Rewrites applied before the common fixes, per provider.
const PROVIDER_REWRITES: &[(&str, &[(&str, &str)])] = &[
    (
        "anthropic",
        &[
            ("thinking_wrapper", r"(?is)<thinking>\s*(.*?)\s*</thinking>"),
            ("reflection_wrapper", r"(?is)<reflection>\s*(.*?)\s*</reflection>"),
        ],
    ),
    (
        "cerebras",
        &[("stream_done", r"(?m)^[ \t]*(?:data:[ \t]*)?\[DONE\][ \t]*$")],
    ),
    ("openai", &[("paren_steps", r"(?m)^([ \t]*)(\d+)\)[ \t]+")]),
    ("synthetic", &[("arrow_steps", r"(?m)^([ \t]*)(?:=>|→)[ \t]*")]),
];

fn replacement(rule: &str) -> &'static str {
    match rule {
        "thinking_wrapper" | "reflection_wrapper" => "$1",
        "paren_steps" => "$1$2. ",
        "arrow_steps" => "$1- ",
        _ => "",
    }
}

fn default_languages() -> Vec<String> {
    [
        "text", "rust", "python", "javascript", "typescript", "json", "bash", "shell", "sh", "c",
        "cpp", "go", "java", "yaml", "toml", "sql", "html", "css", "markdown",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_max_content_size() -> usize {
    1024 * 1024
}

fn default_max_line_length() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

/// Options recognized by the Markdown normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownConfig {
    /// Tag untagged fences and map unknown languages to `text`.
    #[serde(default = "default_true")]
    pub enable_code_block_fixing: bool,
    /// Trim trailing spaces and collapse blank-line runs.
    #[serde(default = "default_true")]
    pub enable_whitespace_cleanup: bool,
    /// Rewrite `*` and `+` bullets to `-`.
    #[serde(default = "default_true")]
    pub enable_list_normalization: bool,
    /// One space after ATX heading hashes.
    #[serde(default = "default_true")]
    pub enable_heading_normalization: bool,
    /// Reject script and DOM-access idioms.
    #[serde(default = "default_true")]
    pub enable_security_validation: bool,
    /// Largest accepted input in bytes.
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    /// Longest accepted line in bytes.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Fence languages kept as written.
    #[serde(default = "default_languages")]
    pub allowed_languages: Vec<String>,
}

impl Default for MarkdownConfig {
    fn default() -> Self {
        Self {
            enable_code_block_fixing: true,
            enable_whitespace_cleanup: true,
            enable_list_normalization: true,
            enable_heading_normalization: true,
            enable_security_validation: true,
            max_content_size: default_max_content_size(),
            max_line_length: default_max_line_length(),
            allowed_languages: default_languages(),
        }
    }
}

impl MarkdownConfig {
    fn is_valid(&self) -> bool {
        self.max_content_size > 0 && self.max_line_length > 0 && !self.allowed_languages.is_empty()
    }
}

#[derive(Debug, Default)]
struct Stats {
    latency: LatencyStats,
    total_normalizations: AtomicU64,
    successful_normalizations: AtomicU64,
    security_blocks: AtomicU64,
    code_blocks_fixed: AtomicU64,
    whitespace_cleaned: AtomicU64,
}

#[derive(Debug, Default)]
struct StreamState {
    provider: String,
    buffer: String,
}

/// Normalizes Markdown produced by any provider.
pub struct MarkdownNormalizer {
    config: RwLock<MarkdownConfig>,
    common: PatternTable,
    injection: PatternTable,
    providers: HashMap<&'static str, PatternTable>,
    codec: ToonCodec,
    stats: Stats,
    stream: StreamSlots<StreamState>,
}

impl Default for MarkdownNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownNormalizer {
    /// Creates a normalizer with default options.
    pub fn new() -> Self {
        Self::with_config(MarkdownConfig::default())
    }

    /// Creates a normalizer with the given options.
    pub fn with_config(config: MarkdownConfig) -> Self {
        let providers = PROVIDER_REWRITES
            .iter()
            .map(|(provider, rules)| (*provider, PatternTable::build(*provider, rules)))
            .collect();
        Self {
            config: RwLock::new(config),
            common: PatternTable::build("markdown", COMMON_PATTERNS),
            injection: PatternTable::build("markdown-injection", INJECTION_PATTERNS),
            providers,
            codec: ToonCodec::default(),
            stats: Stats::default(),
            stream: StreamSlots::default(),
        }
    }

    /// Checks size, line length and, when enabled, injection idioms.
    pub fn validate_content(&self, content: &str) -> Result<(), ProcessingResult> {
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
        if let Some(line) = content.lines().position(|l| l.len() > config.max_line_length) {
            return Err(ProcessingResult::failure(
                format!(
                    "Line {} exceeds maximum length {}",
                    line + 1,
                    config.max_line_length
                ),
                codes::VALIDATION_ERROR,
            ));
        }
        if config.enable_security_validation {
            if let Some(rule) = self.injection.iter().find(|p| p.regex.is_match(content)) {
                return Err(ProcessingResult::failure(
                    format!("Content failed security validation ({})", rule.name),
                    codes::SECURITY_VIOLATION,
                ));
            }
        }
        Ok(())
    }

    /// Normalizes `content` with the rules for `provider`.
    ///
    /// Unknown providers use only the common fixes.
    pub fn normalize(&self, content: &str, provider: &str) -> String {
        let config = self.config.read().clone();
        let mut text = content.replace("\r\n", "\n");

        if let Some(table) = self.providers.get(provider) {
            for rule in table.iter() {
                text = rule
                    .regex
                    .replace_all(&text, replacement(rule.name))
                    .into_owned();
            }
        }

        if config.enable_code_block_fixing {
            let (fixed, count) = self.fix_fences(&text, &config, provider == "cerebras");
            if count > 0 {
                bump(&self.stats.code_blocks_fixed, count);
            }
            text = fixed;
        }

        let code = self.common.get("code_block");
        text = map_outside_code(&text, code, |segment| self.tidy(segment, &config));
        if config.enable_whitespace_cleanup {
            bump(&self.stats.whitespace_cleaned, 1);
        }
        text
    }

    fn fix_fences(&self, text: &str, config: &MarkdownConfig, close_open: bool) -> (String, u64) {
        let mut lines = Vec::new();
        let mut open = false;
        let mut fixed = 0;
        for line in text.split('\n') {
            let trimmed = line.trim_start();
            let Some(rest) = trimmed.strip_prefix("```") else {
                lines.push(line.to_string());
                continue;
            };
            if open {
                lines.push(line.to_string());
                open = false;
                continue;
            }
            open = true;
            let indent = &line[..line.len() - trimmed.len()];
            let language = rest.trim();
            if language.is_empty() {
                lines.push(format!("{indent}```text"));
                fixed += 1;
            } else if !config
                .allowed_languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(language))
            {
                debug!(language, "Mapping unlisted fence language to text");
                lines.push(format!("{indent}```text"));
                fixed += 1;
            } else {
                lines.push(line.to_string());
            }
        }
        if open && close_open {
            lines.push("```".to_string());
            fixed += 1;
        }
        (lines.join("\n"), fixed)
    }

    fn tidy(&self, segment: &str, config: &MarkdownConfig) -> String {
        let mut text = segment.to_string();
        let mut apply = |name: &str, with: &str| {
            if let Some(re) = self.common.get(name) {
                text = re.replace_all(&text, with).into_owned();
            }
        };
        if config.enable_whitespace_cleanup {
            apply("trailing_space", "");
            apply("blank_runs", "\n\n");
        }
        if config.enable_list_normalization {
            apply("list_marker", "${1}- ");
        }
        if config.enable_heading_normalization {
            apply("heading", "$1 $2");
        }
        text
    }

    fn run(&self, content: &str, provider: &str, started: Instant) -> Result<String, ProcessingResult> {
        bump(&self.stats.total_normalizations, 1);
        if let Err(failure) = self.validate_content(content) {
            bump(&self.stats.security_blocks, 1);
            self.stats.latency.record(started.elapsed());
            warn!(
                provider,
                reason = failure.error_message.as_deref().unwrap_or_default(),
                "Markdown rejected"
            );
            return Err(failure.with_processing_time(started.elapsed()));
        }
        let normalized = self.normalize(content, provider);
        bump(&self.stats.successful_normalizations, 1);
        self.stats.latency.record(started.elapsed());
        Ok(normalized)
    }
}

impl Formatter for MarkdownNormalizer {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "Provider-specific Markdown normalization with injection screening"
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["markdown", "text", "mixed"]
    }

    fn output_formats(&self) -> &[&'static str] {
        &["markdown", "toon"]
    }

    fn supported_providers(&self) -> &[&'static str] {
        &["cerebras", "openai", "anthropic", "synthetic"]
    }

    fn capabilities(&self) -> &[&'static str] {
        &[
            "normalization",
            "security-validation",
            "code-block-fixing",
            "whitespace-cleanup",
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
        let fixed_before = load(&self.stats.code_blocks_fixed);
        let normalized = match self.run(&response.data, &context.provider_name, started) {
            Ok(text) => text,
            Err(failure) => return failure,
        };
        let working = ProcessingResult::success(normalized, "markdown")
            .with_metadata("normalization_applied", json!(true))
            .with_metadata("provider", json!(context.provider_name))
            .with_metadata(
                "code_blocks_fixed",
                json!(load(&self.stats.code_blocks_fixed).saturating_sub(fixed_before)),
            );
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
        debug!(
            provider = %context.provider_name,
            stream_id = context.stream_key(),
            "Markdown streaming started"
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
        match self.run(&state.buffer, &state.provider, started) {
            Ok(text) => {
                let mut result = ProcessingResult::success(text, "markdown")
                    .with_metadata("streaming_completed", json!(true))
                    .with_processing_time(started.elapsed());
                result.tokens_processed = estimate_tokens(&result.processed_content);
                result.streaming_mode = true;
                result
            }
            Err(failure) => failure,
        }
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
        reader.bool("enable_code_block_fixing", &mut next.enable_code_block_fixing);
        reader.bool("enable_whitespace_cleanup", &mut next.enable_whitespace_cleanup);
        reader.bool("enable_list_normalization", &mut next.enable_list_normalization);
        reader.bool(
            "enable_heading_normalization",
            &mut next.enable_heading_normalization,
        );
        reader.bool(
            "enable_security_validation",
            &mut next.enable_security_validation,
        );
        reader.usize_min("max_content_size", 1, &mut next.max_content_size);
        reader.usize_min("max_line_length", 1, &mut next.max_line_length);
        reader.strings("allowed_languages", &mut next.allowed_languages);
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
            "total_normalizations": load(&s.total_normalizations),
            "successful_normalizations": load(&s.successful_normalizations),
            "security_blocks": load(&s.security_blocks),
            "code_blocks_fixed": load(&s.code_blocks_fixed),
            "whitespace_cleaned": load(&s.whitespace_cleaned),
            "average_time_us": s.latency.average_us(),
            "max_time_us": s.latency.max_us(),
        })
    }

    fn reset_metrics(&self) {
        let s = &self.stats;
        s.latency.reset();
        for counter in [
            &s.total_normalizations,
            &s.successful_normalizations,
            &s.security_blocks,
            &s.code_blocks_fixed,
            &s.whitespace_cleaned,
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
        let mut providers: Vec<&str> = self.providers.keys().copied().collect();
        providers.sort_unstable();
        json!({
            "name": NAME,
            "version": self.version(),
            "status": "active",
            "config": self.configuration(),
            "stats": self.get_metrics(),
            "provider_tables": providers,
            "active_streams": self.stream.active(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_fence_gets_text_language() {
        let n = MarkdownNormalizer::new();
        let out = n.normalize("Intro\n```\nlet x = 1;\n```\n", "openai");
        assert_eq!(out, "Intro\n```text\nlet x = 1;\n```\n");
        assert_eq!(n.get_metrics()["code_blocks_fixed"], 1);
    }

    #[test]
    fn test_tagged_fence_kept_and_closing_fence_untouched() {
        let n = MarkdownNormalizer::new();
        let input = "```rust\nfn main() {}\n```";
        assert_eq!(n.normalize(input, "openai"), input);
    }

    #[test]
    fn test_unlisted_language_mapped_to_text() {
        let n = MarkdownNormalizer::new();
        assert_eq!(n.normalize("```brainfuck\n+++\n```", ""), "```text\n+++\n```");
    }

    #[test]
    fn test_whitespace_lists_and_headings() {
        let n = MarkdownNormalizer::new();
        let out = n.normalize("##Title   \n\n\n\n* one\n+ two\n  * nested", "");
        assert_eq!(out, "## Title\n\n- one\n- two\n  - nested");
    }

    #[test]
    fn test_code_blocks_not_tidied() {
        let n = MarkdownNormalizer::new();
        let input = "```python\n* not a list   \n\n\n\nx = 1\n```";
        assert_eq!(n.normalize(input, "openai"), input);
    }

    #[test]
    fn test_cerebras_closes_unterminated_fence() {
        let n = MarkdownNormalizer::new();
        assert_eq!(
            n.normalize("Answer:\n```json\n{\"a\": 1}", "cerebras"),
            "Answer:\n```json\n{\"a\": 1}\n```"
        );
        assert_eq!(
            n.normalize("Answer:\n```json\n{\"a\": 1}", "openai"),
            "Answer:\n```json\n{\"a\": 1}"
        );
    }

    #[test]
    fn test_anthropic_thinking_wrapper_stripped() {
        let n = MarkdownNormalizer::new();
        let out = n.normalize("<thinking>\nconsider it\n</thinking>\nDone.", "anthropic");
        assert_eq!(out, "consider it\nDone.");
    }

    #[test]
    fn test_injection_rejected() {
        let n = MarkdownNormalizer::new();
        let ctx = ProcessingContext::new("openai", "gpt-4o").with_format("markdown");
        let result = n.postprocess_response(
            &Response::ok("openai", "click [here](javascript:alert(1))"),
            &ctx,
        );
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(codes::SECURITY_VIOLATION));
        assert_eq!(n.get_metrics()["security_blocks"], 1);
    }

    #[test]
    fn test_limits_checked_first() {
        let n = MarkdownNormalizer::new();
        assert!(n.configure(&json!({"max_line_length": 5})));
        let err = n.validate_content("short\nmuch too long").unwrap_err();
        assert_eq!(err.error_code(), Some(codes::VALIDATION_ERROR));
        assert!(n.configure(&json!({"max_content_size": 3})));
        let err = n.validate_content("four").unwrap_err();
        assert_eq!(err.error_code(), Some(codes::INPUT_TOO_LARGE));
    }

    #[test]
    fn test_postprocess_renders_toon() {
        let n = MarkdownNormalizer::new();
        let ctx = ProcessingContext::new("openai", "gpt-4o").with_format("markdown");
        let result = n.postprocess_response(&Response::ok("openai", "#Hello\n* item"), &ctx);
        assert!(result.success);
        assert_eq!(result.output_format, "toon");
        assert!(result.processed_content.contains("# Hello") || result.processed_content.contains("\\# Hello"));
        assert_eq!(result.metadata["normalization_applied"], true);
    }

    #[test]
    fn test_streaming_normalizes_at_end() {
        let n = MarkdownNormalizer::new();
        let ctx = ProcessingContext::new("cerebras", "llama").streaming();
        assert!(n.begin_streaming(&ctx));
        let a = n.process_streaming_chunk("* a\n```\ncode", false, &ctx);
        assert_eq!(a.processed_content, "* a\n```\ncode");
        n.process_streaming_chunk("\n", true, &ctx);
        let end = n.end_streaming(&ctx);
        assert!(end.success);
        assert_eq!(end.processed_content, "- a\n```text\ncode\n\n```");
    }

    #[test]
    fn test_empty_language_list_rejected() {
        let n = MarkdownNormalizer::new();
        assert!(!n.configure(&json!({"allowed_languages": []})));
        assert!(n.validate_configuration());
    }
}
