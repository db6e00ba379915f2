//! Subcommand implementations.
//!
//! Each command returns an [`Outcome`]: the text for stdout and whether the
//! operation succeeded. `main` prints it and maps failure to a non-zero exit.

use crate::config::PrismConfig;
use anyhow::{anyhow, Context};
use prism_core::{Formatter, ProcessingContext, ProcessingResult, Request, Response};
use prism_formatters::{builtin_registry, formatter_for_provider, SyntheticFormatter};
use prism_registry::PluginRegistry;
use prism_stream::{ChunkOrdering, StreamProcessor};
use prism_toon::ToonCodec;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const SYNTHETIC: &str = "synthetic-diagnostic-formatter";

/// Result of one command.
#[derive(Debug)]
pub struct Outcome {
    /// Printed to stdout.
    pub output: String,
    /// `false` maps to exit status 1.
    pub success: bool,
}

impl Outcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }

    fn from_result(result: &ProcessingResult) -> Self {
        if result.success {
            Self::ok(result.processed_content.clone())
        } else {
            Self {
                output: format!(
                    "error [{}]: {}",
                    result.error_code().unwrap_or("UNKNOWN"),
                    result.error_message.as_deref().unwrap_or("processing failed")
                ),
                success: false,
            }
        }
    }

    fn json(value: &Value, success: bool) -> anyhow::Result<Self> {
        Ok(Self {
            output: serde_json::to_string_pretty(value)?,
            success,
        })
    }
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input '{}'", path.display()))
}

/// Built-in registry with `[formatters.<name>]` tables applied.
pub fn build_registry(config: &PrismConfig) -> anyhow::Result<PluginRegistry> {
    let registry = builtin_registry()?;
    for (name, options) in &config.formatters {
        match registry.get_prettifier(name) {
            Some(formatter) => {
                if formatter.configure(options) {
                    info!(formatter = %name, "Formatter configured");
                } else {
                    warn!(formatter = %name, "Formatter rejected its configuration");
                }
            }
            None => warn!(formatter = %name, "Configuration for unknown formatter ignored"),
        }
    }
    Ok(registry)
}

fn provider_formatter(
    registry: &PluginRegistry,
    provider: &str,
) -> anyhow::Result<Arc<dyn Formatter>> {
    let name = formatter_for_provider(provider)
        .ok_or_else(|| anyhow!("Unknown provider '{provider}'"))?;
    registry
        .get_prettifier(name)
        .ok_or_else(|| anyhow!("Formatter '{name}' is not registered"))
}

/// `prism format`: postprocesses a response body.
pub fn format(
    config: &PrismConfig,
    provider: &str,
    model: &str,
    file: &Path,
) -> anyhow::Result<Outcome> {
    let registry = build_registry(config)?;
    let formatter = provider_formatter(&registry, provider)?;
    let body = read_input(file)?;
    let context = ProcessingContext::new(provider, model);
    let result = formatter.postprocess_response(&Response::ok(provider, body), &context);
    Ok(Outcome::from_result(&result))
}

/// `prism preprocess`: transforms a request body.
pub fn preprocess(config: &PrismConfig, provider: &str, file: &Path) -> anyhow::Result<Outcome> {
    let registry = build_registry(config)?;
    let formatter = provider_formatter(&registry, provider)?;
    let body: Value = serde_json::from_str(&read_input(file)?)
        .with_context(|| format!("'{}' is not valid JSON", file.display()))?;
    let result = formatter.preprocess_request(&Request::new(body));
    Ok(Outcome::from_result(&result))
}

/// Splits `text` into pieces of at most `size` bytes, never inside a
/// UTF-8 sequence.
pub fn split_chunks(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// `prism stream`: drives a file through the streaming engine in chunks.
pub async fn stream(
    config: &PrismConfig,
    provider: &str,
    model: &str,
    chunk_size: usize,
    file: &Path,
) -> anyhow::Result<Outcome> {
    let registry = build_registry(config)?;
    let formatter = provider_formatter(&registry, provider)?;
    let body = read_input(file)?;

    let mut processor_config = config.processor.clone();
    // File chunks must keep their order.
    processor_config.ordering = ChunkOrdering::PerStream;
    let processor = Arc::new(StreamProcessor::with_codec(
        processor_config,
        ToonCodec::new(config.toon.clone()),
    )?);
    let stream_id = processor.create_stream(ProcessingContext::new(provider, model), formatter)?;

    let chunks = split_chunks(&body, chunk_size);
    let last = chunks.len().saturating_sub(1);
    let tickets: Vec<_> = if chunks.is_empty() {
        vec![processor.process_chunk(&stream_id, "", true)]
    } else {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| processor.process_chunk(&stream_id, *chunk, i == last))
            .collect()
    };
    let mut accepted = 0usize;
    for ticket in tickets {
        if ticket.await {
            accepted += 1;
        }
    }
    info!(stream_id = %stream_id, chunks = chunks.len(), accepted, "Chunks submitted");

    let result = {
        let processor = Arc::clone(&processor);
        let stream_id = stream_id.clone();
        tokio::task::spawn_blocking(move || processor.get_result(&stream_id)).await?
    };
    let stats = processor.statistics();
    let mut outcome = Outcome::from_result(&result);
    let _ = write!(
        outcome.output,
        "\n\n{}",
        serde_json::to_string_pretty(&json!({
            "stream_id": stream_id,
            "chunks_accepted": accepted,
            "statistics": stats,
            "success_rate": stats.success_rate(),
        }))?
    );
    processor.shutdown();
    Ok(outcome)
}

/// TOON actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToonAction {
    /// Structural check.
    Validate,
    /// Section size report.
    Analyze,
    /// Decoded document as JSON.
    Parse,
}

/// `prism toon <action>`.
pub fn toon(config: &PrismConfig, action: ToonAction, file: &Path) -> anyhow::Result<Outcome> {
    let codec = ToonCodec::new(config.toon.clone());
    let text = read_input(file)?;
    match action {
        ToonAction::Validate => Ok(match codec.validate(&text) {
            Ok(()) => Outcome::ok("valid"),
            Err(e) => Outcome {
                output: format!("invalid: {e}"),
                success: false,
            },
        }),
        ToonAction::Analyze => Outcome::json(&serde_json::to_value(codec.analyze(&text))?, true),
        ToonAction::Parse => match codec.decode(&text) {
            Ok(doc) => Outcome::json(&doc.data(), true),
            Err(e) => Ok(Outcome {
                output: format!("invalid: {e}"),
                success: false,
            }),
        },
    }
}

/// Synthetic actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticAction {
    /// Body shaped like `provider` would send it.
    Simulate {
        /// Provider whose shape is imitated.
        provider: String,
        /// Text placed in the body.
        content: String,
    },
    /// Scenario names.
    Scenarios,
    /// Per-provider timing.
    Benchmark {
        /// Runs per provider.
        iterations: usize,
    },
    /// Thread-safety and format-compatibility checks.
    Selftest,
}

fn synthetic_formatter(config: &PrismConfig) -> SyntheticFormatter {
    let formatter = SyntheticFormatter::new();
    if let Some(options) = config.formatters.get(SYNTHETIC) {
        if !formatter.configure(options) {
            warn!(formatter = SYNTHETIC, "Formatter rejected its configuration");
        }
    }
    formatter
}

/// `prism synthetic <action>`.
pub fn synthetic(config: &PrismConfig, action: &SyntheticAction) -> anyhow::Result<Outcome> {
    let formatter = synthetic_formatter(config);
    match action {
        SyntheticAction::Simulate { provider, content } => Ok(Outcome::ok(
            formatter.simulate_provider_response(provider, content),
        )),
        SyntheticAction::Scenarios => Ok(Outcome::ok(formatter.generate_test_scenarios().join("\n"))),
        SyntheticAction::Benchmark { iterations } => {
            Outcome::json(&formatter.run_benchmark_suite(*iterations), true)
        }
        SyntheticAction::Selftest => {
            let thread_safety = formatter.validate_thread_safety();
            let mut passed = thread_safety["passed"] == true;
            let mut compatibility = serde_json::Map::new();
            for provider in ["openai", "anthropic", "cerebras"] {
                let body = formatter.simulate_provider_response(provider, "self test");
                let report = formatter.validate_format_compatibility(&body, provider);
                passed &= report["compatible"] == true;
                compatibility.insert(provider.to_string(), report);
            }
            Outcome::json(
                &json!({
                    "passed": passed,
                    "thread_safety": thread_safety,
                    "format_compatibility": compatibility,
                    "performance": formatter.analyze_performance_regression(),
                }),
                passed,
            )
        }
    }
}

/// Plugin actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    /// One line per registered formatter.
    List,
    /// Aggregated registry health.
    Health,
}

/// `prism plugins <action>`.
pub fn plugins(config: &PrismConfig, action: PluginAction) -> anyhow::Result<Outcome> {
    let registry = build_registry(config)?;
    match action {
        PluginAction::List => {
            let metadata = registry.get_all_metadata();
            let mut out = String::from("Registered formatters:\n");
            for meta in &metadata {
                let m = &meta.manifest;
                let _ = writeln!(
                    out,
                    "  {} {} [{}] {}",
                    m.name,
                    m.version,
                    if meta.enabled { "enabled" } else { "disabled" },
                    m.description
                );
                if !m.providers.is_empty() {
                    let _ = writeln!(out, "    providers: {}", m.providers.join(", "));
                }
            }
            let _ = write!(out, "\nTotal: {} formatter(s)", metadata.len());
            Ok(Outcome::ok(out))
        }
        PluginAction::Health => {
            let health = registry.health_check();
            let healthy = health["status"] == "healthy";
            Outcome::json(&health, healthy)
        }
    }
}
