//! Built-in formatters for the prism proxy.
//!
//! Four provider adapters normalize Anthropic, OpenAI, Cerebras and
//! synthetic traffic into TOON documents. Two utility formatters handle
//! Markdown cleanup and provider-agnostic tool-call extraction.
//!
//! # Main types
//!
//! - [`AnthropicFormatter`]: `tool_use` blocks, `<function_calls>` XML and thinking separation.
//! - [`OpenAiFormatter`]: Function calling, legacy formats and structured output repair.
//! - [`CerebrasFormatter`]: Budgeted extraction with fast failover.
//! - [`SyntheticFormatter`]: Fabricated traffic, error injection and self-tests.
//! - [`MarkdownNormalizer`]: Provider rewrites and fence fixes.
//! - [`ToolCallExtractor`]: JSON/XML extraction with recovery.
//! - [`ContentGuard`]: Size ceiling and threat screen shared by the above.

pub mod anthropic;
pub mod cerebras;
pub mod common;
pub mod extractor;
pub mod guard;
pub mod markdown;
pub mod openai;
pub mod synthetic;

pub use anthropic::{AnthropicConfig, AnthropicFormatter};
pub use cerebras::{CerebrasConfig, CerebrasFormatter, PayloadShape};
pub use extractor::{ExtractorConfig, Strategy, ToolCallExtractor};
pub use guard::{ContentGuard, Screened, MAX_INPUT_BYTES};
pub use markdown::{MarkdownConfig, MarkdownNormalizer};
pub use openai::{OpenAiConfig, OpenAiFormat, OpenAiFormatter};
pub use synthetic::{SimulationMode, SyntheticConfig, SyntheticErrorKind, SyntheticFormatter};

use prism_core::{Formatter, PrismResult};
use prism_registry::PluginRegistry;
use std::sync::Arc;

/// One fresh instance of every built-in formatter.
pub fn builtin_formatters() -> Vec<Arc<dyn Formatter>> {
    vec![
        Arc::new(AnthropicFormatter::new()),
        Arc::new(OpenAiFormatter::new()),
        Arc::new(CerebrasFormatter::new()),
        Arc::new(SyntheticFormatter::new()),
        Arc::new(MarkdownNormalizer::new()),
        Arc::new(ToolCallExtractor::new()),
    ]
}

/// A registry holding the six built-in formatters.
pub fn builtin_registry() -> PrismResult<PluginRegistry> {
    let registry = PluginRegistry::new();
    for formatter in builtin_formatters() {
        registry.register_formatter(formatter)?;
    }
    Ok(registry)
}

/// Name of the built-in adapter for `provider`, if there is one.
pub fn formatter_for_provider(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("anthropic-claude-formatter"),
        "openai" => Some("openai-gpt-formatter"),
        "cerebras" => Some("cerebras-speed-formatter"),
        "synthetic" => Some("synthetic-diagnostic-formatter"),
        _ => None,
    }
}
