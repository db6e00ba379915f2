//! Shared contracts for the prism response-normalization proxy.
//!
//! Every other prism crate builds on the value types and the capability
//! trait defined here.
//!
//! # Main types
//!
//! - [`PrismError`]: Unified error enum; [`PrismResult`] is its `Result` alias.
//! - [`ToolCall`]: A tool invocation extracted from a provider response.
//! - [`ProcessingContext`]: Per-request context read by every formatter.
//! - [`ProcessingResult`]: Outcome of one formatter call.
//! - [`Request`] / [`Response`]: Data contract with the HTTP layer.
//! - [`Formatter`]: Capability trait implemented per provider.
//! - [`PatternTable`]: Declarative, named regex rule lists.

/// Processing context and result types.
pub mod context;
/// Error types.
pub mod error;
/// Request/response contract with the HTTP layer.
pub mod exchange;
/// The formatter capability trait.
pub mod formatter;
/// Lock-free counters.
pub mod metrics;
pub mod options;
pub mod patterns;
/// Tool call types.
pub mod tool;

pub use context::{estimate_tokens, ProcessingContext, ProcessingResult};
pub use error::{codes, PrismError, PrismResult};
pub use exchange::{Request, Response};
pub use formatter::Formatter;
pub use metrics::LatencyStats;
pub use options::OptionReader;
pub use patterns::{CompiledPattern, PatternTable};
pub use tool::{generate_call_id, ToolCall, ToolStatus};
