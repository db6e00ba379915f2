//! Diagnostic formatter that fabricates provider-shaped traffic.
//!
//! Used by tests and the `prism synthetic` subcommands: it simulates
//! Cerebras, OpenAI and Anthropic bodies, injects random errors at a
//! configured rate, and carries self-tests for thread safety and latency
//! regressions.

use crate::common::{provider_failure, render_toon, text_kind, StreamSlots};
use crate::guard::{ContentGuard, MAX_INPUT_BYTES};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use prism_core::metrics::{bump, load, ratio};
use prism_core::{
    codes, estimate_tokens, Formatter, LatencyStats, OptionReader, ProcessingContext,
    ProcessingResult, Request, Response, ToolCall, ToolStatus,
};
use prism_toon::ToonCodec;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NAME: &str = "synthetic-diagnostic-formatter";

const TOOL_NAMES: &[&str] = &[
    "synthetic_function",
    "test_operation",
    "diagnostic_check",
    "benchmark_run",
    "format_validate",
];

const SIMULATED_PROVIDERS: &[&str] = &["cerebras", "openai", "anthropic"];

/// Latency baselines in microseconds; an average above 1.5x flags a
/// regression.
pub const PERFORMANCE_BASELINES_US: &[(&str, f64)] = &[
    ("cerebras", 30_000.0),
    ("openai", 40_000.0),
    ("anthropic", 45_000.0),
    ("synthetic", 25_000.0),
];

const REGRESSION_RATIO: f64 = 1.5;

/// Memory samples kept for `memory_stats`; older ones are dropped.
const MEMORY_SAMPLE_CAP: usize = 256;

const TEST_SCENARIOS: &[&str] = &[
    "normal_operation",
    "error_injection",
    "performance_stress",
    "memory_intensive",
    "concurrent_access",
    "format_validation",
    "streaming_test",
    "large_response",
    "malformed_input",
    "timeout_simulation",
];

/// Which provider the formatter pretends to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    /// Cerebras-shaped chat completions.
    Cerebras,
    /// OpenAI-shaped chat completions.
    Openai,
    /// Anthropic-shaped messages.
    Anthropic,
    /// A random provider per response.
    Mixed,
    /// Same as `Mixed`.
    Random,
    /// Pass the payload through untouched.
    #[default]
    Synthetic,
}

impl SimulationMode {
    /// Parses a mode name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cerebras" => Some(Self::Cerebras),
            "openai" => Some(Self::Openai),
            "anthropic" => Some(Self::Anthropic),
            "mixed" => Some(Self::Mixed),
            "random" => Some(Self::Random),
            "synthetic" => Some(Self::Synthetic),
            _ => None,
        }
    }

    /// Mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cerebras => "cerebras",
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Mixed => "mixed",
            Self::Random => "random",
            Self::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures the formatter can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticErrorKind {
    /// Provider took too long.
    SimulatedTimeout,
    /// Body was not valid JSON.
    MalformedJsonResponse,
    /// Allocation failed.
    MemoryAllocationFailure,
    /// Connection dropped.
    NetworkConnectivityError,
    /// Credentials rejected.
    ProviderAuthenticationError,
    /// Too many requests.
    RateLimitExceeded,
    /// Request rejected as malformed.
    InvalidRequestFormat,
}

impl SyntheticErrorKind {
    /// Every kind, in a fixed order.
    pub const ALL: [SyntheticErrorKind; 7] = [
        Self::SimulatedTimeout,
        Self::MalformedJsonResponse,
        Self::MemoryAllocationFailure,
        Self::NetworkConnectivityError,
        Self::ProviderAuthenticationError,
        Self::RateLimitExceeded,
        Self::InvalidRequestFormat,
    ];

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulatedTimeout => "simulated_timeout",
            Self::MalformedJsonResponse => "malformed_json_response",
            Self::MemoryAllocationFailure => "memory_allocation_failure",
            Self::NetworkConnectivityError => "network_connectivity_error",
            Self::ProviderAuthenticationError => "provider_authentication_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::InvalidRequestFormat => "invalid_request_format",
        }
    }
}

impl fmt::Display for SyntheticErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options recognized by the synthetic formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Provider to imitate.
    #[serde(default)]
    pub simulation_mode: SimulationMode,
    /// Probability of injecting an error per call, in [0, 1].
    #[serde(default)]
    pub error_injection_rate: f64,
    /// Log every operation at debug level.
    #[serde(default)]
    pub enable_detailed_logging: bool,
    /// Attach timing data to results.
    #[serde(default)]
    pub performance_benchmarking: bool,
    /// Attach generated test data to preprocessed requests.
    #[serde(default)]
    pub test_data_generation: bool,
    /// Record allocation samples.
    #[serde(default)]
    pub memory_profiling: bool,
    /// Reserved for load-test harnesses.
    #[serde(default)]
    pub load_testing: bool,
    /// Run the thread-safety self-test during health checks.
    #[serde(default)]
    pub concurrent_testing: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            simulation_mode: SimulationMode::Synthetic,
            error_injection_rate: 0.0,
            enable_detailed_logging: false,
            performance_benchmarking: false,
            test_data_generation: false,
            memory_profiling: false,
            load_testing: false,
            concurrent_testing: false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    latency: LatencyStats,
    synthetic_responses_generated: AtomicU64,
    errors_injected: AtomicU64,
    errors_recovered: AtomicU64,
    test_data_generated: AtomicU64,
    benchmarks_run: AtomicU64,
    format_validations: AtomicU64,
    memory_samples: AtomicU64,
}

#[derive(Debug, Default)]
struct StreamState {
    started: Option<Instant>,
    chunks: u64,
    bytes: u64,
}

/// Test and benchmark formatter producing fabricated provider traffic.
pub struct SyntheticFormatter {
    config: RwLock<SyntheticConfig>,
    guard: ContentGuard,
    codec: ToonCodec,
    counters: Counters,
    memory_usage_samples: Mutex<VecDeque<u64>>,
    stream: StreamSlots<StreamState>,
}

impl Default for SyntheticFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticFormatter {
    /// Creates a formatter in `synthetic` mode with no error injection.
    pub fn new() -> Self {
        Self::with_config(SyntheticConfig::default())
    }

    /// Creates a formatter with the given options.
    pub fn with_config(config: SyntheticConfig) -> Self {
        Self {
            config: RwLock::new(config),
            guard: ContentGuard::new(MAX_INPUT_BYTES),
            codec: ToonCodec::default(),
            counters: Counters::default(),
            memory_usage_samples: Mutex::new(VecDeque::with_capacity(MEMORY_SAMPLE_CAP)),
            stream: StreamSlots::default(),
        }
    }

    fn detailed(&self) -> bool {
        self.config.read().enable_detailed_logging
    }

    /// Draws against `error_injection_rate` and picks an error kind on a hit.
    pub fn draw_error(&self) -> Option<SyntheticErrorKind> {
        let rate = self.config.read().error_injection_rate;
        if rate <= 0.0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() >= rate {
            return None;
        }
        SyntheticErrorKind::ALL.choose(&mut rng).copied()
    }

    /// A provider-shaped JSON body wrapping `content`.
    pub fn simulate_provider_response(&self, provider: &str, content: &str) -> String {
        let now = Utc::now().timestamp();
        let body = match provider {
            "cerebras" => json!({
                "id": format!("synthetic_cerebras_{now}"),
                "object": "chat.completion",
                "created": now,
                "model": "llama3.1-70b",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": format!("Cerebras simulated response: {content}"),
                    },
                    "finish_reason": "stop",
                }],
            }),
            "openai" => json!({
                "id": format!("synthetic_openai_{now}"),
                "object": "chat.completion",
                "created": now,
                "model": "gpt-4",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": format!("OpenAI simulated response: {content}"),
                        "tool_calls": [],
                    },
                    "finish_reason": "stop",
                }],
            }),
            "anthropic" => json!({
                "id": format!("msg_{now}"),
                "type": "message",
                "role": "assistant",
                "content": [{
                    "type": "text",
                    "text": format!("Anthropic simulated response: {content}"),
                }],
                "model": "claude-3-sonnet",
                "stop_reason": "end_turn",
            }),
            _ => json!({
                "provider": "synthetic",
                "content": format!("Synthetic response: {content}"),
                "timestamp": now,
            }),
        };
        body.to_string()
    }

    /// `count` completed calls with `complexity` parameters each.
    pub fn generate_synthetic_tool_calls(&self, count: usize, complexity: usize) -> Vec<ToolCall> {
        let mut rng = rand::thread_rng();
        let now = Utc::now().timestamp();
        (0..count)
            .map(|i| {
                let base = TOOL_NAMES.choose(&mut rng).copied().unwrap_or("synthetic_function");
                let params: serde_json::Map<String, Value> = (0..complexity)
                    .map(|p| (format!("param_{p}"), json!(format!("synthetic_value_{p}"))))
                    .collect();
                ToolCall::new(format!("{base}_{i}"), Value::Object(params))
                    .with_id(format!("synthetic_tool_{i}_{now}"))
                    .with_status(ToolStatus::Completed)
            })
            .collect()
    }

    /// Test payloads: `tool_calls`, `long_content` or `mixed`.
    ///
    /// Other kinds yield a small generic JSON object naming the scenario.
    pub fn generate_test_data(&self, kind: &str) -> String {
        bump(&self.counters.test_data_generated, 1);
        match kind {
            "tool_calls" => {
                let calls: Vec<Value> = self
                    .generate_synthetic_tool_calls(3, 2)
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.parameters.to_string(),
                            },
                        })
                    })
                    .collect();
                json!({"choices": [{"message": {"content": "", "tool_calls": calls}}]}).to_string()
            }
            "long_content" => (0..200)
                .map(|i| {
                    format!(
                        "## Section {i}\n\nSynthetic paragraph {i} used to exercise large responses.\n"
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            "mixed" => json!({
                "content": [
                    {"type": "text", "text": "<thinking>Synthetic reasoning</thinking>\nMixed content answer."},
                    {"type": "tool_use", "id": "toolu_synthetic", "name": "diagnostic_check", "input": {"depth": 2}},
                    {"type": "text", "text": "```json\n{\"ok\": true}\n```"},
                ],
            })
            .to_string(),
            other => json!({
                "scenario": other,
                "synthetic": true,
                "test_content": format!("Generated test content for {other}"),
            })
            .to_string(),
        }
    }

    /// Times `iterations` simulated responses per provider.
    pub fn run_benchmark_suite(&self, iterations: usize) -> Value {
        let iterations = iterations.max(1);
        let mut results = serde_json::Map::new();
        for provider in SIMULATED_PROVIDERS.iter().copied().chain(["synthetic"]) {
            let mut total = Duration::ZERO;
            let mut min = Duration::MAX;
            let mut max = Duration::ZERO;
            for i in 0..iterations {
                let started = Instant::now();
                let body = self.simulate_provider_response(provider, &format!("benchmark {i}"));
                let _ = self.validate_format_compatibility(&body, provider);
                let elapsed = started.elapsed();
                total += elapsed;
                min = min.min(elapsed);
                max = max.max(elapsed);
            }
            results.insert(
                provider.to_string(),
                json!({
                    "iterations": iterations,
                    "total_us": total.as_micros() as u64,
                    "average_us": total.as_micros() as f64 / iterations as f64,
                    "min_us": min.as_micros() as u64,
                    "max_us": max.as_micros() as u64,
                }),
            );
        }
        if self.config.read().memory_profiling {
            let profile = self.profile_memory_usage(|| vec![b'x'; 100 * 1024].len());
            results.insert("memory_benchmark".to_string(), profile);
        }
        bump(&self.counters.benchmarks_run, 1);
        results.insert(
            "benchmarks_completed".to_string(),
            json!(load(&self.counters.benchmarks_run)),
        );
        Value::Object(results)
    }

    /// Checks that `data` has the body shape `provider` would send.
    pub fn validate_format_compatibility(&self, data: &str, provider: &str) -> Value {
        bump(&self.counters.format_validations, 1);
        let mut issues = Vec::new();
        let parsed = serde_json::from_str::<Value>(data);
        let shape_matches = match &parsed {
            Ok(body) => {
                let matches = match provider {
                    "cerebras" | "openai" => body["choices"].is_array(),
                    "anthropic" => body["content"].is_array() || body["content"].is_string(),
                    _ => body.is_object(),
                };
                if !matches {
                    issues.push(format!("Body does not match the {provider} response shape"));
                }
                matches
            }
            Err(e) => {
                issues.push(format!("Invalid JSON: {e}"));
                false
            }
        };
        json!({
            "provider": provider,
            "valid_json": parsed.is_ok(),
            "shape_matches": shape_matches,
            "compatible": parsed.is_ok() && shape_matches,
            "issues": issues,
            "validation_runs": load(&self.counters.format_validations),
        })
    }

    /// Names of the built-in test scenarios.
    pub fn generate_test_scenarios(&self) -> Vec<&'static str> {
        TEST_SCENARIOS.to_vec()
    }

    /// Runs 4 threads of 10 generate-and-simulate operations each.
    pub fn validate_thread_safety(&self) -> Value {
        const THREADS: usize = 4;
        const OPERATIONS: usize = 10;
        let successes = AtomicU64::new(0);
        let failures = AtomicU64::new(0);
        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let (successes, failures) = (&successes, &failures);
                scope.spawn(move || {
                    for i in 0..OPERATIONS {
                        let data = self.generate_test_data("thread_safety");
                        let body = self.simulate_provider_response("synthetic", &data);
                        if serde_json::from_str::<Value>(&body).is_ok() {
                            bump(successes, 1);
                        } else {
                            debug!(thread = t, operation = i, "Thread-safety operation failed");
                            bump(failures, 1);
                        }
                    }
                });
            }
        });
        let ok = load(&successes);
        let failed = load(&failures);
        json!({
            "passed": failed == 0,
            "successful_operations": ok,
            "failed_operations": failed,
            "total_operations": ok + failed,
        })
    }

    /// Compares the average latency with [`PERFORMANCE_BASELINES_US`].
    pub fn analyze_performance_regression(&self) -> Value {
        let current = self.counters.latency.average_us();
        let mut analysis = serde_json::Map::new();
        analysis.insert("current_average_us".to_string(), json!(current));
        for (provider, baseline) in PERFORMANCE_BASELINES_US {
            let ratio = current / baseline;
            analysis.insert(
                format!("regression_{provider}"),
                json!({
                    "baseline_us": baseline,
                    "current_us": current,
                    "regression_ratio": ratio,
                    "regression_detected": ratio > REGRESSION_RATIO,
                }),
            );
        }
        Value::Object(analysis)
    }

    fn profile_memory_usage(&self, operation: impl FnOnce() -> usize) -> Value {
        let started = Instant::now();
        let bytes = operation() as u64;
        let mut samples = self.memory_usage_samples.lock();
        if samples.len() == MEMORY_SAMPLE_CAP {
            samples.pop_front();
        }
        samples.push_back(bytes);
        drop(samples);
        bump(&self.counters.memory_samples, 1);
        json!({
            "memory_bytes": bytes,
            "execution_time_ms": started.elapsed().as_millis() as u64,
            "profiling_successful": true,
        })
    }

    fn tool_shape(provider: &str) -> (usize, usize) {
        match provider {
            "openai" => (2, 5),
            "anthropic" => (1, 7),
            _ => (3, 3),
        }
    }
}

impl Formatter for SyntheticFormatter {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "Synthetic provider simulation, error injection and self-tests"
    }

    fn supported_formats(&self) -> &[&'static str] {
        &[
            "synthetic-test",
            "cerebras-format",
            "openai-format",
            "anthropic-format",
            "mixed-format",
            "error-injection",
            "benchmark-data",
            "diagnostic-output",
        ]
    }

    fn output_formats(&self) -> &[&'static str] {
        &["toon", "json", "diagnostic", "benchmark", "test-results"]
    }

    fn supported_providers(&self) -> &[&'static str] {
        &["synthetic", "test", "diagnostic"]
    }

    fn capabilities(&self) -> &[&'static str] {
        &[
            "diagnostic-testing",
            "mixed-simulation",
            "error-injection",
            "performance-benchmarking",
            "format-validation",
            "thread-safety-testing",
            "memory-profiling",
            "regression-detection",
        ]
    }

    fn preprocess_request(&self, request: &Request) -> ProcessingResult {
        let started = Instant::now();
        let config = self.config.read().clone();
        if let Some(kind) = self.draw_error() {
            bump(&self.counters.errors_injected, 1);
            return ProcessingResult::failure(
                format!("Synthetic preprocess error injected: {kind}"),
                codes::SYNTHETIC_ERROR,
            );
        }
        let Some(body) = request.data.as_object() else {
            return ProcessingResult::failure(
                "Request body must be a JSON object",
                codes::VALIDATION_ERROR,
            );
        };
        let mut body = body.clone();
        body.insert(
            "_synthetic_metadata".to_string(),
            json!({
                "preprocessed_at": Utc::now().timestamp(),
                "simulation_mode": config.simulation_mode.as_str(),
                "test_config": {
                    "detailed_logging": config.enable_detailed_logging,
                    "performance_benchmarking": config.performance_benchmarking,
                    "error_injection_rate": config.error_injection_rate,
                },
            }),
        );
        if config.test_data_generation {
            body.insert(
                "test_data".to_string(),
                json!(self.generate_test_data("preprocess_request")),
            );
        }
        self.counters.latency.record(started.elapsed());
        let mut result =
            ProcessingResult::success(Value::Object(body).to_string(), "synthetic-preprocessed")
                .with_metadata("synthetic_preprocessing", json!(true))
                .with_metadata("performance_measured", json!(config.performance_benchmarking))
                .with_metadata(
                    "error_injection_checked",
                    json!(config.error_injection_rate > 0.0),
                )
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
        let config = self.config.read().clone();

        if let Some(kind) = self.draw_error() {
            bump(&self.counters.errors_injected, 1);
            bump(&self.counters.errors_recovered, 1);
            if config.enable_detailed_logging {
                debug!(error = %kind, "Injecting postprocess error");
            }
            return ProcessingResult::failure(
                format!("Synthetic postprocess error injected: {kind}"),
                codes::SYNTHETIC_ERROR,
            )
            .with_metadata("error_recovery_test", json!(true))
            .with_processing_time(started.elapsed());
        }

        let simulated_provider = match config.simulation_mode {
            SimulationMode::Mixed | SimulationMode::Random => SIMULATED_PROVIDERS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("cerebras"),
            mode => mode.as_str(),
        };
        let (content, tools) = if simulated_provider == "synthetic" {
            (raw, Vec::new())
        } else {
            let (count, complexity) = Self::tool_shape(simulated_provider);
            (
                self.simulate_provider_response(simulated_provider, &raw),
                self.generate_synthetic_tool_calls(count, complexity),
            )
        };
        bump(&self.counters.synthetic_responses_generated, 1);

        let kind = if serde_json::from_str::<Value>(&content).is_ok() {
            "json"
        } else {
            text_kind(&content)
        };
        let mut working = ProcessingResult::success(content, kind)
            .with_metadata("provider", json!("synthetic"))
            .with_metadata("simulation_mode", json!(config.simulation_mode.as_str()))
            .with_metadata("simulated_provider", json!(simulated_provider))
            .with_metadata("synthetic_processing", json!(true))
            .with_metadata("error_injection_rate", json!(config.error_injection_rate))
            .with_metadata("diagnostic_mode", json!(config.enable_detailed_logging))
            .with_metadata("tool_calls_count", json!(tools.len()));
        if config.performance_benchmarking {
            working = working.with_metadata(
                "performance_metrics",
                json!({
                    "processing_time_us": started.elapsed().as_micros() as u64,
                    "success": true,
                }),
            );
        }
        if config.memory_profiling {
            let profile = self.profile_memory_usage(|| vec![b'x'; 10 * 1024].len());
            working = working.with_metadata("memory_profile", profile);
        }
        working.extracted_tool_calls = tools;
        self.counters.latency.record(started.elapsed());
        if config.enable_detailed_logging {
            debug!(
                mode = %config.simulation_mode,
                provider = simulated_provider,
                tools = working.extracted_tool_calls.len(),
                "Synthetic response generated"
            );
        }
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
        if self.detailed() {
            debug!(stream_id = context.stream_key(), "Synthetic streaming started");
        }
        true
    }

    fn process_streaming_chunk(
        &self,
        chunk: &str,
        is_final: bool,
        context: &ProcessingContext,
    ) -> ProcessingResult {
        let Some(slot) = self.stream.get(context) else {
            return ProcessingResult::failure(
                "Synthetic streaming not initialized",
                codes::STREAMING_ERROR,
            );
        };
        let mut state = slot.lock();
        let started = Instant::now();
        state.chunks += 1;
        state.bytes += chunk.len() as u64;

        let mut result = ProcessingResult::passthrough(chunk);
        let synthetic_mode = self.config.read().simulation_mode == SimulationMode::Synthetic;
        if (chunk.contains("function") || synthetic_mode)
            && (chunk.trim_end().ends_with('}') || is_final)
        {
            result.extracted_tool_calls = self.generate_synthetic_tool_calls(1, 3);
        }
        if !is_final && state.chunks % 10 == 0 && self.draw_error().is_some() {
            bump(&self.counters.errors_injected, 1);
            bump(&self.counters.errors_recovered, 1);
            result = result.with_metadata("streaming_error_injected", json!(true));
        }
        if is_final {
            result = result
                .with_metadata("final_chunk", json!(true))
                .with_metadata("total_chunks", json!(state.chunks))
                .with_metadata("total_bytes", json!(state.bytes));
        }
        self.counters.latency.record(started.elapsed());
        result
    }

    fn end_streaming(&self, context: &ProcessingContext) -> ProcessingResult {
        let Some(state) = self.stream.finish(context) else {
            return ProcessingResult::failure(
                "Synthetic streaming not active",
                codes::STREAMING_ERROR,
            );
        };
        let elapsed = state.started.map_or(Duration::ZERO, |s| s.elapsed());
        let total_ms = elapsed.as_millis() as u64;
        let average_chunk = if state.chunks == 0 {
            0
        } else {
            state.bytes / state.chunks
        };
        let chunks_per_second = if elapsed.is_zero() {
            0.0
        } else {
            state.chunks as f64 / elapsed.as_secs_f64()
        };
        let mut result = ProcessingResult::success("Synthetic streaming response completed", "text")
            .with_metadata("streaming_completed", json!(true))
            .with_metadata("total_streaming_time_ms", json!(total_ms))
            .with_metadata("chunk_count", json!(state.chunks))
            .with_metadata("total_bytes", json!(state.bytes))
            .with_metadata("average_chunk_size", json!(average_chunk))
            .with_metadata("chunks_per_second", json!(chunks_per_second))
            .with_metadata("synthetic_streaming", json!(true))
            .with_processing_time(elapsed);
        result.tokens_processed = estimate_tokens(&result.processed_content);
        result.extracted_tool_calls = self.generate_synthetic_tool_calls(2, 5);
        result.streaming_mode = true;
        bump(&self.counters.synthetic_responses_generated, 1);
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
        let mut mode = next.simulation_mode.as_str().to_string();
        reader.string(
            "simulation_mode",
            |m| SimulationMode::parse(m).is_some(),
            &mut mode,
        );
        next.simulation_mode = SimulationMode::parse(&mode).unwrap_or_default();
        reader.f64_clamped(
            "error_injection_rate",
            0.0..=1.0,
            &mut next.error_injection_rate,
        );
        reader.bool("enable_detailed_logging", &mut next.enable_detailed_logging);
        reader.bool("performance_benchmarking", &mut next.performance_benchmarking);
        reader.bool("test_data_generation", &mut next.test_data_generation);
        reader.bool("memory_profiling", &mut next.memory_profiling);
        reader.bool("load_testing", &mut next.load_testing);
        reader.bool("concurrent_testing", &mut next.concurrent_testing);
        *self.config.write() = next;
        info!(formatter = NAME, mode = %mode, "Configuration applied");
        self.validate_configuration()
    }

    fn validate_configuration(&self) -> bool {
        (0.0..=1.0).contains(&self.config.read().error_injection_rate)
    }

    fn configuration(&self) -> Value {
        serde_json::to_value(&*self.config.read()).unwrap_or_default()
    }

    fn get_metrics(&self) -> Value {
        let c = &self.counters;
        let injected = load(&c.errors_injected);
        let recovered = load(&c.errors_recovered);
        let baselines: serde_json::Map<String, Value> = PERFORMANCE_BASELINES_US
            .iter()
            .map(|(provider, baseline)| ((*provider).to_string(), json!(baseline)))
            .collect();
        let mut metrics = json!({
            "total_processing_count": c.latency.count(),
            "total_processing_time_us": c.latency.total_us(),
            "average_processing_time_us": c.latency.average_us(),
            "max_processing_time_us": c.latency.max_us(),
            "synthetic_responses_generated": load(&c.synthetic_responses_generated),
            "errors_injected": injected,
            "errors_recovered": recovered,
            "error_recovery_rate": if injected == 0 { 1.0 } else { ratio(recovered, injected) },
            "test_data_generated": load(&c.test_data_generated),
            "benchmarks_run": load(&c.benchmarks_run),
            "format_validations": load(&c.format_validations),
            "memory_samples": load(&c.memory_samples),
            "performance_baselines": baselines,
        });
        let samples = self.memory_usage_samples.lock();
        if !samples.is_empty() {
            let total: u64 = samples.iter().sum();
            metrics["memory_stats"] = json!({
                "samples": samples.len(),
                "total_bytes": total,
                "average_bytes": total / samples.len() as u64,
                "max_bytes": samples.iter().max().copied().unwrap_or_default(),
            });
        }
        metrics
    }

    fn reset_metrics(&self) {
        let c = &self.counters;
        c.latency.reset();
        for counter in [
            &c.synthetic_responses_generated,
            &c.errors_injected,
            &c.errors_recovered,
            &c.test_data_generated,
            &c.benchmarks_run,
            &c.format_validations,
            &c.memory_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.memory_usage_samples.lock().clear();
    }

    fn health_check(&self) -> Value {
        let data_ok = !self.generate_test_data("health_check").is_empty();
        let simulated = self.simulate_provider_response("synthetic", "test content");
        let simulation_ok = serde_json::from_str::<Value>(&simulated).is_ok();
        let config_ok = self.validate_configuration();
        let thread_safety = if self.config.read().concurrent_testing {
            self.validate_thread_safety()["passed"].clone()
        } else {
            json!("not_tested")
        };
        let metrics = self.get_metrics();
        let healthy = data_ok && simulation_ok && config_ok && thread_safety != json!(false);
        json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "timestamp": Utc::now().timestamp(),
            "test_data_generation": data_ok,
            "provider_simulation": simulation_ok,
            "error_injection_mechanism": true,
            "configuration_valid": config_ok,
            "thread_safety": thread_safety,
            "recent_performance": {
                "avg_processing_time_us": metrics["average_processing_time_us"],
                "error_recovery_rate": metrics["error_recovery_rate"],
                "synthetic_operations": metrics["synthetic_responses_generated"],
            },
        })
    }

    fn get_diagnostics(&self) -> Value {
        let config = self.config.read().clone();
        let injected = load(&self.counters.errors_injected);
        let scenarios = self.generate_test_scenarios();
        let mut diagnostics = json!({
            "name": NAME,
            "version": self.version(),
            "status": "active",
            "active_streams": self.stream.active(),
            "configuration": self.configuration(),
            "metrics": self.get_metrics(),
            "capabilities": {
                "diagnostic_testing": true,
                "mixed_simulation": matches!(config.simulation_mode, SimulationMode::Mixed | SimulationMode::Random),
                "error_injection": config.error_injection_rate > 0.0,
                "performance_benchmarking": config.performance_benchmarking,
                "thread_safety_testing": config.concurrent_testing,
                "memory_profiling": config.memory_profiling,
                "load_testing": config.load_testing,
            },
            "performance_regression": self.analyze_performance_regression(),
            "test_scenarios_available": scenarios.len(),
            "test_scenarios": scenarios,
        });
        if injected > 0 {
            diagnostics["error_injection_stats"] = json!({
                "total_injected": injected,
                "total_recovered": load(&self.counters.errors_recovered),
                "recovery_rate": ratio(load(&self.counters.errors_recovered), injected),
                "injection_rate": config.error_injection_rate,
            });
        }
        let samples = self.memory_usage_samples.lock().len();
        if config.memory_profiling && samples > 0 {
            diagnostics["memory_analysis"] = json!({
                "enabled": true,
                "sample_count": samples,
                "trend_analyzed": samples > 10,
            });
        }
        diagnostics
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx() -> ProcessingContext {
        ProcessingContext::new("synthetic", "synthetic-1")
    }

    #[test]
    fn test_simulated_bodies_have_provider_shapes() {
        let f = SyntheticFormatter::new();
        for provider in ["cerebras", "openai", "anthropic", "synthetic"] {
            let body = f.simulate_provider_response(provider, "hello");
            let report = f.validate_format_compatibility(&body, provider);
            assert_eq!(report["compatible"], true, "{provider}: {report}");
        }
        let report = f.validate_format_compatibility("{\"x\":1}", "openai");
        assert_eq!(report["compatible"], false);
        assert_eq!(report["issues"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_generated_tool_calls() {
        let f = SyntheticFormatter::new();
        let calls = f.generate_synthetic_tool_calls(3, 2);
        assert_eq!(calls.len(), 3);
        for (i, call) in calls.iter().enumerate() {
            assert!(call.name.ends_with(&format!("_{i}")));
            assert!(call.id.starts_with(&format!("synthetic_tool_{i}_")));
            assert_eq!(call.status, ToolStatus::Completed);
            assert_eq!(call.parameters["param_1"], "synthetic_value_1");
        }
    }

    #[test]
    fn test_generate_test_data_kinds() {
        let f = SyntheticFormatter::new();
        let tools: Value = serde_json::from_str(&f.generate_test_data("tool_calls")).unwrap();
        assert_eq!(
            tools["choices"][0]["message"]["tool_calls"]
                .as_array()
                .unwrap()
                .len(),
            3
        );
        assert!(f.generate_test_data("long_content").len() > 10_000);
        let mixed: Value = serde_json::from_str(&f.generate_test_data("mixed")).unwrap();
        assert_eq!(mixed["content"][1]["type"], "tool_use");
        assert_eq!(f.get_metrics()["test_data_generated"], 3);
    }

    #[test]
    fn test_full_error_injection() {
        let f = SyntheticFormatter::new();
        assert!(f.configure(&json!({"error_injection_rate": 1.0})));
        let result = f.postprocess_response(&Response::ok("synthetic", "x"), &ctx());
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(codes::SYNTHETIC_ERROR));
        assert_eq!(result.metadata["error_recovery_test"], true);
        assert_eq!(f.get_metrics()["errors_injected"], 1);
    }

    #[test]
    fn test_injection_rate_is_clamped() {
        let f = SyntheticFormatter::new();
        assert!(f.configure(&json!({"error_injection_rate": 7.5})));
        assert_eq!(f.configuration()["error_injection_rate"], 1.0);
    }

    #[test]
    fn test_synthetic_mode_passes_content_through() {
        let f = SyntheticFormatter::new();
        let result = f.postprocess_response(&Response::ok("synthetic", "plain body"), &ctx());
        assert!(result.success);
        assert!(result.extracted_tool_calls.is_empty());
        assert!(result.processed_content.contains("[CONTENT: plain body]"));
    }

    #[test]
    fn test_provider_mode_generates_tools() {
        let f = SyntheticFormatter::new();
        assert!(f.configure(&json!({"simulation_mode": "openai"})));
        let result = f.postprocess_response(&Response::ok("synthetic", "hi"), &ctx());
        assert!(result.success);
        assert_eq!(result.extracted_tool_calls.len(), 2);
        assert_eq!(result.metadata["simulated_provider"], "openai");
    }

    #[test]
    fn test_unknown_mode_is_ignored() {
        let f = SyntheticFormatter::new();
        assert!(f.configure(&json!({"simulation_mode": "nope"})));
        assert_eq!(f.configuration()["simulation_mode"], "synthetic");
    }

    #[test]
    fn test_thread_safety_self_test() {
        let f = SyntheticFormatter::new();
        let report = f.validate_thread_safety();
        assert_eq!(report["passed"], true);
        assert_eq!(report["total_operations"], 40);
    }

    #[test]
    fn test_regression_analysis_uses_baselines() {
        let f = SyntheticFormatter::new();
        let report = f.analyze_performance_regression();
        assert_eq!(report["regression_anthropic"]["baseline_us"], 45_000.0);
        assert_eq!(report["regression_cerebras"]["regression_detected"], false);
        assert_eq!(f.generate_test_scenarios().len(), 10);
    }

    #[test]
    fn test_benchmark_suite_reports_each_provider() {
        let f = SyntheticFormatter::new();
        let report = f.run_benchmark_suite(3);
        for provider in ["cerebras", "openai", "anthropic", "synthetic"] {
            assert_eq!(report[provider]["iterations"], 3);
        }
        assert_eq!(report["benchmarks_completed"], 1);
    }

    #[test]
    fn test_memory_samples_are_capped() {
        let f = SyntheticFormatter::new();
        assert!(f.configure(&json!({"memory_profiling": true})));
        let runs = MEMORY_SAMPLE_CAP + 20;
        for _ in 0..runs {
            f.postprocess_response(&Response::ok("synthetic", "hi"), &ctx());
        }
        let metrics = f.get_metrics();
        assert_eq!(metrics["memory_samples"], runs);
        assert_eq!(metrics["memory_stats"]["samples"], MEMORY_SAMPLE_CAP);
        assert_eq!(metrics["memory_stats"]["max_bytes"], 10 * 1024);
    }

    #[test]
    fn test_streaming_lifecycle() {
        let f = SyntheticFormatter::new();
        let ctx = ctx().streaming();
        assert!(f.begin_streaming(&ctx));
        let a = f.process_streaming_chunk("{\"part\": 1}", false, &ctx);
        assert_eq!(a.processed_content, "{\"part\": 1}");
        assert_eq!(a.extracted_tool_calls.len(), 1);
        let b = f.process_streaming_chunk("tail", true, &ctx);
        assert_eq!(b.metadata["total_chunks"], 2);
        let end = f.end_streaming(&ctx);
        assert_eq!(end.processed_content, "Synthetic streaming response completed");
        assert_eq!(end.extracted_tool_calls.len(), 2);
        assert_eq!(end.metadata["chunk_count"], 2);
        assert!(!f.end_streaming(&ctx).success);
    }
}
