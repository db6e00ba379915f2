#![allow(clippy::unwrap_used, clippy::expect_used)]

use prism_core::{codes, Formatter, ProcessingContext, Response, ToolStatus};
use prism_formatters::{
    builtin_formatters, builtin_registry, formatter_for_provider, AnthropicFormatter,
    CerebrasFormatter, MarkdownNormalizer, OpenAiFormatter, SyntheticFormatter, ToolCallExtractor,
};
use prism_toon::ToonCodec;
use serde_json::json;

fn decode(text: &str) -> prism_toon::ToonDocument {
    ToonCodec::default().decode(text).unwrap()
}

// ---------------------------------------------------------------------------
// Provider extraction
// ---------------------------------------------------------------------------

#[test]
fn test_openai_weather_call_through_postprocess() {
    let f = OpenAiFormatter::new();
    let ctx = ProcessingContext::new("openai", "gpt-4o");
    let body = r#"{"choices":[{"message":{"tool_calls":[{"id":"call_123","function":{"name":"get_weather","arguments":"{\"location\":\"New York\"}"}}]}}]}"#;
    let result = f.postprocess_response(&Response::ok("openai", body), &ctx);

    assert!(result.success);
    assert_eq!(result.output_format, "toon");
    assert_eq!(result.extracted_tool_calls.len(), 1);
    let call = &result.extracted_tool_calls[0];
    assert_eq!(call.name, "get_weather");
    assert_eq!(call.id, "call_123");
    assert_eq!(call.parameters["location"], "New York");
    assert_eq!(call.status, ToolStatus::Completed);

    let doc = decode(&result.processed_content);
    assert_eq!(doc.tools.len(), 1);
    assert_eq!(doc.tools[0].id, "call_123");
}

#[test]
fn test_anthropic_xml_call_and_thinking() {
    let f = AnthropicFormatter::new();
    let ctx = ProcessingContext::new("anthropic", "claude-sonnet");
    let text = "<thinking>step 1\nstep 2</thinking>\nFinal answer.\n<function_calls><invoke name=\"extract_data\"><parameter name=\"content\">Test data</parameter></invoke></function_calls>";
    let result = f.postprocess_response(&Response::ok("anthropic", text), &ctx);

    assert!(result.success);
    assert!(result.reasoning.as_deref().is_some_and(|r| !r.is_empty()));
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(result.extracted_tool_calls[0].name, "extract_data");
    assert_eq!(result.extracted_tool_calls[0].parameters["content"], "Test data");

    let doc = decode(&result.processed_content);
    assert!(doc.content.content.contains("Final answer."));
    assert!(!doc.content.content.contains("<thinking>"));
    assert!(doc.thinking.is_some());
}

#[test]
fn test_cerebras_fast_failover_keeps_input() {
    let f = CerebrasFormatter::new();
    assert!(f.configure(&json!({"max_processing_time_ms": 0})));
    let ctx = ProcessingContext::new("cerebras", "llama3.1-8b");
    let raw = r#"{"choices":[{"message":{"content":"fast"}}]}"#;
    let result = f.postprocess_response(&Response::ok("cerebras", raw), &ctx);
    assert!(result.success);
    assert_eq!(result.metadata["fast_failover"], true);
    assert_eq!(result.processed_content, raw);
}

#[test]
fn test_extractor_agrees_with_provider_adapters() {
    let extractor = ToolCallExtractor::new();
    let xml = r#"<function_calls><invoke name="extract_data"><parameter name="content">Test data</parameter></invoke></function_calls>"#;
    let calls = extractor.extract_tool_calls(xml, "anthropic");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters["content"], "Test data");
}

// ---------------------------------------------------------------------------
// Error surfaces
// ---------------------------------------------------------------------------

#[test]
fn test_provider_error_is_processing_error() {
    let ctx = ProcessingContext::new("openai", "gpt-4o");
    for f in builtin_formatters() {
        if f.name() == "synthetic-diagnostic-formatter" {
            continue;
        }
        let result = f.postprocess_response(&Response::error("openai", 502, "bad gateway"), &ctx);
        assert!(!result.success, "{} accepted a failed response", f.name());
        assert_eq!(result.error_code(), Some(codes::PROCESSING_ERROR));
    }
}

#[test]
fn test_streaming_without_begin_fails() {
    let ctx = ProcessingContext::new("openai", "gpt-4o").streaming();
    let f = MarkdownNormalizer::new();
    let result = f.process_streaming_chunk("x", false, &ctx);
    assert_eq!(result.error_code(), Some(codes::STREAMING_ERROR));
}

// ---------------------------------------------------------------------------
// Registry wiring
// ---------------------------------------------------------------------------

#[test]
fn test_builtin_registry_holds_all_formatters() {
    let registry = builtin_registry().unwrap();
    assert_eq!(registry.plugin_count(), 6);
    for provider in ["anthropic", "openai", "cerebras", "synthetic"] {
        let name = formatter_for_provider(provider).unwrap();
        let f = registry.get_prettifier(name).unwrap();
        assert!(f.supported_providers().contains(&provider));
        assert!(!registry.get_plugins_for_provider(provider).is_empty());
    }
    assert!(formatter_for_provider("mistral").is_none());
    assert_eq!(registry.health_check()["status"], "healthy");
}

#[test]
fn test_configuration_export_import() {
    let registry = builtin_registry().unwrap();
    let mut exported = registry.export_configuration();
    exported["plugins"]["cerebras-speed-formatter"]["configuration"]["max_processing_time_ms"] =
        json!(5);
    assert_eq!(registry.import_configuration(&exported).unwrap(), 6);
    let cerebras = registry.get_prettifier("cerebras-speed-formatter").unwrap();
    assert_eq!(cerebras.configuration()["max_processing_time_ms"], 5);
}

#[test]
fn test_synthetic_self_checks() {
    let f = SyntheticFormatter::new();
    assert_eq!(f.validate_thread_safety()["failed_operations"], 0);
    let body = f.simulate_provider_response("openai", "hello");
    let result = f.postprocess_response(
        &Response::ok("synthetic", body),
        &ProcessingContext::new("synthetic", "synthetic-model"),
    );
    assert!(result.success);
}
