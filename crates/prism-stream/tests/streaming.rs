#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests for the streaming engine: many streams over one pool.

use futures_util::future::join_all;
use prism_core::{Formatter, ProcessingContext, ProcessingResult, Request, Response};
use prism_formatters::{
    AnthropicFormatter, CerebrasFormatter, OpenAiFormatter, ToolCallExtractor,
};
use prism_stream::{
    optimize_for_latency, optimize_for_memory, optimize_for_throughput, ChunkOrdering,
    ProcessorConfig, StreamProcessor,
};
use prism_toon::ToonCodec;
use std::sync::Arc;

/// Passes chunks through untouched.
struct Echo;

impl Formatter for Echo {
    fn name(&self) -> &str {
        "echo"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn description(&self) -> &str {
        "echo"
    }
    fn supported_formats(&self) -> &[&'static str] {
        &["text"]
    }
    fn output_formats(&self) -> &[&'static str] {
        &["text"]
    }
    fn supported_providers(&self) -> &[&'static str] {
        &["test"]
    }
    fn capabilities(&self) -> &[&'static str] {
        &["streaming"]
    }
    fn preprocess_request(&self, request: &Request) -> ProcessingResult {
        ProcessingResult::success(request.data.to_string(), "json")
    }
    fn postprocess_response(
        &self,
        response: &Response,
        _context: &ProcessingContext,
    ) -> ProcessingResult {
        ProcessingResult::success(response.data.clone(), "text")
    }
}

fn processor(config: ProcessorConfig) -> Arc<StreamProcessor> {
    Arc::new(StreamProcessor::new(config).unwrap())
}

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        thread_pool_size: 4,
        buffer_size_mb: 4,
        ..Default::default()
    }
}

fn content_of(result: &ProcessingResult) -> String {
    ToonCodec::default()
        .decode(&result.processed_content)
        .unwrap()
        .content
        .content
}

// ---------------------------------------------------------------------------
// Throughput and accounting
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hundred_chunks_across_ten_streams() {
    let p = processor(test_config());
    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(
            p.create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
                .unwrap(),
        );
    }

    // Finals go last so no stream closes while its own chunks are queued.
    let mut tickets = Vec::new();
    for i in 0..9 {
        for id in &ids {
            tickets.push(p.process_chunk(id, format!("c{i};"), false));
        }
    }
    assert!(join_all(tickets).await.into_iter().all(|ok| ok));
    let finals: Vec<_> = ids.iter().map(|id| p.process_chunk(id, "end", true)).collect();
    assert!(join_all(finals).await.into_iter().all(|ok| ok));

    let stats = p.statistics();
    assert_eq!(stats.total_chunks_processed, 100);
    assert_eq!(stats.completed_streams, 10);
    assert_eq!(
        stats.total_streams,
        stats.completed_streams + stats.failed_streams + stats.active_streams
    );

    for id in ids {
        let p = Arc::clone(&p);
        let result = tokio::task::spawn_blocking(move || p.get_result(&id))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["total_chunks"], 10);
        assert!(result.streaming_mode);
    }
    assert!(p.active_stream_ids().is_empty());
    assert_eq!(p.statistics().current_memory_usage, 0);
}

#[test]
fn test_counters_balance_with_mixed_outcomes() {
    let p = processor(test_config());
    let done = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    let cancelled = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    let _open = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();

    assert!(p.process_chunk(&done, "x", true).wait());
    assert!(p.cancel_stream(&cancelled));

    let stats = p.statistics();
    assert_eq!(stats.total_streams, 3);
    assert_eq!(stats.completed_streams, 1);
    assert_eq!(stats.failed_streams, 1);
    assert_eq!(stats.active_streams, 1);
    assert!((stats.success_rate() - 0.5).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Backpressure and capacity
// ---------------------------------------------------------------------------

#[test]
fn test_backpressure_sheds_past_threshold() {
    let p = processor(ProcessorConfig {
        backpressure_threshold: 5,
        ..test_config()
    });
    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    let accepted: Vec<bool> = (0..5)
        .map(|i| p.process_chunk(&id, format!("{i}"), false))
        .map(|t| t.wait())
        .collect();
    assert!(accepted.iter().all(|ok| *ok));
    assert!(!p.process_chunk(&id, "overflow", false).wait());
    assert_eq!(p.statistics().backpressure_events, 1);
    assert_eq!(p.statistics().total_chunks_processed, 5);
    assert!(p.is_stream_active(&id));
}

#[test]
fn test_stream_capacity() {
    let p = processor(ProcessorConfig {
        max_concurrent_streams: 2,
        ..test_config()
    });
    let a = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    p.create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert!(p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .is_err());

    // Collecting a result frees the slot.
    assert!(p.cancel_stream(&a));
    assert!(!p.get_result(&a).success);
    assert!(p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .is_ok());
}

#[test]
fn test_full_stream_table_sheds_chunks() {
    let p = processor(ProcessorConfig {
        max_concurrent_streams: 2,
        ..test_config()
    });
    let a = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert!(p.process_chunk(&a, "below cap ", false).wait());
    let b = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert_eq!(p.active_stream_ids().len(), 2);

    // Exactly at the cap: chunks are shed without enqueueing.
    assert!(!p.process_chunk(&a, "shed", false).wait());
    assert!(!p.process_chunk(&b, "shed", true).wait());
    assert_eq!(p.statistics().backpressure_events, 2);
    assert!(p.is_stream_active(&a));

    // One slot free again: chunks flow.
    assert!(p.cancel_stream(&b));
    p.get_result(&b);
    assert!(p.process_chunk(&a, "after", true).wait());
    let result = p.get_result(&a);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(content_of(&result), "below cap after");
}

// ---------------------------------------------------------------------------
// Ordering and lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_per_stream_ordering_preserves_submission_order() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    let tickets: Vec<_> = (0..50)
        .map(|i| p.process_chunk(&id, format!("{i},"), false))
        .collect();
    let last = p.process_chunk(&id, "done", true);
    assert!(tickets.into_iter().all(|t| t.wait()));
    assert!(last.wait());

    let result = p.get_result(&id);
    let expected: String = (0..50).map(|i| format!("{i},")).collect::<String>() + "done";
    assert_eq!(content_of(&result), expected);
}

#[test]
fn test_relaxed_ordering_keeps_every_chunk() {
    let p = processor(test_config());
    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    let tickets: Vec<_> = (0..20)
        .map(|i| p.process_chunk(&id, format!("<{i}>"), false))
        .collect();
    assert!(tickets.into_iter().all(|t| t.wait()));
    assert!(p.process_chunk(&id, "", true).wait());

    let content = content_of(&p.get_result(&id));
    for i in 0..20 {
        assert!(content.contains(&format!("<{i}>")));
    }
}

#[test]
fn test_result_is_collected_once() {
    let p = processor(test_config());
    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert!(p.process_chunk(&id, "only", true).wait());
    assert!(p.get_result(&id).success);
    let second = p.get_result(&id);
    assert!(!second.success);
    assert_eq!(
        second.error_message.unwrap(),
        format!("Stream not found: {id}")
    );
    assert!(!p.process_chunk(&id, "late", false).wait());
}

#[test]
fn test_unknown_stream_rejected() {
    let p = processor(test_config());
    assert!(!p.process_chunk("stream_0_0_1000", "x", false).wait());
    assert!(!p.is_stream_active("stream_0_0_1000"));
    assert!(!p.cancel_stream("stream_0_0_1000"));
}

// ---------------------------------------------------------------------------
// Formatter integration
// ---------------------------------------------------------------------------

#[test]
fn test_anthropic_stream_extracts_tools_at_end() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("anthropic", "claude-sonnet"),
            Arc::new(AnthropicFormatter::new()),
        )
        .unwrap();
    let parts = [
        "Checking the weather. ",
        "<function_calls><invoke name=\"get_weather\">",
        "<parameter name=\"location\">Paris</parameter>",
        "</invoke></function_calls>",
    ];
    let tickets: Vec<_> = parts
        .iter()
        .enumerate()
        .map(|(i, part)| p.process_chunk(&id, *part, i == parts.len() - 1))
        .collect();
    assert!(tickets.into_iter().all(|t| t.wait()));

    let result = p.get_result(&id);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(result.extracted_tool_calls[0].name, "get_weather");
    let doc = ToonCodec::default().decode(&result.processed_content).unwrap();
    assert_eq!(doc.tools.len(), 1);
    assert_eq!(doc.metadata["provider"], "anthropic");
    assert_eq!(doc.metadata["streaming_complete"], "true");
}

#[test]
fn test_extractor_stream_keeps_accumulated_text() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("openai", "gpt-4o"),
            Arc::new(ToolCallExtractor::new()),
        )
        .unwrap();
    assert!(p.process_chunk(&id, "plain ", false).wait());
    assert!(p.process_chunk(&id, "text", true).wait());
    let result = p.get_result(&id);
    assert!(result.success);
    assert_eq!(content_of(&result), "plain text");
}

#[test]
fn test_second_final_does_not_duplicate_tools() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("anthropic", "claude-sonnet"),
            Arc::new(AnthropicFormatter::new()),
        )
        .unwrap();
    assert!(p
        .process_chunk(&id, "<function_calls><invoke name=\"get_weather\">", false)
        .wait());
    assert!(p
        .process_chunk(
            &id,
            "<parameter name=\"location\">Paris</parameter></invoke></function_calls>",
            true
        )
        .wait());
    assert!(!p.process_chunk(&id, "late final", true).wait());

    let result = p.get_result(&id);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(p.statistics().completed_streams, 1);
}

#[test]
fn test_cerebras_stream_reports_tool_once() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("cerebras", "llama3.1-8b"),
            Arc::new(CerebrasFormatter::new()),
        )
        .unwrap();
    assert!(p
        .process_chunk(&id, r#"{"choices":[{"message":{"content":null,"#, false)
        .wait());
    assert!(p
        .process_chunk(
            &id,
            r#""tool_calls":[{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"Paris\"}"}}]}}]}"#,
            true,
        )
        .wait());

    let result = p.get_result(&id);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(result.extracted_tool_calls[0].name, "get_weather");
    let doc = ToonCodec::default().decode(&result.processed_content).unwrap();
    assert_eq!(doc.tools.len(), 1);
}

#[test]
fn test_openai_sse_stream_reports_tool_once() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("openai", "gpt-4o"),
            Arc::new(OpenAiFormatter::new()),
        )
        .unwrap();
    let parts = [
        "data: {\"choices\":[{\"delta\":{\"content\":\"Looking up\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"loc\"}}]}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ation\\\":\\\"Oslo\\\"}\"}}]}}]}\ndata: [DONE]\n",
    ];
    let tickets: Vec<_> = parts
        .iter()
        .enumerate()
        .map(|(i, part)| p.process_chunk(&id, *part, i == parts.len() - 1))
        .collect();
    assert!(tickets.into_iter().all(|t| t.wait()));

    let result = p.get_result(&id);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(result.extracted_tool_calls[0].parameters["location"], "Oslo");
    assert_eq!(content_of(&result), "Looking up");
}

#[test]
fn test_extractor_stream_reports_tool_once() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let id = p
        .create_stream(
            ProcessingContext::new("openai", "gpt-4o"),
            Arc::new(ToolCallExtractor::new()),
        )
        .unwrap();
    assert!(p
        .process_chunk(&id, r#"{"choices":[{"message":{"tool_calls":[{"id":"call_123","#, false)
        .wait());
    assert!(p
        .process_chunk(
            &id,
            r#""function":{"name":"get_weather","arguments":"{\"location\":\"New York\"}"}}]}}]}"#,
            true,
        )
        .wait());

    let result = p.get_result(&id);
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.extracted_tool_calls.len(), 1);
    assert_eq!(result.extracted_tool_calls[0].id, "call_123");
}

// ---------------------------------------------------------------------------
// Shared formatter instances
// ---------------------------------------------------------------------------

#[test]
fn test_interleaved_streams_share_one_formatter() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let shared = Arc::new(AnthropicFormatter::new());
    let a = p
        .create_stream(ProcessingContext::new("anthropic", "claude"), shared.clone())
        .unwrap();
    let b = p
        .create_stream(ProcessingContext::new("anthropic", "claude"), shared.clone())
        .unwrap();

    assert!(p.process_chunk(&a, "alpha ", false).wait());
    assert!(p.process_chunk(&b, "BRAVO ", false).wait());
    assert!(p.process_chunk(&a, "end-a", true).wait());
    assert!(p.process_chunk(&b, "end-b", true).wait());

    let first = p.get_result(&a);
    let second = p.get_result(&b);
    assert!(first.success, "{:?}", first.error_message);
    assert!(second.success, "{:?}", second.error_message);
    assert_eq!(content_of(&first), "alpha end-a");
    assert_eq!(content_of(&second), "BRAVO end-b");
    assert_eq!(shared.get_diagnostics()["active_streams"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_streams_share_one_extractor() {
    let p = processor(ProcessorConfig {
        ordering: ChunkOrdering::PerStream,
        ..test_config()
    });
    let shared = Arc::new(ToolCallExtractor::new());
    let ids: Vec<String> = (0..8)
        .map(|_| {
            p.create_stream(ProcessingContext::new("mistral", "m"), shared.clone())
                .unwrap()
        })
        .collect();

    let mut tickets = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        tickets.push(p.process_chunk(
            id,
            format!("I will call {{\"tool\": \"calc_{i}\", "),
            false,
        ));
    }
    for (i, id) in ids.iter().enumerate() {
        tickets.push(p.process_chunk(id, format!("\"args\": {{\"x\": {i}}}}}"), false));
    }
    assert!(join_all(tickets).await.into_iter().all(|ok| ok));
    let finals: Vec<_> = ids.iter().map(|id| p.process_chunk(id, " now.", true)).collect();
    assert!(join_all(finals).await.into_iter().all(|ok| ok));

    for (i, id) in ids.iter().enumerate() {
        let result = p.get_result(id);
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.extracted_tool_calls.len(), 1, "stream {i}");
        assert_eq!(result.extracted_tool_calls[0].name, format!("calc_{i}"));
        assert_eq!(result.extracted_tool_calls[0].parameters["x"], i);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn test_presets_apply_through_configure() {
    let p = processor(test_config());
    let base = p.configuration();

    p.configure(optimize_for_throughput(&base)).unwrap();
    assert_eq!(p.configuration().thread_pool_size, 8);

    p.configure(optimize_for_latency(&p.configuration())).unwrap();
    assert_eq!(p.configuration().thread_pool_size, 4);

    p.configure(optimize_for_memory(&p.configuration())).unwrap();
    let tuned = p.configuration();
    assert_eq!(tuned.thread_pool_size, 2);
    assert!(tuned.enable_compression);
    assert_eq!(p.diagnostics()["thread_pool"]["worker_threads"], 2);

    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert!(p.process_chunk(&id, "still works", true).wait());
    assert!(p.get_result(&id).success);
}

#[test]
fn test_reset_statistics_keeps_stream_totals() {
    let p = processor(test_config());
    let id = p
        .create_stream(ProcessingContext::new("test", "m"), Arc::new(Echo))
        .unwrap();
    assert!(p.process_chunk(&id, "abc", true).wait());
    p.reset_statistics();
    let stats = p.statistics();
    assert_eq!(stats.total_chunks_processed, 0);
    assert_eq!(stats.total_bytes_processed, 0);
    assert_eq!(stats.total_streams, 1);
    assert_eq!(stats.completed_streams, 1);
    assert_eq!(p.health_check()["overall_healthy"], true);
}
