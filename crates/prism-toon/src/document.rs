use prism_core::ToolCall;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// The CONTENT section of a document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToonContent {
    /// `[TYPE: …]`: `json`, `markdown` or `text`.
    pub content_type: String,
    /// `[FORMAT: …]`: `complete` or `error`, when present.
    pub format: Option<String>,
    /// The unescaped payload.
    pub content: String,
}

impl ToonContent {
    /// Plain text content with format `complete`.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            format: Some("complete".to_string()),
            content: content.into(),
        }
    }
}

/// Structured form of a TOON document.
///
/// Built by the encoding helpers and produced by
/// [`ToonCodec::decode`](crate::ToonCodec::decode).
#[derive(Debug, Clone, Default)]
pub struct ToonDocument {
    /// META entries. Keys are emitted in sorted order.
    pub metadata: BTreeMap<String, String>,
    /// CONTENT section.
    pub content: ToonContent,
    /// TOOLS records in order.
    pub tools: Vec<ToolCall>,
    /// THINKING reasoning.
    pub thinking: Option<String>,
    /// Time spent decoding; zero for documents built in memory.
    pub parse_time: Duration,
}

impl ToonDocument {
    /// A document holding only `content`.
    pub fn new(content: ToonContent) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    /// Adds a META entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// JSON view of the whole document.
    pub fn data(&self) -> serde_json::Value {
        serde_json::json!({
            "metadata": self.metadata,
            "content": {
                "type": self.content.content_type,
                "format": self.content.format,
                "content": self.content.content,
            },
            "tools": self.tools.iter().map(ToolCall::to_json).collect::<Vec<_>>(),
            "thinking": self.thinking,
        })
    }
}

/// Size report for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    /// Header name.
    pub name: String,
    /// Body size in bytes.
    pub size_bytes: usize,
    /// Body line count.
    pub line_count: usize,
}

/// Size report for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToonAnalysis {
    /// Whole document size in bytes.
    pub total_size_bytes: usize,
    /// Whole document line count.
    pub line_count: usize,
    /// Per-section reports in document order.
    pub sections: Vec<SectionInfo>,
    /// Number of sections.
    pub section_count: usize,
}
