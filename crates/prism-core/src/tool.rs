use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an extracted tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Extracted but not yet run.
    #[default]
    Pending,
    /// Currently running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or could not be validated.
    Failed,
}

impl ToolStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Executing => "executing",
            ToolStatus::Completed => "completed",
            ToolStatus::Failed => "failed",
        }
    }

    /// Parse a wire name. Unknown names map to [`ToolStatus::Pending`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "executing" => ToolStatus::Executing,
            "completed" => ToolStatus::Completed,
            "failed" => ToolStatus::Failed,
            _ => ToolStatus::Pending,
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation found in a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name as requested by the model.
    pub name: String,
    /// Provider-assigned identifier, or a generated one.
    pub id: String,
    /// Structured arguments.
    pub parameters: serde_json::Value,
    /// Result payload, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: ToolStatus,
    /// When the call was extracted.
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    /// Creates a pending call with a generated id.
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            id: generate_call_id(),
            parameters,
            result: None,
            status: ToolStatus::Pending,
            timestamp: Utc::now(),
        }
    }

    /// Replaces the id, keeping the generated one when `id` is empty.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.id = id;
        }
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: ToolStatus) -> Self {
        self.status = status;
        self
    }

    /// Attaches a result payload.
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// JSON view used in diagnostics and the codec's data view.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "name": self.name,
            "id": self.id,
            "parameters": self.parameters,
            "status": self.status.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
        });
        if let Some(result) = &self.result {
            value["result"] = result.clone();
        }
        value
    }
}

/// Generates a `call_<12 hex>` identifier.
pub fn generate_call_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("call_{}", &simple[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ToolStatus::Pending,
            ToolStatus::Executing,
            ToolStatus::Completed,
            ToolStatus::Failed,
        ] {
            assert_eq!(ToolStatus::parse(status.as_str()), status);
        }
        assert_eq!(ToolStatus::parse("bogus"), ToolStatus::Pending);
    }

    #[test]
    fn test_new_call_generates_id() {
        let call = ToolCall::new("search", serde_json::json!({"q": "rust"}));
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.id.len(), 17);
        assert_eq!(call.status, ToolStatus::Pending);
    }

    #[test]
    fn test_with_id_ignores_empty() {
        let call = ToolCall::new("search", serde_json::json!({})).with_id("");
        assert!(call.id.starts_with("call_"));
        let call = call.with_id("call_123");
        assert_eq!(call.id, "call_123");
    }

    #[test]
    fn test_to_json_includes_result() {
        let call = ToolCall::new("calc", serde_json::json!({"x": 1}))
            .with_status(ToolStatus::Completed)
            .with_result(serde_json::json!(2));
        let json = call.to_json();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"], 2);
    }
}
