use serde::{Deserialize, Serialize};

/// Outbound request as handed over by the HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Target model.
    #[serde(default)]
    pub model: String,
    /// API method (`chat`, `completion`, ...).
    #[serde(default)]
    pub method: String,
    /// Provider-shaped request body.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Request {
    /// Wraps a request body.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            model: data["model"].as_str().unwrap_or_default().to_string(),
            method: "chat".to_string(),
            data,
        }
    }
}

/// Provider response as handed over by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Whether the provider call succeeded.
    #[serde(default)]
    pub success: bool,
    /// Raw response body.
    #[serde(default)]
    pub data: String,
    /// Provider error text.
    #[serde(default)]
    pub error_message: String,
    /// HTTP status code.
    #[serde(default)]
    pub status_code: u16,
    /// Round-trip latency.
    #[serde(default)]
    pub response_time_ms: f64,
    /// Provider that answered.
    #[serde(default)]
    pub provider_name: String,
}

impl Response {
    /// A successful 200 response carrying `data`.
    pub fn ok(provider: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error_message: String::new(),
            status_code: 200,
            response_time_ms: 0.0,
            provider_name: provider.into(),
        }
    }

    /// A failed response with the given status and message.
    pub fn error(provider: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: String::new(),
            error_message: message.into(),
            status_code,
            response_time_ms: 0.0,
            provider_name: provider.into(),
        }
    }
}
