use thiserror::Error;

/// A convenience `Result` alias using [`PrismError`].
pub type PrismResult<T> = Result<T, PrismError>;

/// Top-level error type shared by every prism crate.
///
/// Formatters never surface this type across their boundary; they report
/// failures inside a [`ProcessingResult`](crate::ProcessingResult). It is used
/// by the engine, the codec and the registry where a value is returned.
#[derive(Error, Debug)]
pub enum PrismError {
    /// A formatter refused or failed an operation.
    #[error("Formatter error: {0}")]
    Formatter(String),

    /// A streaming engine failure.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid or unparsable TOON text.
    #[error("TOON error: {0}")]
    Toon(String),

    /// A plugin registry failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Content rejected by a security screen.
    #[error("Security error: {0}")]
    Security(String),

    /// A capacity limit was reached (streams, buffers, backpressure).
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Lookup of an unknown stream, plugin or provider.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes placed in `metadata["error_code"]` of failed results.
pub mod codes {
    /// Input exceeded a formatter's byte ceiling.
    pub const INPUT_TOO_LARGE: &str = "input_too_large";
    /// A malicious pattern was detected.
    pub const SECURITY_VIOLATION: &str = "security_violation";
    /// Malformed JSON or XML with no recovery path.
    pub const PARSE_ERROR: &str = "parse_error";
    /// Generic processing failure.
    pub const PROCESSING_ERROR: &str = "processing_error";
    /// Request or configuration validation failed.
    pub const VALIDATION_ERROR: &str = "validation_error";
    /// Streaming hook misuse or failure.
    pub const STREAMING_ERROR: &str = "streaming_error";
    /// Deliberately injected by the synthetic formatter.
    pub const SYNTHETIC_ERROR: &str = "synthetic_error";
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PrismError::NotFound("stream_1".to_string());
        assert_eq!(err.to_string(), "Not found: stream_1");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{bad");
        let err: PrismError = parse.unwrap_err().into();
        assert!(matches!(err, PrismError::Json(_)));
    }
}
