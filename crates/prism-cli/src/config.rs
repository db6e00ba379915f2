//! `prism.toml` loading.
//!
//! Every section is optional. A missing file yields the defaults so the
//! binary runs without any configuration.

use prism_core::{PrismError, PrismResult};
use prism_stream::ProcessorConfig;
use prism_toon::ToonConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

fn default_log_level() -> String {
    "info".to_string()
}

/// Parsed `prism.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PrismConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins over it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Streaming engine options.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Codec options.
    #[serde(default)]
    pub toon: ToonConfig,
    /// Per-formatter option tables, keyed by formatter name.
    #[serde(default)]
    pub formatters: BTreeMap<String, serde_json::Value>,
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            processor: ProcessorConfig::default(),
            toon: ToonConfig::default(),
            formatters: BTreeMap::new(),
        }
    }
}

/// Reads and parses `path`. A file that does not exist gives the defaults.
pub fn load_config(path: &Path) -> PrismResult<PrismConfig> {
    if !path.exists() {
        return Ok(PrismConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        PrismError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    let config: PrismConfig = toml::from_str(&content).map_err(|e| {
        PrismError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })?;
    config.processor.validate()?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use prism_stream::ChunkOrdering;
    use std::io::Write;

    #[test]
    fn test_parse_all_sections() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
log_level = "debug"

[processor]
thread_pool_size = 8
ordering = "per_stream"

[toon]
include_thinking = false

[formatters.cerebras-speed-formatter]
max_processing_time_ms = 5
"#
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.processor.thread_pool_size, 8);
        assert_eq!(config.processor.ordering, ChunkOrdering::PerStream);
        assert_eq!(config.processor.backpressure_threshold, 1000);
        assert!(!config.toon.include_thinking);
        assert!(config.toon.include_tools);
        assert_eq!(
            config.formatters["cerebras-speed-formatter"]["max_processing_time_ms"],
            5
        );
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut()).unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.processor, ProcessorConfig::default());
        assert!(config.formatters.is_empty());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/path/prism.toml")).unwrap();
        assert_eq!(config.processor.thread_pool_size, 4);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = load_config(tmp.path()).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config"), "unexpected error: {err}");
    }

    #[test]
    fn test_out_of_range_processor_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[processor]\nthread_pool_size = 64").unwrap();
        assert!(matches!(
            load_config(tmp.path()),
            Err(PrismError::Config(_))
        ));
    }
}
