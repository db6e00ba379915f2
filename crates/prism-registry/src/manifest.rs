//! Plugin manifests and per-plugin bookkeeping.

use chrono::{DateTime, Utc};
use prism_core::{Formatter, PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Metadata describing a plugin's identity and what it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique lookup name.
    pub name: String,
    /// `major.minor.patch`.
    pub version: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Author or vendor.
    #[serde(default)]
    pub author: String,
    /// Providers whose responses the plugin understands.
    #[serde(default)]
    pub providers: Vec<String>,
    /// Input formats understood.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Free-form capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Names of plugins that must be registered first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Oldest host version the plugin runs on; empty for any.
    #[serde(default)]
    pub min_version: String,
}

impl PluginManifest {
    /// Minimal manifest with a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            providers: Vec::new(),
            formats: Vec::new(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            min_version: String::new(),
        }
    }

    /// Manifest derived from a formatter's own self-description.
    pub fn from_formatter(formatter: &dyn Formatter) -> Self {
        let owned = |list: &[&'static str]| list.iter().map(|s| (*s).to_string()).collect();
        Self {
            name: formatter.name().to_string(),
            version: formatter.version().to_string(),
            description: formatter.description().to_string(),
            author: "prism".to_string(),
            providers: owned(formatter.supported_providers()),
            formats: owned(formatter.supported_formats()),
            capabilities: owned(formatter.capabilities()),
            dependencies: Vec::new(),
            min_version: String::new(),
        }
    }

    /// Checks the name and the `major.minor.patch` versions.
    pub fn validate(&self) -> PrismResult<()> {
        if self.name.trim().is_empty() {
            return Err(PrismError::Registry("Plugin name is empty".into()));
        }
        if !is_semver(&self.version) {
            return Err(PrismError::Registry(format!(
                "Plugin {} has invalid version '{}'",
                self.name, self.version
            )));
        }
        if !self.min_version.is_empty() && !is_semver(&self.min_version) {
            return Err(PrismError::Registry(format!(
                "Plugin {} has invalid min_version '{}'",
                self.name, self.min_version
            )));
        }
        Ok(())
    }

    /// Whether the plugin declares `provider`.
    pub fn handles_provider(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }

    /// Whether the plugin declares `format`.
    pub fn handles_format(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f == format)
    }
}

/// Bookkeeping kept for each registered plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Manifest given at registration.
    pub manifest: PluginManifest,
    /// Identifier assigned at registration.
    pub plugin_id: Uuid,
    /// Registration time.
    pub loaded_at: DateTime<Utc>,
    /// Last lookup through `get_prettifier`.
    pub last_used: DateTime<Utc>,
    /// Lookups through `get_prettifier`.
    pub usage_count: u64,
    /// Disabled plugins are skipped by every lookup.
    pub enabled: bool,
}

impl PluginMetadata {
    pub(crate) fn new(manifest: PluginManifest) -> Self {
        let now = Utc::now();
        Self {
            manifest,
            plugin_id: Uuid::new_v4(),
            loaded_at: now,
            last_used: now,
            usage_count: 0,
            enabled: true,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.usage_count += 1;
        self.last_used = Utc::now();
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct PluginLoadResult {
    /// Registered name.
    pub plugin_name: String,
    /// Assigned identifier.
    pub plugin_id: Uuid,
    /// Time spent validating and inserting.
    pub load_time: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_semver() {
        assert!(PluginManifest::new("a", "1.2.3").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        assert!(PluginManifest::new("", "1.0.0").validate().is_err());
        assert!(PluginManifest::new("a", "1.0").validate().is_err());
        assert!(PluginManifest::new("a", "1.x.0").validate().is_err());
        let mut m = PluginManifest::new("a", "1.0.0");
        m.min_version = "latest".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_manifest_deserializes_with_defaults() {
        let m: PluginManifest =
            serde_json::from_str(r#"{"name":"x","version":"0.1.0","providers":["openai"]}"#)
                .unwrap();
        assert!(m.handles_provider("openai"));
        assert!(!m.handles_format("json"));
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn test_touch_counts_usage() {
        let mut meta = PluginMetadata::new(PluginManifest::new("a", "1.0.0"));
        assert!(meta.enabled);
        meta.touch();
        meta.touch();
        assert_eq!(meta.usage_count, 2);
        assert!(meta.last_used >= meta.loaded_at);
    }
}
