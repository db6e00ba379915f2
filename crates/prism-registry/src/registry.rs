//! Name-keyed formatter table.

use crate::manifest::{PluginLoadResult, PluginManifest, PluginMetadata};
use chrono::Utc;
use parking_lot::RwLock;
use prism_core::{Formatter, PrismError, PrismResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Called with a plugin name after it is registered or unloaded.
pub type PluginCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry {
    formatter: Arc<dyn Formatter>,
    metadata: PluginMetadata,
}

#[derive(Default)]
struct Counters {
    registrations: AtomicU64,
    failed_registrations: AtomicU64,
    unloads: AtomicU64,
    lookups: AtomicU64,
    lookup_misses: AtomicU64,
}

/// Central registry for all available formatters.
///
/// Every method takes `&self`; the table sits behind a reader/writer lock
/// and the registry can be shared through an `Arc`.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Entry>>,
    on_loaded: RwLock<Option<PluginCallback>>,
    on_unloaded: RwLock<Option<PluginCallback>>,
    counters: Counters,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            on_loaded: RwLock::new(None),
            on_unloaded: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Registers `formatter` under `manifest.name`.
    ///
    /// Fails on an invalid manifest, a duplicate name or a dependency that
    /// is not registered.
    pub fn register_plugin(
        &self,
        formatter: Arc<dyn Formatter>,
        manifest: PluginManifest,
    ) -> PrismResult<PluginLoadResult> {
        let started = Instant::now();
        let result = self.insert(formatter, manifest, started);
        match &result {
            Ok(loaded) => {
                self.counters.registrations.fetch_add(1, Ordering::Relaxed);
                info!(plugin = %loaded.plugin_name, id = %loaded.plugin_id, "Registered plugin");
                let callback = self.on_loaded.read().clone();
                if let Some(callback) = callback {
                    callback(&loaded.plugin_name);
                }
            }
            Err(e) => {
                self.counters
                    .failed_registrations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Plugin registration rejected");
            }
        }
        result
    }

    fn insert(
        &self,
        formatter: Arc<dyn Formatter>,
        manifest: PluginManifest,
        started: Instant,
    ) -> PrismResult<PluginLoadResult> {
        manifest.validate()?;
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&manifest.name) {
            return Err(PrismError::Registry(format!(
                "Plugin already registered: {}",
                manifest.name
            )));
        }
        if let Some(missing) = manifest
            .dependencies
            .iter()
            .find(|d| !plugins.contains_key(d.as_str()))
        {
            return Err(PrismError::Registry(format!(
                "Plugin {} depends on unregistered plugin {missing}",
                manifest.name
            )));
        }
        let name = manifest.name.clone();
        let metadata = PluginMetadata::new(manifest);
        let plugin_id = metadata.plugin_id;
        plugins.insert(name.clone(), Entry { formatter, metadata });
        Ok(PluginLoadResult {
            plugin_name: name,
            plugin_id,
            load_time: started.elapsed(),
        })
    }

    /// Registers `formatter` with a manifest built from its self-description.
    pub fn register_formatter(
        &self,
        formatter: Arc<dyn Formatter>,
    ) -> PrismResult<PluginLoadResult> {
        let manifest = PluginManifest::from_formatter(formatter.as_ref());
        self.register_plugin(formatter, manifest)
    }

    /// Removes a plugin.
    pub fn unload_plugin(&self, name: &str) -> PrismResult<()> {
        let removed = self.plugins.write().remove(name);
        if removed.is_none() {
            return Err(PrismError::NotFound(format!("Plugin not found: {name}")));
        }
        self.counters.unloads.fetch_add(1, Ordering::Relaxed);
        info!(plugin = %name, "Unloaded plugin");
        let callback = self.on_unloaded.read().clone();
        if let Some(callback) = callback {
            callback(name);
        }
        Ok(())
    }

    /// Enabled formatter named `name`. Counts as a use.
    pub fn get_prettifier(&self, name: &str) -> Option<Arc<dyn Formatter>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let mut plugins = self.plugins.write();
        match plugins.get_mut(name) {
            Some(entry) if entry.metadata.enabled => {
                entry.metadata.touch();
                Some(Arc::clone(&entry.formatter))
            }
            _ => {
                self.counters.lookup_misses.fetch_add(1, Ordering::Relaxed);
                debug!(plugin = %name, "No enabled plugin with this name");
                None
            }
        }
    }

    fn enabled_where(&self, pred: impl Fn(&PluginManifest) -> bool) -> Vec<Arc<dyn Formatter>> {
        let plugins = self.plugins.read();
        let mut found: Vec<(&String, &Entry)> = plugins
            .iter()
            .filter(|(_, e)| e.metadata.enabled && pred(&e.metadata.manifest))
            .collect();
        found.sort_by(|a, b| a.0.cmp(b.0));
        found
            .into_iter()
            .map(|(_, e)| Arc::clone(&e.formatter))
            .collect()
    }

    /// Enabled formatters declaring `provider`, sorted by name.
    pub fn get_plugins_for_provider(&self, provider: &str) -> Vec<Arc<dyn Formatter>> {
        self.enabled_where(|m| m.handles_provider(provider))
    }

    /// Enabled formatters declaring `format`, sorted by name.
    pub fn get_plugins_for_format(&self, format: &str) -> Vec<Arc<dyn Formatter>> {
        self.enabled_where(|m| m.handles_format(format))
    }

    /// Every registered formatter, enabled or not, sorted by name.
    pub fn get_all_plugins(&self) -> Vec<Arc<dyn Formatter>> {
        let plugins = self.plugins.read();
        let mut names: Vec<&String> = plugins.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| plugins.get(n))
            .map(|e| Arc::clone(&e.formatter))
            .collect()
    }

    /// Enables or disables a plugin.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> PrismResult<()> {
        let mut plugins = self.plugins.write();
        let entry = plugins
            .get_mut(name)
            .ok_or_else(|| PrismError::NotFound(format!("Plugin not found: {name}")))?;
        entry.metadata.enabled = enabled;
        info!(plugin = %name, enabled, "Plugin state changed");
        Ok(())
    }

    /// Bookkeeping for one plugin.
    pub fn get_plugin_metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.plugins.read().get(name).map(|e| e.metadata.clone())
    }

    /// Bookkeeping for every plugin, sorted by name.
    pub fn get_all_metadata(&self) -> Vec<PluginMetadata> {
        let mut all: Vec<PluginMetadata> = self
            .plugins
            .read()
            .values()
            .map(|e| e.metadata.clone())
            .collect();
        all.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        all
    }

    /// Number of registered plugins.
    pub fn plugin_count(&self) -> usize {
        self.plugins.read().len()
    }

    /// Installs the callback run after each registration.
    pub fn set_plugin_loaded_callback(&self, callback: PluginCallback) {
        *self.on_loaded.write() = Some(callback);
    }

    /// Installs the callback run after each unload.
    pub fn set_plugin_unloaded_callback(&self, callback: PluginCallback) {
        *self.on_unloaded.write() = Some(callback);
    }

    /// Enabled flags and formatter configuration of every plugin.
    pub fn export_configuration(&self) -> Value {
        let plugins = self.plugins.read();
        let mut out = serde_json::Map::new();
        for (name, entry) in plugins.iter() {
            out.insert(
                name.clone(),
                json!({
                    "enabled": entry.metadata.enabled,
                    "version": entry.metadata.manifest.version,
                    "configuration": entry.formatter.configuration(),
                }),
            );
        }
        json!({
            "exported_at": Utc::now().to_rfc3339(),
            "plugins": out,
        })
    }

    /// Re-applies an exported configuration. Returns how many plugins were
    /// updated; names that are not registered are skipped.
    pub fn import_configuration(&self, config: &Value) -> PrismResult<usize> {
        let entries = config["plugins"]
            .as_object()
            .ok_or_else(|| PrismError::Config("Missing 'plugins' object".into()))?;
        let mut applied = 0;
        for (name, settings) in entries {
            let formatter = {
                let mut plugins = self.plugins.write();
                let Some(entry) = plugins.get_mut(name) else {
                    warn!(plugin = %name, "Skipping configuration for unknown plugin");
                    continue;
                };
                if let Some(enabled) = settings["enabled"].as_bool() {
                    entry.metadata.enabled = enabled;
                }
                Arc::clone(&entry.formatter)
            };
            let options = &settings["configuration"];
            if options.is_object() && !formatter.configure(options) {
                warn!(plugin = %name, "Formatter rejected imported configuration");
                continue;
            }
            applied += 1;
        }
        info!(applied, "Imported plugin configuration");
        Ok(applied)
    }

    /// Counts and per-plugin state.
    pub fn get_status(&self) -> Value {
        let all = self.get_all_metadata();
        let enabled = all.iter().filter(|m| m.enabled).count();
        let plugins: Vec<Value> = all
            .iter()
            .map(|m| {
                json!({
                    "name": m.manifest.name,
                    "version": m.manifest.version,
                    "enabled": m.enabled,
                    "usage_count": m.usage_count,
                    "providers": m.manifest.providers,
                })
            })
            .collect();
        json!({
            "total_plugins": all.len(),
            "enabled_plugins": enabled,
            "disabled_plugins": all.len() - enabled,
            "plugins": plugins,
        })
    }

    /// Registry counters plus each formatter's own metrics.
    pub fn get_metrics(&self) -> Value {
        let c = &self.counters;
        let plugins = self.plugins.read();
        let total_usage: u64 = plugins.values().map(|e| e.metadata.usage_count).sum();
        let per_plugin: serde_json::Map<String, Value> = plugins
            .iter()
            .map(|(name, e)| (name.clone(), e.formatter.get_metrics()))
            .collect();
        json!({
            "total_plugins": plugins.len(),
            "registrations": c.registrations.load(Ordering::Relaxed),
            "failed_registrations": c.failed_registrations.load(Ordering::Relaxed),
            "unloads": c.unloads.load(Ordering::Relaxed),
            "lookups": c.lookups.load(Ordering::Relaxed),
            "lookup_misses": c.lookup_misses.load(Ordering::Relaxed),
            "total_usage": total_usage,
            "plugins": per_plugin,
        })
    }

    /// Aggregated health: `healthy` only when every enabled formatter is.
    pub fn health_check(&self) -> Value {
        // Formatters are called without holding the table lock.
        let enabled: Vec<(String, Arc<dyn Formatter>)> = self
            .plugins
            .read()
            .iter()
            .filter(|(_, e)| e.metadata.enabled)
            .map(|(name, e)| (name.clone(), Arc::clone(&e.formatter)))
            .collect();
        let mut checks: Vec<(String, Value)> = enabled
            .into_iter()
            .map(|(name, f)| (name, f.health_check()))
            .collect();
        checks.sort_by(|a, b| a.0.cmp(&b.0));
        let unhealthy: Vec<&String> = checks
            .iter()
            .filter(|(_, h)| h["status"] != "healthy")
            .map(|(n, _)| n)
            .collect();
        let status = if unhealthy.is_empty() {
            "healthy"
        } else {
            "degraded"
        };
        json!({
            "status": status,
            "timestamp": Utc::now().timestamp(),
            "checked_plugins": checks.len(),
            "unhealthy_plugins": unhealthy,
            "plugins": checks.iter().cloned().collect::<serde_json::Map<_, _>>(),
        })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use prism_core::{ProcessingContext, ProcessingResult, Request, Response};
    use std::sync::atomic::AtomicUsize;

    struct Stub {
        name: &'static str,
        providers: &'static [&'static str],
        healthy: bool,
        configured: AtomicUsize,
    }

    impl Stub {
        fn new(name: &'static str, providers: &'static [&'static str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                providers,
                healthy: true,
                configured: AtomicUsize::new(0),
            })
        }
    }

    impl Formatter for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn supported_formats(&self) -> &[&'static str] {
            &["json"]
        }
        fn output_formats(&self) -> &[&'static str] {
            &["toon"]
        }
        fn supported_providers(&self) -> &[&'static str] {
            self.providers
        }
        fn capabilities(&self) -> &[&'static str] {
            &[]
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
        fn configure(&self, _options: &Value) -> bool {
            self.configured.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn health_check(&self) -> Value {
            json!({"status": if self.healthy { "healthy" } else { "unhealthy" }})
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        let loaded = registry
            .register_formatter(Stub::new("a", &["openai"]))
            .unwrap();
        assert_eq!(loaded.plugin_name, "a");
        assert_eq!(registry.get_prettifier("a").unwrap().name(), "a");
        assert!(registry.get_prettifier("missing").is_none());
        assert_eq!(registry.get_plugin_metadata("a").unwrap().usage_count, 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = PluginRegistry::new();
        registry.register_formatter(Stub::new("a", &[])).unwrap();
        let err = registry.register_formatter(Stub::new("a", &[])).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.get_metrics()["failed_registrations"], 1);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let registry = PluginRegistry::new();
        let mut manifest = PluginManifest::new("b", "1.0.0");
        manifest.dependencies.push("a".into());
        assert!(registry
            .register_plugin(Stub::new("b", &[]), manifest.clone())
            .is_err());
        registry.register_formatter(Stub::new("a", &[])).unwrap();
        assert!(registry.register_plugin(Stub::new("b", &[]), manifest).is_ok());
    }

    #[test]
    fn test_provider_lookup_sorted_and_enabled_only() {
        let registry = PluginRegistry::new();
        registry.register_formatter(Stub::new("zeta", &["openai"])).unwrap();
        registry.register_formatter(Stub::new("alpha", &["openai"])).unwrap();
        registry.register_formatter(Stub::new("other", &["anthropic"])).unwrap();
        let names: Vec<String> = registry
            .get_plugins_for_provider("openai")
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        registry.set_plugin_enabled("alpha", false).unwrap();
        assert_eq!(registry.get_plugins_for_provider("openai").len(), 1);
        assert!(registry.get_prettifier("alpha").is_none());
        assert_eq!(registry.get_all_plugins().len(), 3);
        assert_eq!(registry.get_plugins_for_format("json").len(), 2);
    }

    #[test]
    fn test_unload_and_callbacks() {
        let registry = PluginRegistry::new();
        let loaded = Arc::new(AtomicUsize::new(0));
        let unloaded = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&loaded);
        let u = Arc::clone(&unloaded);
        registry.set_plugin_loaded_callback(Arc::new(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        }));
        registry.set_plugin_unloaded_callback(Arc::new(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        }));
        registry.register_formatter(Stub::new("a", &[])).unwrap();
        registry.unload_plugin("a").unwrap();
        assert!(registry.unload_plugin("a").is_err());
        assert_eq!(loaded.load(Ordering::SeqCst), 1);
        assert_eq!(unloaded.load(Ordering::SeqCst), 1);
        assert_eq!(registry.plugin_count(), 0);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let registry = PluginRegistry::new();
        let stub = Stub::new("a", &[]);
        registry.register_formatter(stub.clone()).unwrap();
        registry.set_plugin_enabled("a", false).unwrap();
        let exported = registry.export_configuration();
        assert_eq!(exported["plugins"]["a"]["enabled"], false);

        registry.set_plugin_enabled("a", true).unwrap();
        let mut config = exported.clone();
        config["plugins"]["ghost"] = json!({"enabled": true});
        assert_eq!(registry.import_configuration(&config).unwrap(), 1);
        assert!(!registry.get_plugin_metadata("a").unwrap().enabled);
        assert_eq!(stub.configured.load(Ordering::SeqCst), 1);
        assert!(registry.import_configuration(&json!([])).is_err());
    }

    #[test]
    fn test_health_aggregates() {
        let registry = PluginRegistry::new();
        registry.register_formatter(Stub::new("a", &[])).unwrap();
        assert_eq!(registry.health_check()["status"], "healthy");
        registry
            .register_formatter(Arc::new(Stub {
                name: "sick",
                providers: &[],
                healthy: false,
                configured: AtomicUsize::new(0),
            }))
            .unwrap();
        let health = registry.health_check();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["unhealthy_plugins"][0], "sick");
        assert_eq!(registry.get_status()["total_plugins"], 2);
    }
}
