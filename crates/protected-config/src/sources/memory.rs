//! In-memory configuration provider
//!
//! Holds a seed set of key/value pairs that `load` restores, plus the live
//! data readers see. Backends can delegate to it and call
//! [`MemoryProvider::reload_with`] whenever their store changes.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::path;
use crate::reload::{ReloadToken, ReloadTokenSource};
use crate::sources::{ConfigurationProvider, ConfigurationSource};
use crate::{ConfigError, Result};

/// Data-backed configuration provider
pub struct MemoryProvider {
    name: String,
    seed: RwLock<BTreeMap<String, String>>,
    data: RwLock<BTreeMap<String, String>>,
    reload: ReloadTokenSource,
    supports_decoration: bool,
}

impl MemoryProvider {
    /// Create an empty provider
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: RwLock::new(BTreeMap::new()),
            data: RwLock::new(BTreeMap::new()),
            reload: ReloadTokenSource::new(),
            supports_decoration: true,
        }
    }

    /// Seed a value
    pub fn with_value(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.seed.write().insert(key.clone(), value.clone());
        self.data.write().insert(key, value);
        self
    }

    /// Seed several values
    pub fn with_values<I, K, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        values
            .into_iter()
            .fold(self, |provider, (key, value)| provider.with_value(key, value))
    }

    /// Seed from a JSON document, flattening objects and arrays into
    /// `:`-delimited keys (`{"a":{"b":[1]}}` becomes `a:b:0 = 1`)
    pub fn from_json(name: impl Into<String>, document: &Value) -> Self {
        let mut values = BTreeMap::new();
        flatten(None, document, &mut values);
        Self::new(name).with_values(values)
    }

    /// Parse and seed from a JSON string
    pub fn from_json_str(name: impl Into<String>, json: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(json)
            .map_err(|e| ConfigError::parse(format!("JSON parse error: {e}")))?;
        Ok(Self::from_json(name, &document))
    }

    /// Refuse in-place rewriting by decorators
    pub fn opaque(mut self) -> Self {
        self.supports_decoration = false;
        self
    }

    /// Replace the whole data set, as a backend would after its store changed,
    /// and fire the reload token.
    ///
    /// Reload observers run on this thread before this returns; their first
    /// error is returned.
    pub fn reload_with<I, K, V>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: BTreeMap<String, String> = values
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();

        debug!(provider = %self.name, keys = values.len(), "Reloading in-memory data");

        *self.seed.write() = values.clone();
        *self.data.write() = values;

        self.reload.fire()
    }

    /// Copy of the live data
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl ConfigurationProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<()> {
        let seed = self.seed.read().clone();
        debug!(provider = %self.name, keys = seed.len(), "Loading in-memory data");
        *self.data.write() = seed;
        Ok(())
    }

    fn try_get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.data.write().insert(key.to_string(), value.to_string());
    }

    fn child_keys(&self, mut earlier_keys: Vec<String>, parent_path: Option<&str>) -> Vec<String> {
        let data = self.data.read();
        earlier_keys.extend(
            data.keys()
                .filter_map(|key| path::child_segment(key, parent_path))
                .map(str::to_string),
        );
        earlier_keys.sort();
        earlier_keys
    }

    fn reload_token(&self) -> Arc<ReloadToken> {
        self.reload.current()
    }

    fn supports_decoration(&self) -> bool {
        self.supports_decoration
    }
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("name", &self.name)
            .field("keys", &self.len())
            .field("supports_decoration", &self.supports_decoration)
            .finish()
    }
}

/// Source handing out a shared [`MemoryProvider`]
///
/// Every build returns the same provider, so the handle from
/// [`MemorySource::provider`] can drive reloads after the configuration is
/// built.
#[derive(Debug, Clone)]
pub struct MemorySource {
    provider: Arc<MemoryProvider>,
}

impl MemorySource {
    pub fn new(provider: MemoryProvider) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Source seeded from a JSON string
    pub fn from_json_str(name: impl Into<String>, json: &str) -> Result<Self> {
        Ok(Self::new(MemoryProvider::from_json_str(name, json)?))
    }

    /// Handle to the provider this source builds
    pub fn provider(&self) -> Arc<MemoryProvider> {
        Arc::clone(&self.provider)
    }
}

impl From<MemoryProvider> for MemorySource {
    fn from(provider: MemoryProvider) -> Self {
        Self::new(provider)
    }
}

impl ConfigurationSource for MemorySource {
    fn name(&self) -> &str {
        &self.provider.name
    }

    fn build(&self) -> Result<Arc<dyn ConfigurationProvider>> {
        let provider: Arc<dyn ConfigurationProvider> = self.provider.clone();
        Ok(provider)
    }
}

fn flatten(prefix: Option<&str>, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(Some(&path::combine(prefix, key)), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(Some(&path::combine(prefix, &index.to_string())), child, out);
            }
        }
        Value::Null => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), String::new());
            }
        }
        Value::String(s) => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), s.clone());
            }
        }
        other => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), other.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_from_json_flattens() {
        let provider = MemoryProvider::from_json_str(
            "json",
            r#"{"db": "Protected:{abc123}", "storage": {"postgres": {"port": 5432, "hosts": ["a", "b"]}}, "empty": null}"#,
        )
        .unwrap();

        assert_eq!(provider.try_get("db").as_deref(), Some("Protected:{abc123}"));
        assert_eq!(provider.try_get("storage:postgres:port").as_deref(), Some("5432"));
        assert_eq!(provider.try_get("storage:postgres:hosts:1").as_deref(), Some("b"));
        assert_eq!(provider.try_get("empty").as_deref(), Some(""));
        assert_eq!(provider.try_get("storage"), None);
    }

    #[test]
    fn test_child_keys_report_duplicates() {
        let provider = MemoryProvider::new("mem")
            .with_value("db:host", "localhost")
            .with_value("db:port", "5432")
            .with_value("name", "app");

        assert_eq!(provider.child_keys(Vec::new(), None), vec!["db", "db", "name"]);
        assert_eq!(provider.child_keys(Vec::new(), Some("db")), vec!["host", "port"]);
        assert_eq!(
            provider.child_keys(vec!["zzz".to_string()], Some("db")),
            vec!["host", "port", "zzz"]
        );
    }

    #[test]
    fn test_load_restores_seed() {
        let provider = MemoryProvider::new("mem").with_value("key", "seed");
        provider.set("key", "changed");
        assert_eq!(provider.try_get("key").as_deref(), Some("changed"));

        provider.load().unwrap();
        assert_eq!(provider.try_get("key").as_deref(), Some("seed"));
    }

    #[test]
    fn test_reload_with_fires_token() {
        let provider = MemoryProvider::new("mem").with_value("key", "old");
        let token = provider.reload_token();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _registration = token
            .register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        provider.reload_with([("key", "new")]).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(token.has_changed());
        assert!(!provider.reload_token().has_changed());
        assert_eq!(provider.try_get("key").as_deref(), Some("new"));
    }

    #[test]
    fn test_source_shares_provider() {
        let source = MemorySource::new(MemoryProvider::new("shared").with_value("a", "1"));
        let built = source.build().unwrap();

        source.provider().set("a", "2");
        assert_eq!(built.try_get("a").as_deref(), Some("2"));
        assert_eq!(source.name(), "shared");
    }

    #[test]
    fn test_opaque_provider() {
        let provider = MemoryProvider::new("opaque").opaque();
        assert!(!provider.supports_decoration());
    }
}
