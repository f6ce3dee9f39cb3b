//! Composed configuration root
//!
//! Layers providers in registration order: a key resolves from the last
//! provider that has it. The root's own reload token fires whenever any
//! provider's token fires, and again after an explicit [`ConfigurationRoot::reload`].

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::reload::{ChangeWatcher, ReloadToken, ReloadTokenSource};
use crate::sources::ConfigurationProvider;
use crate::{ConfigError, Result};

/// Layered view over a list of providers
pub struct ConfigurationRoot {
    providers: Vec<Arc<dyn ConfigurationProvider>>,
    reload: Arc<ReloadTokenSource>,
    _watchers: Vec<ChangeWatcher>,
}

impl ConfigurationRoot {
    /// Load every provider and start following their reloads
    pub fn new(providers: Vec<Arc<dyn ConfigurationProvider>>) -> Result<Self> {
        for provider in &providers {
            provider.load()?;
        }

        let reload = Arc::new(ReloadTokenSource::new());
        let mut watchers = Vec::with_capacity(providers.len());

        for provider in &providers {
            let upstream = Arc::clone(provider);
            let root = Arc::clone(&reload);
            watchers.push(ChangeWatcher::on_change(
                format!("root:{}", provider.name()),
                move || upstream.reload_token(),
                move || root.fire(),
            )?);
        }

        info!(providers = providers.len(), "Configuration root built");

        Ok(Self {
            providers,
            reload,
            _watchers: watchers,
        })
    }

    /// Value of `key` from the last provider that has it
    pub fn get(&self, key: &str) -> Option<String> {
        self.providers
            .iter()
            .rev()
            .find_map(|provider| provider.try_get(key))
    }

    /// Write `key` into every provider
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        for provider in &self.providers {
            provider.set(key, value);
        }
        Ok(())
    }

    /// Distinct child segments below `parent_path` across all providers
    pub fn child_keys(&self, parent_path: Option<&str>) -> Vec<String> {
        let keys = self
            .providers
            .iter()
            .fold(Vec::new(), |earlier, provider| provider.child_keys(earlier, parent_path));

        keys.into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Reload every provider, then fire the root token
    pub fn reload(&self) -> Result<()> {
        for provider in &self.providers {
            debug!(provider = provider.name(), "Reloading provider");
            provider.load()?;
        }

        info!("Configuration reloaded");
        self.reload.fire()
    }

    /// Token that fires on the next change of any provider
    pub fn reload_token(&self) -> Arc<ReloadToken> {
        self.reload.current()
    }

    pub fn providers(&self) -> &[Arc<dyn ConfigurationProvider>] {
        &self.providers
    }
}

impl std::fmt::Debug for ConfigurationRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationRoot")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemoryProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn root() -> (Arc<MemoryProvider>, Arc<MemoryProvider>, ConfigurationRoot) {
        let base = Arc::new(
            MemoryProvider::new("base")
                .with_value("server:port", "8080")
                .with_value("server:host", "0.0.0.0"),
        );
        let overlay = Arc::new(MemoryProvider::new("overlay").with_value("server:port", "9090"));
        let providers: Vec<Arc<dyn ConfigurationProvider>> = vec![base.clone(), overlay.clone()];
        let root = ConfigurationRoot::new(providers).unwrap();
        (base, overlay, root)
    }

    #[test]
    fn test_last_provider_wins() {
        let (_, _, root) = root();
        assert_eq!(root.get("server:port").as_deref(), Some("9090"));
        assert_eq!(root.get("server:host").as_deref(), Some("0.0.0.0"));
        assert_eq!(root.get("missing"), None);
    }

    #[test]
    fn test_child_keys_are_distinct() {
        let (_, _, root) = root();
        assert_eq!(root.child_keys(None), vec!["server"]);
        assert_eq!(root.child_keys(Some("server")), vec!["host", "port"]);
    }

    #[test]
    fn test_set_writes_all_providers() {
        let (base, overlay, root) = root();
        root.set("feature", "on").unwrap();
        assert_eq!(base.try_get("feature").as_deref(), Some("on"));
        assert_eq!(overlay.try_get("feature").as_deref(), Some("on"));

        let empty = ConfigurationRoot::new(Vec::new()).unwrap();
        assert!(matches!(empty.set("a", "b"), Err(ConfigError::NoProviders)));
    }

    #[test]
    fn test_provider_reload_fires_root_token() {
        let (_, overlay, root) = root();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let _registration = root
            .reload_token()
            .register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        overlay.reload_with([("server:port", "7070")]).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(root.get("server:port").as_deref(), Some("7070"));

        // root keeps following later reloads
        let token = root.reload_token();
        overlay.reload_with([("server:port", "6060")]).unwrap();
        assert!(token.has_changed());
    }

    #[test]
    fn test_reload_restores_provider_data() {
        let (base, _, root) = root();
        base.set("server:host", "127.0.0.1");
        let token = root.reload_token();

        root.reload().unwrap();

        assert_eq!(root.get("server:host").as_deref(), Some("0.0.0.0"));
        assert!(token.has_changed());
    }
}
