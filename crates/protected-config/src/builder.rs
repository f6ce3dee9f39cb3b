//! Builder that decorates providers with decryption
//!
//! Sources are added in order. A protection override registered right after
//! a source applies to that source only; everything else uses the global
//! options.
//!
//! ```ignore
//! let root = ProtectedConfigurationBuilder::new(ProtectionOptions::new().with_service(secrets))
//!     .add_source(MemorySource::from_json_str("defaults", defaults)?)
//!     .add_source(MemorySource::from_json_str("tenant", tenant)?)
//!     .with_protection_options(ProtectionOptions::new().with_key_index(2))?
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::decorator::ProtectedProvider;
use crate::policy::{ProtectionOptions, ProtectionPolicy};
use crate::root::ConfigurationRoot;
use crate::sources::{ConfigurationProvider, ConfigurationSource};
use crate::{ConfigError, Result};

/// Two-phase registry of per-source overrides.
///
/// Overrides are first bound to the index of the source they were registered
/// after, then, while building, rebound to the index of the provider that
/// source produced.
#[derive(Debug, Default)]
struct OverrideRegistry {
    by_source: HashMap<usize, ProtectionOptions>,
    by_provider: HashMap<usize, ProtectionOptions>,
}

impl OverrideRegistry {
    fn bind_source(&mut self, source_index: usize, options: ProtectionOptions) {
        self.by_source.insert(source_index, options);
    }

    /// Move the override of `source_index`, if any, to `provider_index`
    fn rebind(&mut self, source_index: usize, provider_index: usize) {
        if let Some(options) = self.by_source.remove(&source_index) {
            self.by_provider.insert(provider_index, options);
        }
    }

    fn for_provider(&self, provider_index: usize) -> Option<&ProtectionOptions> {
        self.by_provider.get(&provider_index)
    }
}

/// Builder for a [`ConfigurationRoot`] whose providers decrypt protected values
pub struct ProtectedConfigurationBuilder {
    sources: Vec<Arc<dyn ConfigurationSource>>,
    global: ProtectionOptions,
    overrides: OverrideRegistry,
}

impl ProtectedConfigurationBuilder {
    /// Create a builder with the global protection options
    pub fn new(global: ProtectionOptions) -> Self {
        Self {
            sources: Vec::new(),
            global,
            overrides: OverrideRegistry::default(),
        }
    }

    /// Add a source; an unset source is rejected immediately
    pub fn add(mut self, source: Option<Arc<dyn ConfigurationSource>>) -> Result<Self> {
        let source =
            source.ok_or_else(|| ConfigError::invalid_argument("Configuration source is not set"))?;

        debug!(source = source.name(), index = self.sources.len(), "Adding source");
        self.sources.push(source);
        Ok(self)
    }

    /// Add a source
    pub fn add_source(mut self, source: impl ConfigurationSource + 'static) -> Self {
        debug!(source = source.name(), index = self.sources.len(), "Adding source");
        self.sources.push(Arc::new(source));
        self
    }

    /// Override protection options for the most recently added source
    pub fn with_protection_options(mut self, options: ProtectionOptions) -> Result<Self> {
        let index = self.sources.len().checked_sub(1).ok_or_else(|| {
            ConfigError::invalid_argument("Protection options need a source added before them")
        })?;

        debug!(
            source = self.sources[index].name(),
            index, "Registering protection override"
        );
        self.overrides.bind_source(index, options);
        Ok(self)
    }

    /// Global protection options
    pub fn protection(&self) -> &ProtectionOptions {
        &self.global
    }

    pub fn sources(&self) -> &[Arc<dyn ConfigurationSource>] {
        &self.sources
    }

    /// Build every provider, decorate the eligible ones and compose the root
    pub fn build(mut self) -> Result<ConfigurationRoot> {
        let global = ProtectionPolicy::from_options(&self.global)?;
        let mut providers: Vec<Arc<dyn ConfigurationProvider>> = Vec::with_capacity(self.sources.len());
        let mut decorated = 0usize;

        for (source_index, source) in self.sources.iter().enumerate() {
            let provider = source.build()?;
            let provider_index = providers.len();

            self.overrides.rebind(source_index, provider_index);
            let policy = global.merge(self.overrides.for_provider(provider_index))?;

            if !provider.supports_decoration() {
                debug!(
                    provider = provider.name(),
                    "Provider does not support decoration, adding as is"
                );
                providers.push(provider);
                continue;
            }

            if !policy.is_valid() {
                warn!(
                    provider = provider.name(),
                    "No usable decryptor, protected values stay encrypted"
                );
                providers.push(provider);
                continue;
            }

            providers.push(Arc::new(ProtectedProvider::new(provider, Arc::new(policy))?));
            decorated += 1;
        }

        info!(
            providers = providers.len(),
            decorated, "Protected configuration built"
        );

        ConfigurationRoot::new(providers)
    }
}

impl Default for ProtectedConfigurationBuilder {
    fn default() -> Self {
        Self::new(ProtectionOptions::default())
    }
}

impl std::fmt::Debug for ProtectedConfigurationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedConfigurationBuilder")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("overrides", &self.overrides.by_source.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{MemoryProvider, MemorySource};

    #[test]
    fn test_add_rejects_unset_source() {
        let result = ProtectedConfigurationBuilder::new(ProtectionOptions::new()).add(None);
        assert!(matches!(result, Err(ConfigError::InvalidArgument(_))));
    }

    #[test]
    fn test_override_requires_a_source() {
        let result = ProtectedConfigurationBuilder::new(ProtectionOptions::new())
            .with_protection_options(ProtectionOptions::new().with_key_index(1));
        assert!(matches!(result, Err(ConfigError::InvalidArgument(_))));
    }

    #[test]
    fn test_override_binds_to_last_source() {
        let builder = ProtectedConfigurationBuilder::new(ProtectionOptions::new())
            .add_source(MemorySource::new(MemoryProvider::new("first")))
            .add_source(MemorySource::new(MemoryProvider::new("second")))
            .with_protection_options(ProtectionOptions::new().with_key_index(7))
            .unwrap();

        assert_eq!(builder.overrides.by_source.len(), 1);
        assert_eq!(builder.overrides.by_source[&1].key_index, Some(7));
    }

    #[test]
    fn test_registry_rebinds_once() {
        let mut registry = OverrideRegistry::default();
        registry.bind_source(0, ProtectionOptions::new().with_key_index(3));

        registry.rebind(0, 4);
        assert!(registry.by_source.is_empty());
        assert_eq!(registry.for_provider(4).and_then(|o| o.key_index), Some(3));

        registry.rebind(0, 5);
        assert!(registry.for_provider(5).is_none());
    }

    #[test]
    fn test_add_accepts_set_source() {
        let source: Arc<dyn ConfigurationSource> = Arc::new(MemorySource::new(MemoryProvider::new("a")));
        let builder = ProtectedConfigurationBuilder::new(ProtectionOptions::new())
            .add(Some(source))
            .unwrap();
        assert_eq!(builder.sources().len(), 1);
    }
}
