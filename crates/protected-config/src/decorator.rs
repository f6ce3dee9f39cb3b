//! Decrypting provider decorator
//!
//! [`ProtectedProvider`] wraps another provider and keeps every value that
//! contains a protected marker replaced by its plaintext:
//! - after each `load`
//! - after each upstream reload, before its own reload token fires
//!
//! Reads, writes and key enumeration go straight to the wrapped provider.
//!
//! # Usage
//!
//! ```ignore
//! use protected_config::{MemoryProvider, ProtectedProvider, ProtectionOptions, ProtectionPolicy, Secrets};
//!
//! let policy = ProtectionPolicy::from_options(&ProtectionOptions::new().with_service(secrets))?;
//! let provider = ProtectedProvider::new(Arc::new(MemoryProvider::new("app")), Arc::new(policy))?;
//! provider.load()?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::path;
use crate::policy::ProtectionPolicy;
use crate::reload::{ChangeWatcher, ReloadToken, ReloadTokenSource};
use crate::sources::ConfigurationProvider;
use crate::{ConfigError, Result};

struct DecryptingCore {
    provider: Arc<dyn ConfigurationProvider>,
    policy: Arc<ProtectionPolicy>,
    reload: ReloadTokenSource,
}

impl DecryptingCore {
    /// Decrypt every protected leaf of the wrapped provider.
    ///
    /// All replacements are computed before any is written, so a payload that
    /// fails to decrypt leaves the provider untouched. Replacements are also
    /// dropped when the upstream reloads during collection; the reload
    /// callback runs a pass over the new data instead.
    fn decrypt_pass(&self) -> Result<usize> {
        let upstream = self.provider.reload_token();
        let mut replacements = Vec::new();
        self.collect(None, &mut replacements)?;

        if upstream.has_changed() {
            debug!(
                provider = self.provider.name(),
                discarded = replacements.len(),
                "Upstream reloaded during decrypt pass, discarding replacements"
            );
            return Ok(0);
        }

        for (key, plaintext) in &replacements {
            self.provider.set(key, plaintext);
        }

        debug!(
            provider = self.provider.name(),
            decrypted = replacements.len(),
            "Decrypt pass complete"
        );
        Ok(replacements.len())
    }

    fn collect(&self, parent: Option<&str>, out: &mut Vec<(String, String)>) -> Result<()> {
        // Enumeration repeats a segment once per key below it
        let children: BTreeSet<String> = self
            .provider
            .child_keys(Vec::new(), parent)
            .into_iter()
            .collect();

        for child in children {
            let key = path::combine(parent, &child);

            match self.provider.try_get(&key) {
                Some(value) if value.is_empty() => {}
                Some(value) => {
                    let decrypted = self.policy.decrypt_value(&value).map_err(|e| {
                        ConfigError::decryption(format!("Failed to decrypt '{key}': {e}"))
                    })?;
                    if let std::borrow::Cow::Owned(plaintext) = decrypted {
                        out.push((key, plaintext));
                    }
                }
                None => self.collect(Some(&key), out)?,
            }
        }

        Ok(())
    }

    fn publish(&self) -> Result<()> {
        info!(provider = self.provider.name(), "Protected configuration reloaded");
        self.reload.fire()
    }
}

/// Provider decorator that decrypts protected values in place
pub struct ProtectedProvider {
    core: Arc<DecryptingCore>,
    watcher: ChangeWatcher,
}

impl ProtectedProvider {
    /// Wrap `provider` and start following its reloads.
    ///
    /// Nothing is decrypted until the first `load` or upstream reload.
    pub fn new(provider: Arc<dyn ConfigurationProvider>, policy: Arc<ProtectionPolicy>) -> Result<Self> {
        if !policy.is_valid() {
            return Err(ConfigError::invalid_argument(format!(
                "Policy for provider '{}' has no decryptor",
                provider.name()
            )));
        }

        let core = Arc::new(DecryptingCore {
            provider,
            policy,
            reload: ReloadTokenSource::new(),
        });

        let upstream = Arc::clone(&core.provider);
        let refresh = Arc::clone(&core);
        let publish = Arc::clone(&core);

        let watcher = ChangeWatcher::new(
            core.provider.name().to_string(),
            move || upstream.reload_token(),
            move || refresh.decrypt_pass().map(|_| ()),
            move || publish.publish(),
        )?;

        Ok(Self { core, watcher })
    }

    /// Policy applied to this provider
    pub fn policy(&self) -> &Arc<ProtectionPolicy> {
        &self.core.policy
    }

    /// The wrapped provider
    pub fn inner(&self) -> &Arc<dyn ConfigurationProvider> {
        &self.core.provider
    }

    /// Run a decrypt pass now and return the number of values replaced
    pub fn decrypt(&self) -> Result<usize> {
        self.core.decrypt_pass()
    }

    /// Number of upstream reloads handled so far
    pub fn generation(&self) -> u64 {
        self.watcher.generation()
    }
}

impl ConfigurationProvider for ProtectedProvider {
    fn name(&self) -> &str {
        self.core.provider.name()
    }

    fn load(&self) -> Result<()> {
        self.core.provider.load()?;

        // A fired upstream token means the reload callback runs the pass
        if self.watcher.is_pending() {
            debug!(
                provider = self.name(),
                "Upstream reload pending, skipping decrypt pass"
            );
            return Ok(());
        }

        self.core.decrypt_pass().map(|_| ())
    }

    fn try_get(&self, key: &str) -> Option<String> {
        self.core.provider.try_get(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.core.provider.set(key, value);
    }

    fn child_keys(&self, earlier_keys: Vec<String>, parent_path: Option<&str>) -> Vec<String> {
        self.core.provider.child_keys(earlier_keys, parent_path)
    }

    fn reload_token(&self) -> Arc<ReloadToken> {
        self.core.reload.current()
    }

    fn supports_decoration(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for ProtectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedProvider")
            .field("provider", &self.core.provider.name())
            .field("key_index", &self.core.policy.key_index())
            .field("generation", &self.watcher.generation())
            .finish()
    }
}
