//! Protection policies and their merge rules
//!
//! A [`ProtectionPolicy`] is the resolved, immutable description of how one
//! provider detects and decrypts protected values. Policies are produced from
//! [`ProtectionOptions`]: a global set configured on the builder, optionally
//! overridden field by field for a single source.
//!
//! Merge precedence (highest first):
//! 1. Override options registered for the source
//! 2. Global options
//! 3. Built-in defaults (`Protected:{...}` marker, key index 0)

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::warn;

use crate::pattern::PatternMatcher;
use crate::secrets::ProtectionService;
use crate::{ConfigError, Result};

type ConfigureFn = dyn Fn() -> Result<Arc<dyn ProtectionService>> + Send + Sync;

/// Where a policy obtains its protection service
#[derive(Clone)]
pub enum DecryptorSource {
    /// An already constructed service
    Service(Arc<dyn ProtectionService>),
    /// A callback that constructs the service on demand
    Configure(Arc<ConfigureFn>),
}

impl DecryptorSource {
    pub fn service(service: impl ProtectionService + 'static) -> Self {
        Self::Service(Arc::new(service))
    }

    pub fn configure<F>(configure: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ProtectionService>> + Send + Sync + 'static,
    {
        Self::Configure(Arc::new(configure))
    }

    fn resolve(&self) -> Result<Arc<dyn ProtectionService>> {
        match self {
            Self::Service(service) => Ok(Arc::clone(service)),
            Self::Configure(configure) => configure(),
        }
    }
}

impl std::fmt::Debug for DecryptorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(_) => f.write_str("DecryptorSource::Service"),
            Self::Configure(_) => f.write_str("DecryptorSource::Configure"),
        }
    }
}

/// Protection service bound to one key index
#[derive(Clone)]
pub struct Decryptor {
    service: Arc<dyn ProtectionService>,
    key_index: u32,
}

impl Decryptor {
    pub fn new(service: Arc<dyn ProtectionService>, key_index: u32) -> Self {
        Self { service, key_index }
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn unprotect(&self, payload: &str) -> Result<String> {
        self.service.unprotect(self.key_index, payload)
    }

    pub fn protect(&self, plaintext: &str) -> Result<String> {
        self.service.protect(self.key_index, plaintext)
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("key_index", &self.key_index)
            .finish()
    }
}

/// Partial protection settings.
///
/// Every field is optional so the same type serves as global settings and as
/// a per-source override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionOptions {
    /// Marker pattern with a `protectedData` capture group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_pattern: Option<String>,
    /// Key index handed to the protection service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_index: Option<u32>,
    /// Protection service (not serializable)
    #[serde(skip)]
    pub decryptor: Option<DecryptorSource>,
}

impl ProtectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| ConfigError::parse(format!("TOML parse error: {e}")))
    }

    /// Parse from JSON value
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ConfigError::parse(format!("JSON parse error: {e}")))
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.protected_pattern = Some(pattern.into());
        self
    }

    pub fn with_key_index(mut self, key_index: u32) -> Self {
        self.key_index = Some(key_index);
        self
    }

    pub fn with_service(mut self, service: impl ProtectionService + 'static) -> Self {
        self.decryptor = Some(DecryptorSource::service(service));
        self
    }

    pub fn with_shared_service(mut self, service: Arc<dyn ProtectionService>) -> Self {
        self.decryptor = Some(DecryptorSource::Service(service));
        self
    }

    pub fn with_configure<F>(mut self, configure: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ProtectionService>> + Send + Sync + 'static,
    {
        self.decryptor = Some(DecryptorSource::configure(configure));
        self
    }
}

/// Resolved protection policy for one provider
#[derive(Debug, Clone)]
pub struct ProtectionPolicy {
    matcher: PatternMatcher,
    key_index: u32,
    source: Option<DecryptorSource>,
    decryptor: Option<Decryptor>,
}

impl ProtectionPolicy {
    /// Resolve options against the built-in defaults.
    ///
    /// Fails only for an invalid marker pattern. A protection service that
    /// cannot be obtained yields an invalid policy instead of an error.
    pub fn from_options(options: &ProtectionOptions) -> Result<Self> {
        let matcher = match &options.protected_pattern {
            Some(pattern) => PatternMatcher::new(pattern)?,
            None => PatternMatcher::default(),
        };
        let key_index = options.key_index.unwrap_or(0);

        Ok(Self::resolve(matcher, key_index, options.decryptor.clone()))
    }

    fn resolve(matcher: PatternMatcher, key_index: u32, source: Option<DecryptorSource>) -> Self {
        let decryptor = match &source {
            None => {
                warn!(key_index, "No protection service configured, policy is invalid");
                None
            }
            Some(source) => match source.resolve() {
                Ok(service) => Some(Decryptor::new(service, key_index)),
                Err(e) => {
                    warn!(key_index, error = %e, "Failed to construct decryptor, policy is invalid");
                    None
                }
            },
        };

        Self {
            matcher,
            key_index,
            source,
            decryptor,
        }
    }

    /// Merge an override into this policy.
    ///
    /// Fields set on the override win; the rest come from `self`. Without an
    /// override the policy is returned unchanged. The decryptor is rebuilt only
    /// when the override touches the service or the key index.
    pub fn merge(&self, overrides: Option<&ProtectionOptions>) -> Result<Self> {
        let Some(overrides) = overrides else {
            return Ok(self.clone());
        };

        let matcher = match &overrides.protected_pattern {
            Some(pattern) => PatternMatcher::new(pattern)?,
            None => self.matcher.clone(),
        };

        if overrides.key_index.is_none() && overrides.decryptor.is_none() {
            return Ok(Self {
                matcher,
                ..self.clone()
            });
        }

        let key_index = overrides.key_index.unwrap_or(self.key_index);
        let source = overrides.decryptor.clone().or_else(|| self.source.clone());

        Ok(Self::resolve(matcher, key_index, source))
    }

    /// Whether a decryptor could be constructed
    pub fn is_valid(&self) -> bool {
        self.decryptor.is_some()
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn decryptor(&self) -> Option<&Decryptor> {
        self.decryptor.as_ref()
    }

    /// Replace every marker in `value` with its decrypted payload.
    ///
    /// Values without markers, and any value under an invalid policy, come
    /// back borrowed and unchanged.
    pub fn decrypt_value<'a>(&self, value: &'a str) -> Result<Cow<'a, str>> {
        match &self.decryptor {
            Some(decryptor) => self
                .matcher
                .try_replace_all(value, |payload| decryptor.unprotect(payload)),
            None => Ok(Cow::Borrowed(value)),
        }
    }

    /// Encrypt a single plaintext and wrap it in a `Protected:{...}` marker.
    ///
    /// Custom patterns cannot be inverted, so the default marker is always
    /// produced.
    pub fn protect_value(&self, plaintext: &str) -> Result<String> {
        let decryptor = self.require_decryptor()?;
        Ok(format!("Protected:{{{}}}", decryptor.protect(plaintext)?))
    }

    /// Rewrite every `Protect:{plaintext}` span in `text` into a
    /// `Protected:{payload}` marker.
    pub fn protect_text(&self, text: &str) -> Result<String> {
        self.require_decryptor()?;
        let rewritten = PatternMatcher::to_protect()
            .try_replace_all(text, |plaintext| self.protect_value(plaintext))?;
        Ok(rewritten.into_owned())
    }

    fn require_decryptor(&self) -> Result<&Decryptor> {
        self.decryptor
            .as_ref()
            .ok_or_else(|| ConfigError::encryption("Policy has no protection service"))
    }
}
