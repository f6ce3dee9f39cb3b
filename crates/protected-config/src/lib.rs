//! Transparent decryption of protected configuration values
//!
//! This crate sits between raw configuration providers and application code:
//! - Wraps any provider and replaces `Protected:{...}` spans with plaintext
//! - Merges a global protection policy with per-source overrides
//! - Re-decrypts on every upstream reload and propagates reload tokens
//! - Ships an AES-256-GCM keyring as a ready-made protection service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 ProtectedConfigurationBuilder                    │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐              │
//! │  │  Source A   │  │  Source B   │  │  Source C   │              │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘              │
//! │         │ global ⊕ override policy        │                      │
//! │  ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐              │
//! │  │ Protected   │  │ Protected   │  │  (invalid   │              │
//! │  │ Provider    │  │ Provider    │  │   policy)   │              │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘              │
//! │         └────────────────┴────────────────┘                      │
//! │                          │                                       │
//! │                  ConfigurationRoot                               │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │
//!                     reload tokens
//!                            ▼
//!                       Application
//! ```

pub mod builder;
pub mod decorator;
pub mod path;
pub mod pattern;
pub mod policy;
pub mod reload;
pub mod root;
pub mod secrets;
pub mod sources;

// Re-export main types
pub use builder::ProtectedConfigurationBuilder;
pub use decorator::ProtectedProvider;
pub use pattern::PatternMatcher;
pub use policy::{Decryptor, DecryptorSource, ProtectionOptions, ProtectionPolicy};
pub use reload::{ChangeRegistration, ChangeWatcher, ReloadToken, ReloadTokenSource};
pub use root::ConfigurationRoot;
pub use secrets::{ProtectionService, Secrets};
pub use sources::{ConfigurationProvider, ConfigurationSource, MemoryProvider, MemorySource};

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid marker pattern: {0}")]
    Pattern(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("No configuration providers registered")]
    NoProviders,

    #[error("Source error: {source}")]
    Source {
        source_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConfigError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn pattern(msg: impl Into<String>) -> Self {
        Self::Pattern(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn decryption(msg: impl Into<String>) -> Self {
        Self::Decryption(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    /// Wrap an arbitrary error raised while building or loading a source
    pub fn from_source(
        source_name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            source_name: source_name.into(),
            source: Box::new(source),
        }
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
