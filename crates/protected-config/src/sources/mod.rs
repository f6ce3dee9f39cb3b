//! Configuration sources and providers
//!
//! A [`ConfigurationSource`] is a descriptor that builds a
//! [`ConfigurationProvider`]; the provider resolves flat `:`-delimited keys to
//! string values and announces reloads through a [`ReloadToken`].
//!
//! Concrete backends (files, environment, remote stores) live outside this
//! crate. [`MemoryProvider`] is the data-backed provider they can delegate to.

mod memory;

pub use memory::{MemoryProvider, MemorySource};

use std::sync::Arc;

use crate::Result;
use crate::reload::ReloadToken;

/// Read/write/reload surface of one configuration provider.
///
/// This is also the capability the decryption decorator depends on: a
/// provider that returns `true` from [`supports_decoration`] promises that a
/// value written with `set` is what a following `try_get` returns, and that
/// `child_keys` enumerates every stored key.
///
/// [`supports_decoration`]: ConfigurationProvider::supports_decoration
pub trait ConfigurationProvider: Send + Sync {
    /// Name of this provider (for logging and debugging)
    fn name(&self) -> &str;

    /// Load (or reload) data from the backing store
    fn load(&self) -> Result<()>;

    /// Value stored at exactly `key`
    fn try_get(&self, key: &str) -> Option<String>;

    /// Store a literal value at `key`
    fn set(&self, key: &str, value: &str);

    /// Immediate child segments below `parent_path`, appended to
    /// `earlier_keys` and sorted.
    ///
    /// The result may contain duplicates: every key sharing a segment reports
    /// it again.
    fn child_keys(&self, earlier_keys: Vec<String>, parent_path: Option<&str>) -> Vec<String>;

    /// Token that fires on the next reload
    fn reload_token(&self) -> Arc<ReloadToken>;

    /// Whether values of this provider may be rewritten in place by a decorator
    fn supports_decoration(&self) -> bool {
        true
    }
}

/// Descriptor that builds a provider
pub trait ConfigurationSource: Send + Sync {
    /// Name of this source (for logging and debugging)
    fn name(&self) -> &str;

    /// Build the provider for this source
    fn build(&self) -> Result<Arc<dyn ConfigurationProvider>>;
}
