//! Marker patterns delimiting encrypted payloads inside configuration values.
//!
//! The default marker is `Protected:{<payload>}`, where the payload runs up to
//! the first `}`. A value may embed any number of markers between literal
//! text; each one is replaced independently.
//!
//! Authoring tools use a second marker, `Protect:{<plaintext>}`, to flag
//! values that still have to be encrypted.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

use crate::{ConfigError, Result};

/// Name of the capture group holding the encrypted payload
pub const PROTECTED_DATA_GROUP: &str = "protectedData";

/// Name of the capture group holding plaintext awaiting encryption
pub const PROTECT_DATA_GROUP: &str = "protectData";

/// Default pattern for encrypted values
pub const DEFAULT_PROTECTED_PATTERN: &str = r"Protected:\{(?P<protectedData>[^}]+)\}";

/// Default pattern for values to encrypt
pub const DEFAULT_PROTECT_PATTERN: &str = r"Protect:\{(?P<protectData>[^}]+)\}";

static PROTECTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_PROTECTED_PATTERN).expect("Invalid default protected pattern")
});

static PROTECT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_PROTECT_PATTERN).expect("Invalid default protect pattern")
});

/// Compiled marker pattern with one named payload group
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
    group: &'static str,
}

impl PatternMatcher {
    /// Compile a custom protected-value pattern.
    ///
    /// The pattern must define the named group `protectedData`.
    pub fn new(pattern: &str) -> Result<Self> {
        Self::with_group(pattern, PROTECTED_DATA_GROUP)
    }

    /// Pattern for `Protect:{...}` authoring markers
    pub fn to_protect() -> Self {
        Self {
            regex: PROTECT_REGEX.clone(),
            group: PROTECT_DATA_GROUP,
        }
    }

    fn with_group(pattern: &str, group: &'static str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigError::pattern(format!("Failed to compile '{pattern}': {e}")))?;

        if !regex.capture_names().flatten().any(|name| name == group) {
            return Err(ConfigError::pattern(format!(
                "Pattern '{pattern}' has no capture group named '{group}'"
            )));
        }

        Ok(Self { regex, group })
    }

    /// Source text of the pattern
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Whether the value contains at least one marker
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// Payloads of every marker in the value, in order
    pub fn payloads<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.regex
            .captures_iter(value)
            .filter_map(|caps| caps.name(self.group).map(|m| m.as_str()))
    }

    /// Replace every marker with the result of `f` applied to its payload.
    ///
    /// Literal text between markers is kept as is. A value without markers is
    /// returned borrowed and byte-for-byte unchanged. The first error from `f`
    /// aborts the whole replacement.
    pub fn try_replace_all<'a, F>(&self, value: &'a str, mut f: F) -> Result<Cow<'a, str>>
    where
        F: FnMut(&str) -> Result<String>,
    {
        let mut output = String::new();
        let mut last = 0;
        let mut replaced = false;

        for caps in self.regex.captures_iter(value) {
            let (Some(whole), Some(payload)) = (caps.get(0), caps.name(self.group)) else {
                continue;
            };

            output.push_str(&value[last..whole.start()]);
            output.push_str(&f(payload.as_str())?);
            last = whole.end();
            replaced = true;
        }

        if !replaced {
            return Ok(Cow::Borrowed(value));
        }

        output.push_str(&value[last..]);
        Ok(Cow::Owned(output))
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self {
            regex: PROTECTED_REGEX.clone(),
            group: PROTECTED_DATA_GROUP,
        }
    }
}
