//! Protection services and the built-in AES-256-GCM keyring
//!
//! A [`ProtectionService`] turns plaintext into an opaque payload and back
//! for a given key index. The payload is what ends up between the braces of a
//! `Protected:{...}` marker, so services must never emit `}`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::{ConfigError, Result};

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

/// Environment variable holding the primary key (hex or base64)
pub const KEY_ENV_VAR: &str = "PROTECTED_CONFIG_KEY";

/// Capability to protect and unprotect configuration payloads
pub trait ProtectionService: Send + Sync {
    /// Encrypt `plaintext` with the key at `key_index`
    fn protect(&self, key_index: u32, plaintext: &str) -> Result<String>;

    /// Decrypt a payload produced by [`ProtectionService::protect`]
    fn unprotect(&self, key_index: u32, payload: &str) -> Result<String>;
}

/// Encrypted payload: base64 of `nonce || ciphertext`
struct SealedPayload {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl SealedPayload {
    fn seal(plaintext: &str, key: &[u8; KEY_SIZE]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ConfigError::encryption(format!("Failed to create cipher: {e}")))?;

        // Generate random nonce
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| ConfigError::encryption(format!("Encryption failed: {e}")))?;

        Ok(Self { nonce, ciphertext })
    }

    fn open(&self, key: &[u8; KEY_SIZE]) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ConfigError::decryption(format!("Failed to create cipher: {e}")))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .map_err(|e| ConfigError::decryption(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| ConfigError::decryption(format!("Invalid UTF-8 in decrypted value: {e}")))
    }

    fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        BASE64.encode(bytes)
    }

    fn decode(payload: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| ConfigError::decryption(format!("Invalid payload base64: {e}")))?;

        if bytes.len() <= NONCE_SIZE {
            return Err(ConfigError::decryption("Payload too short"));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Key entry in the keyring
#[derive(Clone)]
struct KeyEntry {
    key: [u8; KEY_SIZE],
    /// When the key was added (for rotation tracking)
    created_at: OffsetDateTime,
}

/// AES-256-GCM keyring indexed by key number
#[derive(Clone, Default)]
pub struct Secrets {
    keyring: Arc<DashMap<u32, KeyEntry>>,
}

impl Secrets {
    /// Create a keyring from the `PROTECTED_CONFIG_KEY` environment variable.
    ///
    /// The key is stored at index 0. Returns `None` when the variable is unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(KEY_ENV_VAR) {
            Ok(key_str) => {
                let key = Self::parse_key(&key_str)?;
                Ok(Some(Self::new(key, 0)))
            }
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::key(format!("Failed to read {KEY_ENV_VAR}: {e}"))),
        }
    }

    /// Create a keyring holding one key
    pub fn new(key: [u8; KEY_SIZE], key_index: u32) -> Self {
        let secrets = Self::default();
        secrets.add_key(key, key_index);
        secrets
    }

    /// Parse a key from a hex or base64 string
    pub fn parse_key(key_str: &str) -> Result<[u8; KEY_SIZE]> {
        let key_str = key_str.trim();

        // Try hex first
        if key_str.len() == KEY_SIZE * 2
            && let Ok(bytes) = hex::decode(key_str)
        {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }

        // Try base64
        let bytes = BASE64
            .decode(key_str)
            .map_err(|e| ConfigError::key(format!("Invalid base64 key: {e}")))?;

        if bytes.len() != KEY_SIZE {
            return Err(ConfigError::key(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    /// Generate a new random key
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Add or replace the key at `key_index`
    pub fn add_key(&self, key: [u8; KEY_SIZE], key_index: u32) {
        self.keyring.insert(
            key_index,
            KeyEntry {
                key,
                created_at: OffsetDateTime::now_utc(),
            },
        );
    }

    /// Remove a retired key. The last remaining key cannot be removed.
    pub fn remove_key(&self, key_index: u32) -> Result<()> {
        if !self.keyring.contains_key(&key_index) {
            return Err(ConfigError::key(format!("Key {key_index} not found in keyring")));
        }
        if self.keyring.len() == 1 {
            return Err(ConfigError::key("Cannot remove the last key"));
        }

        self.keyring.remove(&key_index);
        Ok(())
    }

    /// Whether the keyring holds a key at `key_index`
    pub fn contains_key(&self, key_index: u32) -> bool {
        self.keyring.contains_key(&key_index)
    }

    /// When the key at `key_index` was added
    pub fn key_created_at(&self, key_index: u32) -> Option<OffsetDateTime> {
        self.keyring.get(&key_index).map(|entry| entry.created_at)
    }

    /// Re-encrypt a payload from one key to another
    pub fn rotate_payload(&self, payload: &str, from: u32, to: u32) -> Result<String> {
        let plaintext = self.unprotect(from, payload)?;
        self.protect(to, &plaintext)
    }

    fn key(&self, key_index: u32) -> Result<[u8; KEY_SIZE]> {
        self.keyring
            .get(&key_index)
            .map(|entry| entry.key)
            .ok_or_else(|| ConfigError::key(format!("Key {key_index} not found in keyring")))
    }
}

impl ProtectionService for Secrets {
    fn protect(&self, key_index: u32, plaintext: &str) -> Result<String> {
        let key = self.key(key_index)?;
        Ok(SealedPayload::seal(plaintext, &key)?.encode())
    }

    fn unprotect(&self, key_index: u32, payload: &str) -> Result<String> {
        let key = self.key(key_index)?;
        SealedPayload::decode(payload)?.open(&key)
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("keyring_size", &self.keyring.len())
            .field("keys", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_unprotect() {
        let secrets = Secrets::new(Secrets::generate_key(), 1);
        let plaintext = "my-secret-password";

        let payload = secrets.protect(1, plaintext).unwrap();
        assert_ne!(payload, plaintext);
        assert!(!payload.contains('}'));

        assert_eq!(secrets.unprotect(1, &payload).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let secrets = Secrets::new(Secrets::generate_key(), 1);
        secrets.add_key(Secrets::generate_key(), 2);

        let payload = secrets.protect(1, "secret").unwrap();
        assert!(matches!(
            secrets.unprotect(2, &payload),
            Err(ConfigError::Decryption(_))
        ));
    }

    #[test]
    fn test_unknown_key_index() {
        let secrets = Secrets::new(Secrets::generate_key(), 0);
        assert!(matches!(secrets.protect(7, "x"), Err(ConfigError::Key(_))));
    }

    #[test]
    fn test_corrupt_payload() {
        let secrets = Secrets::new(Secrets::generate_key(), 0);
        assert!(secrets.unprotect(0, "not base64!").is_err());
        assert!(secrets.unprotect(0, "AAAA").is_err());
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let key = Secrets::generate_key();
        assert_eq!(Secrets::parse_key(&hex::encode(key)).unwrap(), key);
        assert_eq!(Secrets::parse_key(&BASE64.encode(key)).unwrap(), key);
        assert!(Secrets::parse_key("too-short").is_err());
    }

    #[test]
    fn test_key_rotation() {
        let secrets = Secrets::new(Secrets::generate_key(), 1);
        let old = secrets.protect(1, "rotate-me").unwrap();

        secrets.add_key(Secrets::generate_key(), 2);
        let new = secrets.rotate_payload(&old, 1, 2).unwrap();
        secrets.remove_key(1).unwrap();

        assert!(!secrets.contains_key(1));
        assert!(secrets.key_created_at(2).is_some());
        assert_eq!(secrets.unprotect(2, &new).unwrap(), "rotate-me");
        assert!(secrets.remove_key(2).is_err());
    }

    #[test]
    fn test_from_env() {
        let key = Secrets::generate_key();

        // the only test touching this variable
        unsafe {
            std::env::set_var(KEY_ENV_VAR, hex::encode(key));
        }
        let secrets = Secrets::from_env().unwrap().unwrap();
        assert!(secrets.contains_key(0));
        let payload = Secrets::new(key, 0).protect(0, "from-env").unwrap();
        assert_eq!(secrets.unprotect(0, &payload).unwrap(), "from-env");

        unsafe {
            std::env::set_var(KEY_ENV_VAR, "not-a-key");
        }
        assert!(matches!(Secrets::from_env(), Err(ConfigError::Key(_))));

        unsafe {
            std::env::remove_var(KEY_ENV_VAR);
        }
        assert!(Secrets::from_env().unwrap().is_none());
    }
}
