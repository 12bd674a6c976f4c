//! At-rest secret encryption for partner and key-store passwords.
//!
//! # Tagged value schemes
//! - `AES:v2:`: AES-256-GCM, base64(nonce || ciphertext). The only scheme
//!   ever emitted.
//! - `AES:`: legacy alias for the same format; recognized on read only.
//! - `vault:`: reference into an external secret store; resolved by a
//!   plugged backend, refused by the standalone build.
//! - `ENC:`: legacy scheme; recognized on read only, plugged backend
//!   required.
//!
//! Untagged values pass through `decrypt` unchanged (plaintext storage is
//! allowed, discouraged).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use std::path::Path;
use thiserror::Error;

const PREFIX_AES_V2: &str = "AES:v2:";
const PREFIX_AES_LEGACY: &str = "AES:";
const PREFIX_VAULT: &str = "vault:";
const PREFIX_ENC: &str = "ENC:";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file must hold 32 hex-encoded bytes: {0}")]
    BadKey(String),
    #[error("ciphertext is not valid base64: {0}")]
    BadEncoding(String),
    #[error("decryption failed (wrong key or corrupt value)")]
    DecryptFailed,
    #[error("no backend is configured for '{0}' values")]
    UnsupportedScheme(String),
    #[error("secret encryption is not configured")]
    NotConfigured,
}

/// True for any value carrying a recognized secret-scheme prefix.
///
/// Note `AES:v2:` also starts with `AES:`; the order here is cosmetic.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(PREFIX_AES_V2)
        || value.starts_with(PREFIX_AES_LEGACY)
        || value.starts_with(PREFIX_VAULT)
        || value.starts_with(PREFIX_ENC)
}

/// Pluggable at-rest secret backend.
pub trait SecretStore: Send + Sync {
    /// Encrypt a plaintext into a tagged value (`AES:v2:` scheme).
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;

    /// Resolve a stored value to its plaintext. Untagged input is returned
    /// unchanged.
    fn decrypt(&self, value: &str) -> Result<String, SecretError>;
}

// ---------------------------------------------------------------------------
// AES-256-GCM backend
// ---------------------------------------------------------------------------

/// The standalone AES backend. Handles `AES:v2:` and legacy `AES:` values;
/// refuses `vault:` and `ENC:`.
pub struct AesSecretStore {
    key: [u8; 32],
}

impl AesSecretStore {
    pub fn new(key: [u8; 32]) -> Self {
        AesSecretStore { key }
    }

    /// Load the key from a hex-encoded key file (64 hex chars, whitespace
    /// trimmed).
    pub fn from_key_file(path: &Path) -> Result<Self, SecretError> {
        let content = std::fs::read_to_string(path)?;
        let bytes = hex::decode(content.trim()).map_err(|e| SecretError::BadKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SecretError::BadKey("expected exactly 32 bytes".to_owned()))?;
        Ok(AesSecretStore { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    fn decrypt_aes(&self, encoded: &str) -> Result<String, SecretError> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| SecretError::BadEncoding(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretError::DecryptFailed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptFailed)
    }
}

impl SecretStore for AesSecretStore {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::DecryptFailed)?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", PREFIX_AES_V2, BASE64.encode(raw)))
    }

    fn decrypt(&self, value: &str) -> Result<String, SecretError> {
        if let Some(encoded) = value.strip_prefix(PREFIX_AES_V2) {
            return self.decrypt_aes(encoded);
        }
        if value.starts_with(PREFIX_VAULT) || value.starts_with(PREFIX_ENC) {
            let scheme = value.split(':').next().unwrap_or("?");
            return Err(SecretError::UnsupportedScheme(format!("{scheme}:")));
        }
        if let Some(encoded) = value.strip_prefix(PREFIX_AES_LEGACY) {
            // Legacy tag, same format as v2.
            return self.decrypt_aes(encoded);
        }
        Ok(value.to_owned())
    }
}

/// Backend used when no key file is configured: passes plaintext through
/// and refuses every tagged value.
pub struct NullSecretStore;

impl SecretStore for NullSecretStore {
    fn encrypt(&self, _plaintext: &str) -> Result<String, SecretError> {
        Err(SecretError::NotConfigured)
    }

    fn decrypt(&self, value: &str) -> Result<String, SecretError> {
        if is_encrypted(value) {
            return Err(SecretError::NotConfigured);
        }
        Ok(value.to_owned())
    }
}
