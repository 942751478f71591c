//! Mailbox password resolution from encrypted secret refs.
//!
//! A secret ref is `base64(nonce || ciphertext)` sealed with AES-256-GCM.

use crate::error::{Error, Result};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore as _;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Turns an opaque secret ref into a plaintext password.
pub trait SecretResolver: Send + Sync {
    fn resolve_password(&self, secret_ref: &str) -> Result<String>;
}

pub struct AesGcmSecrets {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmSecrets")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl AesGcmSecrets {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|error| Error::Secret(format!("secret key is not valid base64: {error}")))?;
        if key.len() != KEY_LEN {
            return Err(Error::Secret(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        })
    }

    /// Fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Secret("encryption failed".to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }
}

impl SecretResolver for AesGcmSecrets {
    fn resolve_password(&self, secret_ref: &str) -> Result<String> {
        let sealed = STANDARD
            .decode(secret_ref.trim())
            .map_err(|error| Error::Secret(format!("secret ref is not valid base64: {error}")))?;
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Secret("secret ref is too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Secret("secret ref failed to decrypt".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Secret("decrypted secret is not UTF-8".to_string()))
    }
}
