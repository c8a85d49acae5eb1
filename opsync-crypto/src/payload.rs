//! The cipher interface the sync engine encrypts payloads through.
//!
//! The engine depends on `Arc<dyn PayloadCipher>` and never sees key bytes.
//! Tests use [`PassthroughCipher`] to exercise the encrypted code paths
//! without paying for key derivation.

use crate::cipher;
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, AccountSalt, KdfParams, PayloadKey};

/// Encrypts and decrypts serialized payloads.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String>;

    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String>;
}

/// Password-derived ChaCha20-Poly1305 cipher.
#[derive(Debug, Clone)]
pub struct PasswordCipher {
    key: PayloadKey,
}

impl PasswordCipher {
    /// Derives the account key from `password` and `salt`.
    pub fn new(password: &str, salt: &AccountSalt, params: &KdfParams) -> CryptoResult<Self> {
        Ok(Self {
            key: derive_key(password, salt, params)?,
        })
    }

    pub fn from_key(key: PayloadKey) -> Self {
        Self { key }
    }
}

impl PayloadCipher for PasswordCipher {
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        cipher::seal(&self.key, plaintext.as_bytes())
    }

    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        let bytes = cipher::open(&self.key, ciphertext)?;
        String::from_utf8(bytes).map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
    }
}

/// Reversible marker cipher: wraps the plaintext without hiding it.
///
/// Output is still distinguishable from plain JSON, so "is this encrypted"
/// logic behaves as it would with a real key.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

const PASSTHROUGH_PREFIX: &str = "plain:";

impl PayloadCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        Ok(format!("{PASSTHROUGH_PREFIX}{plaintext}"))
    }

    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        ciphertext
            .strip_prefix(PASSTHROUGH_PREFIX)
            .map(str::to_owned)
            .ok_or_else(|| CryptoError::Malformed("not a passthrough payload".to_owned()))
    }
}
