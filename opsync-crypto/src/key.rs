//! Payload key derivation.
//!
//! Every device of one account derives the same key from the sync password
//! and the account salt, so ciphertext written by one device opens on all.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of payload keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of the account salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A symmetric payload key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey {
    bytes: [u8; KEY_SIZE],
}

impl PayloadKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// A random key, for sessions that do not derive from a password.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadKey([REDACTED])")
    }
}

/// Per-account salt, shared by every device so they derive the same key.
///
/// Serialized as base64 so it can be stored next to sync settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountSalt([u8; SALT_SIZE]);

impl AccountSalt {
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(format!("invalid salt: {e}")))?;
        let bytes: [u8; SALT_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
            CryptoError::Malformed(format!("salt must be {SALT_SIZE} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for AccountSalt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for AccountSalt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Time cost (iterations).
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP baseline for Argon2id
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for real keys.
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Derives a payload key from the sync password with Argon2id.
pub fn derive_key(password: &str, salt: &AccountSalt, params: &KdfParams) -> CryptoResult<PayloadKey> {
    if password.is_empty() {
        return Err(CryptoError::KeyDerivation("empty password".to_owned()));
    }

    let argon_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut bytes = [0u8; KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut bytes)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = PayloadKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}
