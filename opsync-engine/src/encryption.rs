//! Payload encryption at the sync boundary.
//!
//! Operations are logged in plaintext and encrypted only on their way to the
//! remote. Only `payload` is sealed; everything the server compares stays
//! readable.

use crate::error::SyncResult;
use opsync_crypto::{CryptoError, PayloadCipher};
use opsync_store::Operation;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Whether payloads are encrypted, and with what.
#[derive(Clone, Default)]
pub struct EncryptionSettings {
    enabled: bool,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("enabled", &self.enabled)
            .field("has_cipher", &self.cipher.is_some())
            .finish()
    }
}

impl EncryptionSettings {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enabled(cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            enabled: true,
            cipher: Some(cipher),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn cipher(&self) -> SyncResult<&dyn PayloadCipher> {
        self.cipher
            .as_deref()
            .ok_or_else(|| CryptoError::Decryption("no encryption key configured".into()).into())
    }

    /// Seals a JSON value into a JSON string.
    pub fn encrypt_value(&self, value: &Value) -> SyncResult<Value> {
        let plain = serde_json::to_string(value)?;
        Ok(Value::String(self.cipher()?.encrypt(&plain)?))
    }

    /// Opens a JSON string produced by [`Self::encrypt_value`].
    pub fn decrypt_value(&self, value: &Value) -> SyncResult<Value> {
        let Value::String(sealed) = value else {
            return Err(CryptoError::Malformed("encrypted payload is not a string".into()).into());
        };
        let plain = self.cipher()?.decrypt(sealed)?;
        Ok(serde_json::from_str(&plain)?)
    }

    /// Copy of `op` ready for upload.
    pub fn encrypt_operation(&self, op: &Operation) -> SyncResult<Operation> {
        let mut out = op.clone();
        if self.enabled && !op.is_payload_encrypted {
            out.payload = self.encrypt_value(&op.payload)?;
            out.is_payload_encrypted = true;
        }
        Ok(out)
    }

    /// Decrypts an incoming operation. Fails if it is encrypted and no key
    /// is configured.
    pub fn decrypt_operation(&self, mut op: Operation) -> SyncResult<Operation> {
        if op.is_payload_encrypted {
            op.payload = self.decrypt_value(&op.payload)?;
            op.is_payload_encrypted = false;
        }
        Ok(op)
    }

    /// Snapshot state ready for upload, with its encrypted flag.
    pub fn encrypt_state(&self, state: &Value) -> SyncResult<(Value, bool)> {
        if self.enabled {
            Ok((self.encrypt_value(state)?, true))
        } else {
            Ok((state.clone(), false))
        }
    }

    pub fn decrypt_state(&self, state: Value, is_encrypted: bool) -> SyncResult<Value> {
        if is_encrypted {
            self.decrypt_value(&state)
        } else {
            Ok(state)
        }
    }

    /// True when local settings expect a key but every incoming operation is
    /// plaintext, meaning another device turned encryption off.
    #[must_use]
    pub fn detects_downgrade<'a>(&self, incoming: impl IntoIterator<Item = &'a Operation>) -> bool {
        if !self.enabled {
            return false;
        }
        let mut seen = false;
        for op in incoming {
            if op.is_payload_encrypted {
                return false;
            }
            seen = true;
        }
        seen
    }

    /// [`Self::detects_downgrade`] for a snapshot download. The snapshot is
    /// itself incoming data, so a plaintext snapshot with no encrypted ops
    /// after it is a downgrade even when no ops follow.
    #[must_use]
    pub fn detects_snapshot_downgrade<'a>(
        &self,
        snapshot_is_encrypted: bool,
        trailing: impl IntoIterator<Item = &'a Operation>,
    ) -> bool {
        self.enabled
            && !snapshot_is_encrypted
            && trailing.into_iter().all(|op| !op.is_payload_encrypted)
    }
}
