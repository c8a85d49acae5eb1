//! ChaCha20-Poly1305 sealing of payload strings.
//!
//! A sealed payload is `enc:v1:` followed by base64 of `nonce || ciphertext`
//! (the ciphertext includes the Poly1305 tag). The prefix lets readers tell
//! ciphertext from plain JSON strings without a side channel.

use crate::error::{CryptoError, CryptoResult};
use crate::key::PayloadKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Prefix marking a sealed payload.
pub const SEALED_PREFIX: &str = "enc:v1:";

/// Returns true if `s` looks like output of [`seal`].
pub fn is_sealed(s: &str) -> bool {
    s.starts_with(SEALED_PREFIX)
}

/// Encrypts `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &PayloadKey, plaintext: &[u8]) -> CryptoResult<String> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&ciphertext);
    Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(framed)))
}

/// Decrypts a string produced by [`seal`].
pub fn open(key: &PayloadKey, sealed: &str) -> CryptoResult<Vec<u8>> {
    let encoded = sealed
        .strip_prefix(SEALED_PREFIX)
        .ok_or_else(|| CryptoError::Malformed("missing sealed prefix".to_owned()))?;
    let framed = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Malformed(format!("invalid base64: {e}")))?;

    if framed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed("data too short".to_owned()));
    }
    let (nonce, ciphertext) = framed.split_at(NONCE_SIZE);

    ChaCha20Poly1305::new(key.as_bytes().into())
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("wrong key or tampered data".to_owned()))
}
