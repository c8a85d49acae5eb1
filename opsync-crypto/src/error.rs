//! Failures while sealing or opening operation payloads.

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Argon2 rejected the password, salt or cost parameters.
    #[error("could not derive payload key: {0}")]
    KeyDerivation(String),

    #[error("could not seal payload: {0}")]
    Encryption(String),

    /// The AEAD tag did not verify. Either the sync password differs
    /// between devices or the payload was altered in transit.
    #[error("could not open payload: {0}")]
    Decryption(String),

    /// Input was not a sealed payload produced by this crate.
    #[error("not a sealed payload: {0}")]
    Malformed(String),
}
