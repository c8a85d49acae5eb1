//! Payload encryption for the sync engine.
//!
//! The engine only encrypts operation and snapshot payloads; clocks, ids and
//! every other field the server compares stay in the clear.
//!
//! - [`PayloadCipher`]: the seam the engine calls through
//! - [`PasswordCipher`]: Argon2id-derived key + ChaCha20-Poly1305
//! - [`PassthroughCipher`]: reversible marker for tests

mod cipher;
mod error;
mod key;
mod payload;

pub use cipher::{is_sealed, open, seal, NONCE_SIZE, SEALED_PREFIX, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, AccountSalt, KdfParams, PayloadKey, KEY_SIZE, SALT_SIZE};
pub use payload::{PassthroughCipher, PasswordCipher, PayloadCipher};
