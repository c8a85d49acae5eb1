use opsync_crypto::{
    derive_key, is_sealed, open, seal, AccountSalt, CryptoError, KdfParams, PassthroughCipher,
    PasswordCipher, PayloadCipher, PayloadKey,
};
use proptest::prelude::*;

fn fast_cipher(password: &str, salt: &AccountSalt) -> PasswordCipher {
    PasswordCipher::new(password, salt, &KdfParams::insecure_fast()).unwrap()
}

// ── Seal / open ───────────────────────────────────────────────────

#[test]
fn seal_and_open() {
    let key = PayloadKey::random();
    let sealed = seal(&key, b"{\"title\":\"x\"}").unwrap();
    assert!(is_sealed(&sealed));
    assert_eq!(open(&key, &sealed).unwrap(), b"{\"title\":\"x\"}");
}

#[test]
fn seal_uses_fresh_nonce() {
    let key = PayloadKey::random();
    assert_ne!(seal(&key, b"same").unwrap(), seal(&key, b"same").unwrap());
}

#[test]
fn open_with_wrong_key_fails() {
    let sealed = seal(&PayloadKey::random(), b"secret").unwrap();
    let err = open(&PayloadKey::random(), &sealed).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
}

#[test]
fn open_rejects_plain_json() {
    let err = open(&PayloadKey::random(), "{\"a\":1}").unwrap_err();
    assert!(matches!(err, CryptoError::Malformed(_)));
}

#[test]
fn open_rejects_truncated() {
    let err = open(&PayloadKey::random(), "enc:v1:AAAA").unwrap_err();
    assert!(matches!(err, CryptoError::Malformed(_)));
}

// ── Key derivation ────────────────────────────────────────────────

#[test]
fn same_password_and_salt_share_ciphertext() {
    let salt = AccountSalt::random();
    let device_a = fast_cipher("hunter2", &salt);
    let device_b = fast_cipher("hunter2", &salt);

    let sealed = device_a.encrypt("payload").unwrap();
    assert_eq!(device_b.decrypt(&sealed).unwrap(), "payload");
}

#[test]
fn different_password_cannot_decrypt() {
    let salt = AccountSalt::random();
    let sealed = fast_cipher("right", &salt).encrypt("payload").unwrap();
    assert!(fast_cipher("wrong", &salt).decrypt(&sealed).is_err());
}

#[test]
fn empty_password_is_rejected() {
    let err = derive_key("", &AccountSalt::random(), &KdfParams::insecure_fast()).unwrap_err();
    assert!(matches!(err, CryptoError::KeyDerivation(_)));
}

#[test]
fn salt_base64_roundtrip() {
    let salt = AccountSalt::random();
    assert_eq!(AccountSalt::from_base64(&salt.to_base64()).unwrap(), salt);
    let json = serde_json::to_string(&salt).unwrap();
    assert_eq!(serde_json::from_str::<AccountSalt>(&json).unwrap(), salt);
    assert!(AccountSalt::from_base64("AAAA").is_err());
}

#[test]
fn key_debug_is_redacted() {
    assert_eq!(format!("{:?}", PayloadKey::random()), "PayloadKey([REDACTED])");
}

// ── Passthrough ───────────────────────────────────────────────────

#[test]
fn passthrough_is_reversible_and_marked() {
    let sealed = PassthroughCipher.encrypt("{}").unwrap();
    assert_ne!(sealed, "{}");
    assert_eq!(PassthroughCipher.decrypt(&sealed).unwrap(), "{}");
    assert!(PassthroughCipher.decrypt("{}").is_err());
}

proptest! {
    #[test]
    fn seal_open_any_bytes(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let key = PayloadKey::random();
        let sealed = seal(&key, &data).unwrap();
        prop_assert_eq!(open(&key, &sealed).unwrap(), data);
    }
}
