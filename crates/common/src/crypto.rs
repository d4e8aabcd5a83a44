//! Shared-secret payload encryption.
//!
//! When a secret is configured, every request and reply is wrapped in an
//! AES-256-GCM envelope: a fresh 12-byte nonce followed by ciphertext plus
//! tag, no additional authenticated data. The key is the SHA-256 digest of
//! the secret string, so both sides derive it without a handshake. Mixed
//! mode fails closed: cleartext fed to [`decrypt`] fails authentication and
//! ciphertext fed to a JSON parser fails to parse.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("shared secret is empty")]
    EmptySecret,
    #[error("ciphertext too short")]
    TruncatedCiphertext,
    #[error("payload could not be sealed")]
    SealFailed,
    #[error("payload could not be authenticated")]
    Unauthenticated,
}

/// Derives the 256-bit envelope key from a secret string.
pub fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Encrypts `plain` under `secret`, prepending a fresh random nonce.
pub fn encrypt(plain: &[u8], secret: &str) -> Result<Vec<u8>, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }

    let key = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a nonce-prefixed envelope produced by [`encrypt`].
pub fn decrypt(data: &[u8], secret: &str) -> Result<Vec<u8>, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TruncatedCiphertext);
    }

    let key = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_restores_plaintext() {
        let sealed = encrypt(b"hello agents", "deadbeef").expect("encrypt");
        let opened = decrypt(&sealed, "deadbeef").expect("decrypt");
        assert_eq!(opened, b"hello agents");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let a = encrypt(b"same input", "k").expect("encrypt");
        let b = encrypt(b"same input", "k").expect("encrypt");
        assert_ne!(a, b, "two encryptions of the same plaintext must differ");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = encrypt(b"secret", "alpha").expect("encrypt");
        assert_eq!(
            decrypt(&sealed, "bravo").unwrap_err(),
            CryptoError::Unauthenticated
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut sealed = encrypt(b"secret", "k").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(decrypt(&sealed, "k").unwrap_err(), CryptoError::Unauthenticated);
    }

    #[test]
    fn cleartext_fed_to_decrypt_fails() {
        // A peer without the secret sends plain JSON; the keyed side must drop it.
        let cleartext = br#"{"request_id":"abc","type":"ping"}"#;
        assert!(decrypt(cleartext, "k").is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            decrypt(b"tiny", "k").unwrap_err(),
            CryptoError::TruncatedCiphertext
        );
    }

    #[test]
    fn empty_secret_is_an_error_both_ways() {
        assert_eq!(encrypt(b"x", "").unwrap_err(), CryptoError::EmptySecret);
        assert_eq!(decrypt(b"0123456789ab", "").unwrap_err(), CryptoError::EmptySecret);
    }

    #[test]
    fn envelope_hides_wire_field_names() {
        let request = br#"{"request_id":"0e6f","type":"ping","controller_version":"0.1.0"}"#;
        let sealed = encrypt(request, "deadbeef").expect("encrypt");
        let needle = b"request_id";
        let leaked = sealed
            .windows(needle.len())
            .any(|window| window == needle);
        assert!(!leaked, "ciphertext must not contain plaintext field names");
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_any_payload(
            plain in proptest::collection::vec(any::<u8>(), 0..512),
            secret in "[a-zA-Z0-9]{1,32}",
        ) {
            let sealed = encrypt(&plain, &secret).expect("encrypt");
            let opened = decrypt(&sealed, &secret).expect("decrypt");
            prop_assert_eq!(opened, plain);
        }
    }
}
