//! Payload encryption using AES-256-GCM
//!
//! Nonces are always drawn from the [`Environment`] RNG: callers cannot
//! supply one, so a (key, nonce) pair is never reused by construction.
//! Sealed payloads travel as base64url strings ([`WirePayload`]).

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};

use crate::{encoding, env::Environment, error::CryptoError};

/// AES-GCM nonce size (12 bytes)
pub const NONCE_LENGTH: usize = 12;

/// GCM tag size (16 bytes)
pub const TAG_LENGTH: usize = 16;

/// A nonce and its ciphertext (tag appended).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// The 12-byte random nonce
    pub nonce: [u8; NONCE_LENGTH],
    /// The ciphertext including 16-byte GCM tag
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_LENGTH)
    }

    /// Encode for the wire as base64url strings.
    pub fn to_wire(&self) -> WirePayload {
        WirePayload {
            nonce: encoding::encode(&self.nonce),
            ciphertext: encoding::encode(&self.ciphertext),
        }
    }
}

/// Wire form of a [`SealedPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    /// Base64url nonce
    pub nonce: String,
    /// Base64url ciphertext
    pub ciphertext: String,
}

impl WirePayload {
    /// Decode the base64url fields.
    ///
    /// # Errors
    ///
    /// - `Encoding`: If either field is not base64url or the nonce is not 12
    ///   bytes
    pub fn decode(&self) -> Result<SealedPayload, CryptoError> {
        let nonce_bytes = encoding::decode(&self.nonce)?;
        let nonce = <[u8; NONCE_LENGTH]>::try_from(nonce_bytes.as_slice()).map_err(|_| {
            CryptoError::Encoding {
                reason: format!("nonce must be {NONCE_LENGTH} bytes, got {}", nonce_bytes.len()),
            }
        })?;
        let ciphertext = encoding::decode(&self.ciphertext)?;

        Ok(SealedPayload { nonce, ciphertext })
    }
}

/// Encrypt bytes under a 32-byte key with a fresh random nonce.
///
/// # Errors
///
/// - `InvalidInput`: If the plaintext exceeds the AES-GCM length limit
pub fn encrypt(
    env: &impl Environment,
    key: &[u8; 32],
    plaintext: &[u8],
    aad: Option<&[u8]>,
) -> Result<SealedPayload, CryptoError> {
    let nonce: [u8; NONCE_LENGTH] = env.random_array();
    let cipher = Aes256Gcm::new(key.into());

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: aad.unwrap_or_default() })
        .map_err(|_| CryptoError::InvalidInput {
            reason: "plaintext exceeds the AES-GCM length limit".to_string(),
        })?;

    Ok(SealedPayload { nonce, ciphertext })
}

/// Decrypt and authenticate a sealed payload.
///
/// # Errors
///
/// - `Authentication`: If the tag does not verify (tampered ciphertext,
///   nonce, or AAD, or the wrong key)
pub fn decrypt(
    key: &[u8; 32],
    sealed: &SealedPayload,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload { msg: &sealed.ciphertext, aad: aad.unwrap_or_default() },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt a UTF-8 string.
pub fn encrypt_text(
    env: &impl Environment,
    key: &[u8; 32],
    plaintext: &str,
    aad: Option<&[u8]>,
) -> Result<SealedPayload, CryptoError> {
    encrypt(env, key, plaintext.as_bytes(), aad)
}

/// Decrypt a payload that must contain UTF-8 text.
///
/// # Errors
///
/// - `Authentication`: If the tag does not verify
/// - `Encoding`: If the plaintext is not valid UTF-8
pub fn decrypt_text(
    key: &[u8; 32],
    sealed: &SealedPayload,
    aad: Option<&[u8]>,
) -> Result<String, CryptoError> {
    let bytes = decrypt(key, sealed, aad)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::Encoding { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_env::SeededEnv;

    const KEY: [u8; 32] = [0x11; 32];

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let env = SeededEnv::new(1);
        let sealed = encrypt(&env, &KEY, b"Hello, World!", None).unwrap();
        let decrypted = decrypt(&KEY, &sealed, None).unwrap();
        assert_eq!(decrypted, b"Hello, World!");
    }

    #[test]
    fn encrypt_decrypt_empty_message() {
        let env = SeededEnv::new(2);
        let sealed = encrypt(&env, &KEY, b"", None).unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_LENGTH);
        assert_eq!(decrypt(&KEY, &sealed, None).unwrap(), b"");
    }

    #[test]
    fn ciphertext_is_plaintext_plus_tag() {
        let env = SeededEnv::new(3);
        let sealed = encrypt(&env, &KEY, b"test message", None).unwrap();
        assert_eq!(sealed.ciphertext.len(), b"test message".len() + TAG_LENGTH);
        assert_eq!(sealed.plaintext_len(), b"test message".len());
    }

    #[test]
    fn every_encryption_uses_a_fresh_nonce() {
        let env = SeededEnv::new(4);
        let first = encrypt(&env, &KEY, b"same", None).unwrap();
        let second = encrypt(&env, &KEY, b"same", None).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let env = SeededEnv::new(5);
        let sealed = encrypt(&env, &KEY, b"secret", None).unwrap();
        let result = decrypt(&[0x22; 32], &sealed, None);
        assert_eq!(result, Err(CryptoError::Authentication));
    }

    #[test]
    fn tampered_nonce_fails_authentication() {
        let env = SeededEnv::new(6);
        let mut sealed = encrypt(&env, &KEY, b"secret", None).unwrap();
        sealed.nonce[0] ^= 0x01;
        assert_eq!(decrypt(&KEY, &sealed, None), Err(CryptoError::Authentication));
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let env = SeededEnv::new(7);
        let sealed = encrypt(&env, &KEY, b"secret", Some(b"header-1")).unwrap();

        assert_eq!(decrypt(&KEY, &sealed, Some(b"header-2")), Err(CryptoError::Authentication));
        assert_eq!(decrypt(&KEY, &sealed, None), Err(CryptoError::Authentication));
        assert_eq!(decrypt(&KEY, &sealed, Some(b"header-1")).unwrap(), b"secret");
    }

    #[test]
    fn text_roundtrip() {
        let env = SeededEnv::new(8);
        let sealed = encrypt_text(&env, &KEY, "héllo wörld", None).unwrap();
        assert_eq!(decrypt_text(&KEY, &sealed, None).unwrap(), "héllo wörld");
    }

    #[test]
    fn invalid_utf8_is_encoding_error() {
        let env = SeededEnv::new(9);
        let sealed = encrypt(&env, &KEY, &[0xFF, 0xFE], None).unwrap();
        assert!(matches!(decrypt_text(&KEY, &sealed, None), Err(CryptoError::Encoding { .. })));
    }

    #[test]
    fn wire_roundtrip() {
        let env = SeededEnv::new(10);
        let sealed = encrypt(&env, &KEY, b"over the wire", None).unwrap();
        let wire = sealed.to_wire();

        assert!(!wire.nonce.contains('='));
        assert_eq!(wire.decode().unwrap(), sealed);
    }

    #[test]
    fn wire_rejects_short_nonce() {
        let wire = WirePayload {
            nonce: encoding::encode(&[0u8; 8]),
            ciphertext: encoding::encode(&[0u8; 32]),
        };
        assert!(matches!(wire.decode(), Err(CryptoError::Encoding { .. })));
    }

    #[test]
    fn wire_rejects_garbage() {
        let wire = WirePayload { nonce: "!!!".to_string(), ciphertext: "AAAA".to_string() };
        assert!(matches!(wire.decode(), Err(CryptoError::Encoding { .. })));
    }
}
