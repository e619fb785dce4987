//! Base64url wire encoding.
//!
//! All byte payloads crossing the wire boundary are URL-safe base64 without
//! padding.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::error::CryptoError;

/// Encode bytes as base64url without padding.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url string (no padding).
///
/// # Errors
///
/// - `Encoding`: If the input is not valid unpadded base64url
pub fn decode(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::Encoding { reason: e.to_string() })
}

/// Decode a base64url string into a 32-byte key.
///
/// # Errors
///
/// - `Encoding`: If the input is not valid base64url
/// - `InvalidKey`: If the decoded length is not 32 bytes
pub fn decode_key(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode(encoded)?;
    key_from_slice(&bytes)
}

/// Copy a slice into a 32-byte key, rejecting any other length.
pub(crate) fn key_from_slice(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    <[u8; 32]>::try_from(bytes).map_err(|_| {
        CryptoError::invalid_key(format!("expected 32 bytes, got {}", bytes.len()))
    })
}
