//! Key derivation using HKDF-SHA256
//!
//! Provides the RFC 5869 extract/expand pair plus the two ratchet-specific
//! derivations built on it: the root-key step (mixes a DH output into the
//! root key) and the chain-key step (produces one message key per message).

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// SHA-256 output length in bytes.
pub const HASH_LENGTH: usize = 32;

/// Largest HKDF-SHA256 output (255 blocks).
pub const MAX_OUTPUT_LENGTH: usize = 255 * HASH_LENGTH;

/// Info label for the root-key step.
const ROOT_LABEL: &[u8] = b"ratchet-rk";

/// Info label for the chain-key step.
const CHAIN_LABEL: &[u8] = b"ratchet-ck";

/// Salt for the chain-key step.
const CHAIN_SALT: &[u8] = &[0x01];

/// Pseudorandom key produced by [`extract`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Prk([u8; HASH_LENGTH]);

impl Prk {
    /// Raw PRK bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

/// HKDF-Extract.
///
/// An absent salt is treated as a zero-filled block of the hash length.
pub fn extract(salt: Option<&[u8]>, ikm: &[u8]) -> Prk {
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(&prk);
    Prk(out)
}

/// HKDF-Expand.
///
/// # Errors
///
/// - `Length`: If `length` exceeds [`MAX_OUTPUT_LENGTH`]
pub fn expand(prk: &Prk, info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    if length > MAX_OUTPUT_LENGTH {
        return Err(CryptoError::Length { requested: length, max: MAX_OUTPUT_LENGTH });
    }

    let Ok(hkdf) = Hkdf::<Sha256>::from_prk(prk.as_bytes()) else {
        unreachable!("a 32-byte PRK is a valid HKDF-SHA256 PRK");
    };

    let mut okm = vec![0u8; length];
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::Length { requested: length, max: MAX_OUTPUT_LENGTH })?;
    Ok(okm)
}

/// HKDF extract-then-expand in one call.
///
/// # Errors
///
/// - `Length`: If `length` exceeds [`MAX_OUTPUT_LENGTH`]
pub fn hkdf(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    expand(&extract(salt, ikm), info, length)
}

/// Derive exactly 64 bytes and split them into two 32-byte halves.
fn derive_pair(ikm: &[u8], salt: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = Zeroizing::new([0u8; 64]);
    let Ok(()) = hkdf.expand(info, okm.as_mut_slice()) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

/// Root key of a Double Ratchet session.
///
/// Replaced on every DH ratchet step; never reused across epochs.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; 32]);

impl RootKey {
    /// Wrap raw root key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Sending or receiving chain key.
///
/// Replaced on every message in its direction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Wrap raw chain key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A message key derived from a chain key.
///
/// This key is used for a single message encryption/decryption.
/// It should be used immediately and then discarded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// 32-byte symmetric key for AES-256-GCM.
    pub fn key(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Root-key step: mix a DH output into the root key.
///
/// HKDF over `root ‖ dh_output` with a zero salt. Returns the new root key
/// and a fresh chain key for the direction that performed the step.
pub fn kdf_root(root_key: &RootKey, dh_output: &[u8; 32]) -> (RootKey, ChainKey) {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(&root_key.0);
    ikm[32..].copy_from_slice(dh_output);

    let (root, chain) = derive_pair(ikm.as_slice(), &[0u8; HASH_LENGTH], ROOT_LABEL);
    (RootKey(root), ChainKey(chain))
}

/// Chain-key step: derive the next chain key and a one-time message key.
///
/// The first half of the output is the message key, the second half the
/// next chain key.
pub fn kdf_chain(chain_key: &ChainKey) -> (ChainKey, MessageKey) {
    let (message, next_chain) = derive_pair(&chain_key.0, CHAIN_SALT, CHAIN_LABEL);
    (ChainKey(next_chain), MessageKey(message))
}
