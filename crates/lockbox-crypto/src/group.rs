//! Best-effort group secret
//!
//! # Security
//!
//! The group secret is derived from public keys only. Anyone who knows the
//! member public keys and the group identifier can compute it, so it gives
//! no confidentiality against outsiders who observe the key directory and
//! no forward secrecy. It exists as an explicit fallback and is a separate
//! type that cannot seed a [`RatchetState`](crate::ratchet::RatchetState).

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, kdf};

/// Info label for the group secret derivation.
const GROUP_INFO: &[u8] = b"shared-secret-info";

/// Deterministic 32-byte group value. Not forward secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupSecret([u8; 32]);

impl GroupSecret {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupSecret(..)")
    }
}

/// Derive the group secret from the members' public keys.
///
/// HKDF over the concatenated keys, salted with SHA-256 of the group
/// identifier. Key order matters: callers must agree on it.
///
/// # Errors
///
/// - `InvalidInput`: If `public_keys` is empty, a key is empty, or the keys
///   differ in length
pub fn derive_group_secret<K: AsRef<[u8]>>(
    group_id: &str,
    public_keys: &[K],
) -> Result<GroupSecret, CryptoError> {
    let Some(first) = public_keys.first() else {
        return Err(CryptoError::InvalidInput { reason: "no public keys provided".to_string() });
    };

    let key_len = first.as_ref().len();
    if key_len == 0 {
        return Err(CryptoError::InvalidInput { reason: "public keys must not be empty".to_string() });
    }
    if public_keys.iter().any(|key| key.as_ref().len() != key_len) {
        return Err(CryptoError::InvalidInput {
            reason: "all public keys must have the same length".to_string(),
        });
    }

    let ikm: Vec<u8> = public_keys.iter().flat_map(|key| key.as_ref().iter().copied()).collect();
    let salt = Sha256::digest(group_id.as_bytes());

    let okm = Zeroizing::new(kdf::hkdf(&ikm, Some(salt.as_slice()), GROUP_INFO, 32)?);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&okm);
    Ok(GroupSecret(secret))
}
