//! Error types for Lockbox cryptographic operations

use thiserror::Error;

/// Errors from key derivation, key agreement, and AEAD operations.
///
/// Verification failures are never downgraded: every variant reaches the
/// caller so the transport or UI layer can decide whether to retry,
/// re-handshake, or alert the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Malformed or wrong-length key material, detected before any DH or
    /// AEAD call
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What was wrong with the key
        reason: String,
    },

    /// Signed prekey signature did not verify against the identity key
    #[error("untrusted bundle: signed prekey signature does not verify")]
    UntrustedBundle,

    /// AEAD tag mismatch (tampered ciphertext, wrong key, or wrong AAD)
    #[error("authentication failed")]
    Authentication,

    /// Base64 or UTF-8 decoding failed
    #[error("encoding error: {reason}")]
    Encoding {
        /// Decoder error message
        reason: String,
    },

    /// Requested HKDF output exceeds 255 hash blocks
    #[error("requested {requested} bytes of key material, maximum is {max}")]
    Length {
        /// Requested output length
        requested: usize,
        /// Largest allowed output length
        max: usize,
    },

    /// Empty or inconsistent input (e.g. mismatched key lengths)
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the input
        reason: String,
    },

    /// Message number jumps further ahead than the skip limit allows
    #[error("message number {requested} is too far ahead of {current}")]
    SkipLimitExceeded {
        /// Messages received so far in the current chain
        current: u32,
        /// Message number announced by the header
        requested: u32,
    },

    /// Message key was already consumed (replay or duplicate delivery)
    #[error("message {msg_num} was already decrypted")]
    DuplicateMessage {
        /// Message number from the header
        msg_num: u32,
    },

    /// Chain message counter would overflow
    #[error("message counter overflow")]
    CounterOverflow,

    /// The operating system RNG is unavailable
    #[error("entropy source unavailable: {reason}")]
    Entropy {
        /// RNG error message
        reason: String,
    },
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, a broken peer, or a bug.
    /// Non-fatal errors concern a single message and leave the session
    /// usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            // Protocol violations - fatal
            Self::UntrustedBundle => true,
            Self::InvalidKey { .. } => true,
            Self::CounterOverflow => true,
            Self::Entropy { .. } => true,

            // Scoped to one message or one call
            Self::Authentication => false,
            Self::Encoding { .. } => false,
            Self::Length { .. } => false,
            Self::InvalidInput { .. } => false,
            Self::SkipLimitExceeded { .. } => false,
            Self::DuplicateMessage { .. } => false,
        }
    }

    pub(crate) fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untrusted_bundle_is_fatal() {
        assert!(CryptoError::UntrustedBundle.is_fatal());
    }

    #[test]
    fn authentication_failure_is_not_fatal() {
        assert!(!CryptoError::Authentication.is_fatal());
    }

    #[test]
    fn duplicate_message_is_not_fatal() {
        assert!(!CryptoError::DuplicateMessage { msg_num: 3 }.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::SkipLimitExceeded { current: 10, requested: 5000 };
        assert_eq!(err.to_string(), "message number 5000 is too far ahead of 10");

        let err = CryptoError::Length { requested: 9000, max: 8160 };
        assert_eq!(err.to_string(), "requested 9000 bytes of key material, maximum is 8160");
    }
}
