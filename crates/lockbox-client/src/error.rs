//! Client error types

use std::time::Duration;

use lockbox_crypto::{CryptoError, OneTimePreKeyId};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the key directory service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Directory unreachable or request failed in transit
    #[error("key directory unreachable: {reason}")]
    Network {
        /// Transport error message
        reason: String,
    },

    /// No bundle is registered for the user
    #[error("no key bundle registered for {user}")]
    NotFound {
        /// User that was looked up
        user: String,
    },
}

/// Errors from client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Cryptographic failure (never downgraded)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key directory request failed
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Secure storage read or write failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network-bound step exceeded its deadline
    #[error("operation timed out after {after:?}")]
    Timeout {
        /// Configured deadline
        after: Duration,
    },

    /// Handshake names a one-time prekey that is unknown or already consumed
    #[error("unknown or consumed one-time prekey {id}")]
    UnknownOneTimePreKey {
        /// Identifier from the handshake
        id: OneTimePreKeyId,
    },

    /// Handshake names a signed prekey this client no longer holds
    #[error("unknown signed prekey")]
    UnknownSignedPreKey,

    /// First message from a peer arrived without handshake material
    #[error("no session with {peer} and no handshake attached")]
    MissingHandshake {
        /// Sender of the message
        peer: String,
    },

    /// Handshake was already used to establish an earlier session
    #[error("replayed handshake from {peer}")]
    ReplayedHandshake {
        /// Sender of the message
        peer: String,
    },

    /// No session exists for the conversation
    #[error("no session with {peer}")]
    NoSession {
        /// Conversation peer
        peer: String,
    },

    /// Envelope could not be encoded or decoded
    #[error("malformed envelope: {reason}")]
    Envelope {
        /// What was wrong with the envelope
        reason: String,
    },
}

impl ClientError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors require re-establishing the session or operator
    /// attention. Network and per-message errors are not fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Crypto(err) => err.is_fatal(),
            Self::Storage(_) => true,

            Self::Directory(_) => false,
            Self::Timeout { .. } => false,
            Self::UnknownOneTimePreKey { .. } => false,
            Self::UnknownSignedPreKey => false,
            Self::MissingHandshake { .. } => false,
            Self::ReplayedHandshake { .. } => false,
            Self::NoSession { .. } => false,
            Self::Envelope { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_fatality_is_preserved() {
        assert!(ClientError::from(CryptoError::UntrustedBundle).is_fatal());
        assert!(!ClientError::from(CryptoError::Authentication).is_fatal());
    }

    #[test]
    fn network_failures_are_not_fatal() {
        let err = ClientError::from(DirectoryError::Network { reason: "refused".to_string() });
        assert!(!err.is_fatal());
        assert!(!ClientError::Timeout { after: Duration::from_secs(1) }.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = ClientError::UnknownOneTimePreKey { id: OneTimePreKeyId(0xab) };
        assert_eq!(err.to_string(), "unknown or consumed one-time prekey 00000000000000ab");

        let err = ClientError::Timeout { after: Duration::from_secs(10) };
        assert_eq!(err.to_string(), "operation timed out after 10s");
    }
}
