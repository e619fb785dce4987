//! Lockbox Cryptographic Primitives
//!
//! Cryptographic building blocks for Lockbox end-to-end encrypted messaging.
//! Everything here is synchronous and free of I/O. Operations that need
//! randomness take an [`Environment`] handle, so tests can supply seeded
//! entropy and production code cannot run before a working RNG exists.
//!
//! # Key Lifecycle
//!
//! A session starts with an X3DH handshake against the peer's published key
//! bundle. The resulting shared secret seeds a Double Ratchet, which mixes in
//! a fresh Diffie-Hellman output whenever the peer's ratchet key changes and
//! advances a symmetric chain for every message.
//!
//! ```text
//! Peer KeyBundle (IK, SPK + sig, OPK?)
//!        │
//!        ▼ X3DH: DH1 ‖ DH2 ‖ DH3 ‖ [DH4] → HKDF
//! Shared Secret
//!        │
//!        ▼ DH ratchet step: HKDF(root ‖ DH(ratchet keys))
//! Root Key ──► Chain Key (send / receive)
//!                 │
//!                 ▼ Symmetric ratchet step: HKDF(chain key)
//!              Message Key
//!                 │
//!                 ▼ AES-256-GCM (header as associated data)
//!              Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are replaced on every message; message keys are used once
//! - Consumed one-time prekeys are never used for DH again
//! - Skipped message keys are removed the moment they are consumed
//!
//! Break-in Recovery:
//! - Every change of the peer's ratchet key triggers a DH ratchet step that
//!   derives a new root key from fresh key agreement material
//!
//! Authenticity:
//! - AES-256-GCM tag failures surface as [`CryptoError::Authentication`]
//! - Signed prekeys must verify against the publisher's identity key before
//!   any DH is attempted
//!
//! The [`group`] module provides a deliberately weaker, non-forward-secret
//! fallback with its own [`GroupSecret`] type.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod encoding;
pub mod env;
pub mod error;
pub mod group;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use aead::{SealedPayload, WirePayload};
pub use env::Environment;
pub use error::CryptoError;
pub use group::{GroupSecret, derive_group_secret};
pub use keys::{
    AgreementKeyPair, AgreementPublicKey, IdentityKeyPair, IdentityPublicKey, KeyBundle,
    OneTimePreKey, OneTimePreKeyId, PreKeySignature, PublicOneTimePreKey, SignedPreKey,
    WireKeyBundle,
};
pub use ratchet::{
    MAX_SKIP, MAX_SKIPPED_KEYS, MessageHeader, RatchetMessage, RatchetState, WireHeader,
    init_ratchet_state,
};
pub use x3dh::{
    InitiatorOutput, SharedSecret, derive_shared_secret_initiator, derive_shared_secret_responder,
};
