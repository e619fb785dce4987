//! X3DH initial key agreement
//!
//! The initiator combines its identity key and a fresh ephemeral key with the
//! responder's published bundle; the responder later recomputes the same
//! four DH values from the initiator's identity and ephemeral public keys.
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)        omitted when the bundle has no OPK
//!
//! SK  = HKDF(DH1 ‖ DH2 ‖ DH3 ‖ [DH4], salt = 0^32, info = "lockbox-x3dh")
//! ```
//!
//! Identity keys are Ed25519 and enter the computation in their Montgomery
//! (X25519) form.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    env::Environment,
    error::CryptoError,
    kdf::{self, HASH_LENGTH},
    keys::{
        AgreementKeyPair, AgreementPublicKey, IdentityKeyPair, IdentityPublicKey, KeyBundle,
        OneTimePreKeyId,
    },
};

/// Info label for the X3DH combiner.
const X3DH_INFO: &[u8] = b"lockbox-x3dh";

/// 32-byte secret shared by both parties after X3DH.
///
/// Seeds the Double Ratchet root key; never used directly as an AEAD key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Result of the initiator side of X3DH.
#[derive(Debug)]
pub struct InitiatorOutput {
    /// Secret shared with the responder
    pub shared_secret: SharedSecret,
    /// Ephemeral public key, sent to the responder with the first message
    pub ephemeral_public: AgreementPublicKey,
    /// The responder's one-time prekey consumed by this handshake, if any
    pub one_time_prekey_id: Option<OneTimePreKeyId>,
}

/// Initiator side of X3DH.
///
/// Verifies the bundle's signed prekey signature before any DH is computed.
/// A bundle without a one-time prekey yields a valid secret without DH4
/// (reduced forward secrecy for the first messages).
///
/// # Errors
///
/// - `UntrustedBundle`: If the signed prekey signature does not verify
/// - `InvalidKey`: If a bundle key is not a valid point or a DH output is
///   all-zero
pub fn derive_shared_secret_initiator(
    env: &impl Environment,
    identity: &IdentityKeyPair,
    bundle: &KeyBundle,
) -> Result<InitiatorOutput, CryptoError> {
    bundle.verify()?;

    let our_identity = identity.agreement_key_pair();
    let peer_identity = bundle.identity_key.agreement_key()?;
    let ephemeral = AgreementKeyPair::generate(env);

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * 32));
    ikm.extend_from_slice(&*our_identity.diffie_hellman(&bundle.signed_prekey)?);
    ikm.extend_from_slice(&*ephemeral.diffie_hellman(&peer_identity)?);
    ikm.extend_from_slice(&*ephemeral.diffie_hellman(&bundle.signed_prekey)?);
    if let Some(opk) = &bundle.one_time_prekey {
        ikm.extend_from_slice(&*ephemeral.diffie_hellman(&opk.public_key)?);
    }

    Ok(InitiatorOutput {
        shared_secret: combine(&ikm)?,
        ephemeral_public: ephemeral.public_key(),
        one_time_prekey_id: bundle.one_time_prekey.map(|opk| opk.id),
    })
}

/// Responder side of X3DH.
///
/// Mirrors the initiator's four DH computations. `one_time_prekey` must be
/// the private half of the OPK named by the initiator, or `None` if the
/// initiator's bundle carried no OPK.
///
/// # Errors
///
/// - `InvalidKey`: If a peer key is not a valid point or a DH output is
///   all-zero
pub fn derive_shared_secret_responder(
    identity: &IdentityKeyPair,
    signed_prekey: &AgreementKeyPair,
    peer_ephemeral: &AgreementPublicKey,
    peer_identity: &IdentityPublicKey,
    one_time_prekey: Option<&AgreementKeyPair>,
) -> Result<SharedSecret, CryptoError> {
    let our_identity = identity.agreement_key_pair();
    let peer_identity = peer_identity.agreement_key()?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * 32));
    ikm.extend_from_slice(&*signed_prekey.diffie_hellman(&peer_identity)?);
    ikm.extend_from_slice(&*our_identity.diffie_hellman(peer_ephemeral)?);
    ikm.extend_from_slice(&*signed_prekey.diffie_hellman(peer_ephemeral)?);
    if let Some(opk) = one_time_prekey {
        ikm.extend_from_slice(&*opk.diffie_hellman(peer_ephemeral)?);
    }

    combine(&ikm)
}

fn combine(ikm: &[u8]) -> Result<SharedSecret, CryptoError> {
    let okm = Zeroizing::new(kdf::hkdf(ikm, Some(&[0u8; HASH_LENGTH]), X3DH_INFO, 32)?);

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&okm);
    Ok(SharedSecret(secret))
}
