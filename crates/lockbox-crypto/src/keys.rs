//! Key material: identity keys, prekeys, and published bundles
//!
//! Identity keys are Ed25519 (signature-capable). Signed prekeys, one-time
//! prekeys, ephemeral keys, and ratchet keys are X25519 (key-agreement
//! capable). Identity keys take part in X3DH through the birational map
//! from Edwards to Montgomery form.
//!
//! Public keys are parsed into fixed-size types at the boundary, so no DH
//! call ever sees wrong-length input.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    encoding::{self, key_from_slice},
    env::Environment,
    error::CryptoError,
};

/// Ed25519 signature size (64 bytes)
pub const SIGNATURE_LENGTH: usize = 64;

/// Long-lived, signature-capable identity key pair.
///
/// Created once per local user and never rotated in normal operation.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity from environment randomness.
    pub fn generate(env: &impl Environment) -> Self {
        let seed = Zeroizing::new(env.random_array::<32>());
        Self::from_seed(&seed)
    }

    /// Restore an identity from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// The 32-byte seed, for persistence in secure storage.
    pub fn to_seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Public half.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> PreKeySignature {
        PreKeySignature(self.signing.sign(message).to_bytes())
    }

    /// Key-agreement form of the identity key (Edwards → Montgomery).
    pub(crate) fn agreement_key_pair(&self) -> AgreementKeyPair {
        AgreementKeyPair::from_secret_bytes(*Zeroizing::new(self.signing.to_scalar_bytes()))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public_key()).finish_non_exhaustive()
    }
}

/// Public half of an [`IdentityKeyPair`] (Ed25519, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey([u8; 32]);

impl IdentityPublicKey {
    /// Parse an identity public key.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: If the input is not 32 bytes or not a valid Edwards
    ///   point
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = key_from_slice(bytes)?;
        VerifyingKey::from_bytes(&key)
            .map_err(|e| CryptoError::invalid_key(format!("identity key: {e}")))?;
        Ok(Self(key))
    }

    /// Parse a base64url identity public key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&encoding::decode(encoded)?)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base64url encoding.
    pub fn to_base64(&self) -> String {
        encoding::encode(&self.0)
    }

    /// Verify a signature made by the matching identity private key.
    ///
    /// # Errors
    ///
    /// - `UntrustedBundle`: If the signature does not verify
    /// - `InvalidKey`: If the stored bytes are not a valid Edwards point
    pub fn verify(&self, message: &[u8], signature: &PreKeySignature) -> Result<(), CryptoError> {
        let verifying = self.verifying_key()?;
        verifying
            .verify_strict(message, &Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::UntrustedBundle)
    }

    /// Key-agreement form of the identity key (Edwards → Montgomery).
    pub fn agreement_key(&self) -> Result<AgreementPublicKey, CryptoError> {
        Ok(AgreementPublicKey(self.verifying_key()?.to_montgomery().to_bytes()))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::invalid_key(format!("identity key: {e}")))
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", self.to_base64())
    }
}

/// X25519 public key (signed prekeys, one-time prekeys, ephemeral and
/// ratchet keys).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgreementPublicKey([u8; 32]);

impl AgreementPublicKey {
    /// Wrap raw X25519 public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse an X25519 public key.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: If the input is not 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(key_from_slice(bytes)?))
    }

    /// Parse a base64url X25519 public key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Ok(Self(encoding::decode_key(encoded)?))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base64url encoding.
    pub fn to_base64(&self) -> String {
        encoding::encode(&self.0)
    }
}

impl fmt::Debug for AgreementPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgreementPublicKey({})", self.to_base64())
    }
}

/// X25519 key pair.
///
/// Serializes as the 32-byte secret; the public half is recomputed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "AgreementSecretBytes", into = "AgreementSecretBytes")]
pub struct AgreementKeyPair {
    secret: StaticSecret,
    public: AgreementPublicKey,
}

impl AgreementKeyPair {
    /// Generate a fresh key pair from environment randomness.
    pub fn generate(env: &impl Environment) -> Self {
        let bytes = Zeroizing::new(env.random_array::<32>());
        Self::from_secret_bytes(*bytes)
    }

    /// Restore a key pair from its secret scalar bytes (clamped on use).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = AgreementPublicKey(PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> AgreementPublicKey {
        self.public
    }

    /// X25519 Diffie-Hellman with a peer public key.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: If the peer key is a low-order point (all-zero output)
    pub fn diffie_hellman(
        &self,
        peer: &AgreementPublicKey,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(CryptoError::invalid_key("peer key is a low-order point"));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Serialized form of an [`AgreementKeyPair`].
#[derive(Serialize, Deserialize)]
struct AgreementSecretBytes([u8; 32]);

impl From<AgreementSecretBytes> for AgreementKeyPair {
    fn from(bytes: AgreementSecretBytes) -> Self {
        let secret = Zeroizing::new(bytes.0);
        Self::from_secret_bytes(*secret)
    }
}

impl From<AgreementKeyPair> for AgreementSecretBytes {
    fn from(pair: AgreementKeyPair) -> Self {
        Self(pair.secret.to_bytes())
    }
}

/// Ed25519 signature over a signed prekey's public half.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PreKeySignature([u8; SIGNATURE_LENGTH]);

impl PreKeySignature {
    /// Parse a 64-byte signature.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: If the input is not 64 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        <[u8; SIGNATURE_LENGTH]>::try_from(bytes).map(Self).map_err(|_| {
            CryptoError::invalid_key(format!(
                "signature must be {SIGNATURE_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })
    }

    /// Parse a base64url signature.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&encoding::decode(encoded)?)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// Base64url encoding.
    pub fn to_base64(&self) -> String {
        encoding::encode(&self.0)
    }
}

impl TryFrom<Vec<u8>> for PreKeySignature {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_slice(&bytes)
    }
}

impl From<PreKeySignature> for Vec<u8> {
    fn from(signature: PreKeySignature) -> Self {
        signature.0.to_vec()
    }
}

impl fmt::Debug for PreKeySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreKeySignature({})", self.to_base64())
    }
}

/// Medium-term key-agreement key signed by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    key_pair: AgreementKeyPair,
    signature: PreKeySignature,
}

impl SignedPreKey {
    /// Generate a key pair and sign its public half with the identity key.
    pub fn generate(env: &impl Environment, identity: &IdentityKeyPair) -> Self {
        let key_pair = AgreementKeyPair::generate(env);
        let signature = identity.sign(key_pair.public_key().as_bytes());
        Self { key_pair, signature }
    }

    /// The key pair (private half used by the responder).
    pub fn key_pair(&self) -> &AgreementKeyPair {
        &self.key_pair
    }

    /// Public half.
    pub fn public_key(&self) -> AgreementPublicKey {
        self.key_pair.public_key()
    }

    /// Signature over the public half.
    pub fn signature(&self) -> PreKeySignature {
        self.signature
    }
}

/// Opaque identifier of a one-time prekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OneTimePreKeyId(pub u64);

impl fmt::Display for OneTimePreKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Single-use key-agreement key held in the local pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    id: OneTimePreKeyId,
    key_pair: AgreementKeyPair,
    used: bool,
}

impl OneTimePreKey {
    /// Generate one prekey tagged with a fresh random identifier.
    pub fn generate(env: &impl Environment) -> Self {
        Self {
            id: OneTimePreKeyId(env.random_u64()),
            key_pair: AgreementKeyPair::generate(env),
            used: false,
        }
    }

    /// Generate a batch of `count` prekeys.
    pub fn generate_batch(env: &impl Environment, count: usize) -> Vec<Self> {
        (0..count).map(|_| Self::generate(env)).collect()
    }

    /// Identifier.
    pub fn id(&self) -> OneTimePreKeyId {
        self.id
    }

    /// The key pair (private half used by the responder).
    pub fn key_pair(&self) -> &AgreementKeyPair {
        &self.key_pair
    }

    /// True once consumed by a handshake.
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Mark consumed. A consumed prekey must never be used for DH again.
    pub fn mark_used(&mut self) {
        self.used = true;
    }

    /// Public half for upload.
    pub fn public(&self) -> PublicOneTimePreKey {
        PublicOneTimePreKey { id: self.id, public_key: self.key_pair.public_key() }
    }
}

/// Public half of a one-time prekey as published in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicOneTimePreKey {
    /// Identifier
    pub id: OneTimePreKeyId,
    /// X25519 public key
    pub public_key: AgreementPublicKey,
}

/// Publishable material for one user, as returned by a bundle fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Identity public key (Ed25519)
    pub identity_key: IdentityPublicKey,
    /// Signed prekey public key (X25519)
    pub signed_prekey: AgreementPublicKey,
    /// Identity signature over `signed_prekey`
    pub signed_prekey_signature: PreKeySignature,
    /// At most one one-time prekey, removed from the directory by the fetch
    pub one_time_prekey: Option<PublicOneTimePreKey>,
}

impl KeyBundle {
    /// Assemble a bundle from local key material.
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<PublicOneTimePreKey>,
    ) -> Self {
        Self {
            identity_key: identity.public_key(),
            signed_prekey: signed_prekey.public_key(),
            signed_prekey_signature: signed_prekey.signature(),
            one_time_prekey,
        }
    }

    /// Verify the signed prekey signature against the identity key.
    ///
    /// # Errors
    ///
    /// - `UntrustedBundle`: If the signature does not verify
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity_key.verify(self.signed_prekey.as_bytes(), &self.signed_prekey_signature)
    }

    /// Encode for the wire as base64url strings.
    pub fn to_wire(&self) -> WireKeyBundle {
        WireKeyBundle {
            identity_key: self.identity_key.to_base64(),
            signed_prekey: self.signed_prekey.to_base64(),
            signed_prekey_signature: self.signed_prekey_signature.to_base64(),
            one_time_prekey: self.one_time_prekey.map(|opk| opk.public_key.to_base64()),
            one_time_prekey_id: self.one_time_prekey.map(|opk| opk.id.0),
        }
    }
}

/// Wire form of a [`KeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireKeyBundle {
    /// Base64url identity key
    pub identity_key: String,
    /// Base64url signed prekey
    pub signed_prekey: String,
    /// Base64url signature
    pub signed_prekey_signature: String,
    /// Base64url one-time prekey, if the pool was not empty
    pub one_time_prekey: Option<String>,
    /// One-time prekey identifier
    pub one_time_prekey_id: Option<u64>,
}

impl WireKeyBundle {
    /// Parse every field into fixed-size key types.
    ///
    /// # Errors
    ///
    /// - `Encoding`: If a field is not base64url
    /// - `InvalidKey`: If a key or signature has the wrong length, or a
    ///   one-time prekey is missing its identifier
    pub fn decode(&self) -> Result<KeyBundle, CryptoError> {
        let one_time_prekey = match (&self.one_time_prekey, self.one_time_prekey_id) {
            (Some(key), Some(id)) => Some(PublicOneTimePreKey {
                id: OneTimePreKeyId(id),
                public_key: AgreementPublicKey::from_base64(key)?,
            }),
            (None, _) => None,
            (Some(_), None) => {
                return Err(CryptoError::invalid_key("one-time prekey without identifier"));
            },
        };

        Ok(KeyBundle {
            identity_key: IdentityPublicKey::from_base64(&self.identity_key)?,
            signed_prekey: AgreementPublicKey::from_base64(&self.signed_prekey)?,
            signed_prekey_signature: PreKeySignature::from_base64(&self.signed_prekey_signature)?,
            one_time_prekey,
        })
    }
}
