//! Message envelope
//!
//! The envelope is what travels between clients: version, algorithm tag,
//! sender, ratchet header, and the sealed payload. Key material is carried as
//! base64url strings so the envelope stays readable in any serialization;
//! [`Envelope::to_bytes`] uses CBOR.
//!
//! An initiator attaches a [`HandshakeInit`] to every message it sends until
//! the responder's first reply arrives, so the responder can establish the
//! session from whichever message it receives first.

use lockbox_crypto::{
    AgreementPublicKey, CryptoError, IdentityPublicKey, OneTimePreKeyId, RatchetMessage,
    WireHeader, WirePayload,
};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Algorithm tag for AES-256-GCM payloads.
pub const ALGORITHM: &str = "aes-256-gcm";

/// X3DH initial message data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// Initiator's identity public key (base64url)
    pub identity_key: String,
    /// Initiator's ephemeral public key (base64url)
    pub ephemeral_key: String,
    /// Responder signed prekey the handshake was computed against
    /// (base64url)
    pub signed_prekey: String,
    /// Responder one-time prekey consumed by the handshake, if any
    pub one_time_prekey_id: Option<u64>,
}

/// Decoded [`HandshakeInit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHandshake {
    /// Initiator's identity public key
    pub identity_key: IdentityPublicKey,
    /// Initiator's ephemeral public key
    pub ephemeral_key: AgreementPublicKey,
    /// Responder signed prekey used by the initiator
    pub signed_prekey: AgreementPublicKey,
    /// Responder one-time prekey used by the initiator
    pub one_time_prekey_id: Option<OneTimePreKeyId>,
}

impl HandshakeInit {
    /// Encode handshake keys.
    pub fn new(
        identity_key: &IdentityPublicKey,
        ephemeral_key: &AgreementPublicKey,
        signed_prekey: &AgreementPublicKey,
        one_time_prekey_id: Option<OneTimePreKeyId>,
    ) -> Self {
        Self {
            identity_key: identity_key.to_base64(),
            ephemeral_key: ephemeral_key.to_base64(),
            signed_prekey: signed_prekey.to_base64(),
            one_time_prekey_id: one_time_prekey_id.map(|id| id.0),
        }
    }

    /// Decode handshake keys.
    ///
    /// # Errors
    ///
    /// - `Encoding`: If a key is not valid base64url
    /// - `InvalidKey`: If a key has the wrong length
    pub fn decode(&self) -> Result<DecodedHandshake, CryptoError> {
        Ok(DecodedHandshake {
            identity_key: IdentityPublicKey::from_base64(&self.identity_key)?,
            ephemeral_key: AgreementPublicKey::from_base64(&self.ephemeral_key)?,
            signed_prekey: AgreementPublicKey::from_base64(&self.signed_prekey)?,
            one_time_prekey_id: self.one_time_prekey_id.map(OneTimePreKeyId),
        })
    }
}

/// Encrypted message as sent between clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version, currently [`ENVELOPE_VERSION`]
    pub version: u8,
    /// Payload algorithm, currently [`ALGORITHM`]
    pub algorithm: String,
    /// Sender's user identifier
    pub sender: String,
    /// Ratchet header
    pub header: WireHeader,
    /// Nonce and ciphertext
    pub payload: WirePayload,
    /// X3DH data, present until the session is confirmed by a reply
    pub handshake: Option<HandshakeInit>,
}

impl Envelope {
    /// Wrap a ratchet message.
    pub fn new(
        sender: impl Into<String>,
        message: &RatchetMessage,
        handshake: Option<HandshakeInit>,
    ) -> Self {
        let (header, payload) = message.to_wire();
        Self {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM.to_string(),
            sender: sender.into(),
            header,
            payload,
            handshake,
        }
    }

    /// Decode the ratchet message, checking version and algorithm.
    ///
    /// # Errors
    ///
    /// - `Envelope`: If the version or algorithm is not supported
    /// - `Crypto`: If a header key or the payload fails to decode
    pub fn ratchet_message(&self) -> Result<RatchetMessage, ClientError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ClientError::Envelope {
                reason: format!("unsupported version {}", self.version),
            });
        }
        if self.algorithm != ALGORITHM {
            return Err(ClientError::Envelope {
                reason: format!("unsupported algorithm {}", self.algorithm),
            });
        }

        Ok(RatchetMessage::from_wire(&self.header, &self.payload)?)
    }

    /// CBOR encoding.
    ///
    /// # Errors
    ///
    /// - `Envelope`: If serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClientError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ClientError::Envelope { reason: e.to_string() })?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `Envelope`: If the bytes are not a CBOR envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        ciborium::from_reader(bytes).map_err(|e| ClientError::Envelope { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use lockbox_crypto::{IdentityKeyPair, MessageHeader, SealedPayload};

    use super::*;

    fn message() -> RatchetMessage {
        RatchetMessage {
            header: MessageHeader {
                ratchet_key: AgreementPublicKey::from_bytes([9; 32]),
                previous_chain_len: 2,
                msg_num: 5,
            },
            payload: SealedPayload { nonce: [1; 12], ciphertext: vec![2; 20] },
        }
    }

    #[test]
    fn cbor_encoding_preserves_envelope() {
        let handshake = HandshakeInit::new(
            &IdentityKeyPair::from_seed(&[3; 32]).public_key(),
            &AgreementPublicKey::from_bytes([4; 32]),
            &AgreementPublicKey::from_bytes([5; 32]),
            Some(OneTimePreKeyId(77)),
        );
        let envelope = Envelope::new("alice", &message(), Some(handshake));

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.ratchet_message().unwrap(), message());

        let handshake = decoded.handshake.unwrap().decode().unwrap();
        assert_eq!(handshake.one_time_prekey_id, Some(OneTimePreKeyId(77)));
        assert_eq!(handshake.ephemeral_key, AgreementPublicKey::from_bytes([4; 32]));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut envelope = Envelope::new("alice", &message(), None);
        envelope.version = 2;
        assert!(matches!(envelope.ratchet_message(), Err(ClientError::Envelope { .. })));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut envelope = Envelope::new("alice", &message(), None);
        envelope.algorithm = "chacha20-poly1305".to_string();
        assert!(matches!(envelope.ratchet_message(), Err(ClientError::Envelope { .. })));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(matches!(Envelope::from_bytes(&[0xff, 0x00]), Err(ClientError::Envelope { .. })));
    }
}
