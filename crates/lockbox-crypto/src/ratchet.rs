//! Double Ratchet session state
//!
//! Each conversation owns one [`RatchetState`]. Every message advances a
//! symmetric chain; whenever the peer announces a new ratchet public key the
//! receiving side mixes a fresh DH output into the root key, and the next
//! send does the same with a newly generated local key pair.
//!
//! # Message Numbering
//!
//! Message numbers are 1-based within a sending chain. A receiver that has
//! consumed `recv_count` messages of the current chain and sees
//! `msg_num > recv_count + 1` derives and caches the keys for the messages
//! in between, so they stay decryptable when they arrive late. Headers also
//! carry the length of the sender's previous chain, which lets the receiver
//! cache the tail of the old chain before switching to the new one.
//!
//! # Failure Atomicity
//!
//! [`RatchetState::decrypt`] computes the DH step, chain advancement, and
//! skipped keys on the side and commits them only after AES-GCM accepts the
//! tag. A tampered or forged message therefore leaves the session exactly
//! as it was.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{
    aead::{self, SealedPayload, WirePayload},
    encoding,
    env::Environment,
    error::CryptoError,
    kdf::{ChainKey, MessageKey, RootKey, kdf_chain, kdf_root},
    keys::{AgreementKeyPair, AgreementPublicKey},
    x3dh::SharedSecret,
};

/// Largest gap between the receive counter and an announced message number.
///
/// Headers jumping further ahead are rejected before any key is derived.
pub const MAX_SKIP: u32 = 1000;

/// Capacity of the skipped-message-key cache.
///
/// When full, the oldest entries are evicted first.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Associated-data length: ratchet key (32) + previous chain length (4) +
/// message number (4).
const HEADER_AAD_LENGTH: usize = 32 + 4 + 4;

/// Plaintext header sent with every ratcheted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: AgreementPublicKey,
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_len: u32,
    /// 1-based message number within the current sending chain
    pub msg_num: u32,
}

impl MessageHeader {
    /// Bytes bound to the ciphertext as AEAD associated data.
    pub fn associated_data(&self) -> [u8; HEADER_AAD_LENGTH] {
        let mut aad = [0u8; HEADER_AAD_LENGTH];
        aad[..32].copy_from_slice(self.ratchet_key.as_bytes());
        aad[32..36].copy_from_slice(&self.previous_chain_len.to_be_bytes());
        aad[36..].copy_from_slice(&self.msg_num.to_be_bytes());
        aad
    }

    /// Encode for the wire.
    pub fn to_wire(&self) -> WireHeader {
        WireHeader {
            ratchet_key: self.ratchet_key.to_base64(),
            previous_chain_len: self.previous_chain_len,
            msg_num: self.msg_num,
        }
    }
}

/// Wire form of a [`MessageHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    /// Base64url ratchet public key
    pub ratchet_key: String,
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_len: u32,
    /// 1-based message number
    pub msg_num: u32,
}

impl WireHeader {
    /// Parse the ratchet key into a fixed-size key.
    ///
    /// # Errors
    ///
    /// - `Encoding`: If the key is not base64url
    /// - `InvalidKey`: If the key is not 32 bytes
    pub fn decode(&self) -> Result<MessageHeader, CryptoError> {
        Ok(MessageHeader {
            ratchet_key: AgreementPublicKey::from_base64(&self.ratchet_key)?,
            previous_chain_len: self.previous_chain_len,
            msg_num: self.msg_num,
        })
    }
}

/// A ratcheted message: header plus sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Plaintext header (authenticated as associated data)
    pub header: MessageHeader,
    /// Nonce and ciphertext
    pub payload: SealedPayload,
}

impl RatchetMessage {
    /// Encode header and payload for the wire.
    pub fn to_wire(&self) -> (WireHeader, WirePayload) {
        (self.header.to_wire(), self.payload.to_wire())
    }

    /// Parse a wire header and payload.
    pub fn from_wire(header: &WireHeader, payload: &WirePayload) -> Result<Self, CryptoError> {
        Ok(Self { header: header.decode()?, payload: payload.decode()? })
    }
}

type SkippedKeyId = (AgreementPublicKey, u32);

/// Bounded cache of message keys for messages that have not arrived yet.
///
/// Entries are write-once read-once: a key is removed the moment it
/// decrypts its message.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SkippedMessageKey>", into = "Vec<SkippedMessageKey>")]
struct SkippedKeys {
    keys: HashMap<SkippedKeyId, MessageKey>,
    order: VecDeque<SkippedKeyId>,
}

impl SkippedKeys {
    fn get(&self, id: &SkippedKeyId) -> Option<&MessageKey> {
        self.keys.get(id)
    }

    fn insert(&mut self, id: SkippedKeyId, key: MessageKey) {
        if self.keys.insert(id, key).is_none() {
            self.order.push_back(id);
        }

        while self.keys.len() > MAX_SKIPPED_KEYS {
            let Some(oldest) = self.order.pop_front() else { break };
            self.keys.remove(&oldest);
        }
    }

    fn remove(&mut self, id: &SkippedKeyId) {
        if self.keys.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Persisted form of one skipped-key entry.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: AgreementPublicKey,
    msg_num: u32,
    key: MessageKey,
}

impl From<Vec<SkippedMessageKey>> for SkippedKeys {
    fn from(entries: Vec<SkippedMessageKey>) -> Self {
        let mut skipped = Self::default();
        for entry in entries {
            skipped.insert((entry.ratchet_key, entry.msg_num), entry.key);
        }
        skipped
    }
}

impl From<SkippedKeys> for Vec<SkippedMessageKey> {
    fn from(mut skipped: SkippedKeys) -> Self {
        skipped
            .order
            .iter()
            .filter_map(|id| {
                skipped.keys.remove(id).map(|key| SkippedMessageKey {
                    ratchet_key: id.0,
                    msg_num: id.1,
                    key,
                })
            })
            .collect()
    }
}

/// Receive-side changes computed for one incoming message.
struct ReceiveAdvance {
    dh_step: Option<RootKey>,
    recv_chain_key: ChainKey,
    skipped: Vec<(SkippedKeyId, MessageKey)>,
    message_key: MessageKey,
}

/// Double Ratchet state for one conversation.
///
/// Must be mutated under mutual exclusion: concurrent `encrypt` calls on
/// the same state would derive the same message key twice. Serializable so
/// sessions survive restarts; re-running X3DH creates an unrelated session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: RootKey,
    send_chain_key: ChainKey,
    recv_chain_key: ChainKey,
    send_count: u32,
    recv_count: u32,
    previous_chain_len: u32,
    dh_pair: AgreementKeyPair,
    remote_dh_pub: Option<AgreementPublicKey>,
    dh_ratchet_needed: bool,
    skipped_keys: SkippedKeys,
}

/// Create a ratchet state from an X3DH root secret.
///
/// Equivalent to [`RatchetState::new`].
pub fn init_ratchet_state(env: &impl Environment, root_secret: &SharedSecret) -> RatchetState {
    RatchetState::new(env, root_secret)
}

impl RatchetState {
    /// Create a state with a fresh local ratchet key pair and no known
    /// remote ratchet key.
    ///
    /// Root, sending, and receiving chain keys all start as the root
    /// secret; the first DH ratchet step replaces them.
    pub fn new(env: &impl Environment, root_secret: &SharedSecret) -> Self {
        Self::bootstrap(root_secret, AgreementKeyPair::generate(env), None)
    }

    /// Initiator state after X3DH.
    ///
    /// The responder's signed prekey acts as its first ratchet public key,
    /// so the first `encrypt` performs a DH step the responder can mirror.
    pub fn new_initiator(
        env: &impl Environment,
        root_secret: &SharedSecret,
        peer_signed_prekey: AgreementPublicKey,
    ) -> Self {
        Self::bootstrap(root_secret, AgreementKeyPair::generate(env), Some(peer_signed_prekey))
    }

    /// Responder state after X3DH, using the signed prekey as the initial
    /// local ratchet key pair.
    pub fn new_responder(root_secret: &SharedSecret, signed_prekey: AgreementKeyPair) -> Self {
        Self::bootstrap(root_secret, signed_prekey, None)
    }

    fn bootstrap(
        root_secret: &SharedSecret,
        dh_pair: AgreementKeyPair,
        remote_dh_pub: Option<AgreementPublicKey>,
    ) -> Self {
        let secret = *root_secret.as_bytes();
        Self {
            root_key: RootKey::from_bytes(secret),
            send_chain_key: ChainKey::from_bytes(secret),
            recv_chain_key: ChainKey::from_bytes(secret),
            send_count: 0,
            recv_count: 0,
            previous_chain_len: 0,
            dh_pair,
            remote_dh_pub,
            dh_ratchet_needed: true,
            skipped_keys: SkippedKeys::default(),
        }
    }

    /// Messages sent in the current sending chain.
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Messages consumed in the current receiving chain.
    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    /// Current local ratchet public key.
    pub fn ratchet_public_key(&self) -> AgreementPublicKey {
        self.dh_pair.public_key()
    }

    /// Last ratchet public key received from the peer.
    pub fn remote_ratchet_key(&self) -> Option<AgreementPublicKey> {
        self.remote_dh_pub
    }

    /// True if the next send performs a DH ratchet step.
    pub fn dh_ratchet_needed(&self) -> bool {
        self.dh_ratchet_needed && self.remote_dh_pub.is_some()
    }

    /// Encrypt bytes, advancing the sending chain.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: If the remote ratchet key yields an all-zero DH output
    /// - `CounterOverflow`: If the sending chain has reached `u32::MAX`
    /// - `InvalidInput`: If the plaintext exceeds the AES-GCM length limit
    pub fn encrypt(
        &mut self,
        env: &impl Environment,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, CryptoError> {
        let dh_step = match (self.dh_ratchet_needed, self.remote_dh_pub) {
            (true, Some(remote)) => {
                let pair = AgreementKeyPair::generate(env);
                let dh_output = pair.diffie_hellman(&remote)?;
                let (root_key, chain_key) = kdf_root(&self.root_key, &dh_output);
                Some((pair, root_key, chain_key))
            },
            _ => None,
        };

        let (chain_key, count, header) = match &dh_step {
            Some((pair, _, chain_key)) => (chain_key, 0, MessageHeader {
                ratchet_key: pair.public_key(),
                previous_chain_len: self.send_count,
                msg_num: 0,
            }),
            None => (&self.send_chain_key, self.send_count, MessageHeader {
                ratchet_key: self.dh_pair.public_key(),
                previous_chain_len: self.previous_chain_len,
                msg_num: 0,
            }),
        };

        let msg_num = count.checked_add(1).ok_or(CryptoError::CounterOverflow)?;
        let header = MessageHeader { msg_num, ..header };
        let (next_chain_key, message_key) = kdf_chain(chain_key);

        let payload =
            aead::encrypt(env, message_key.key(), plaintext, Some(&header.associated_data()))?;

        if let Some((pair, root_key, _)) = dh_step {
            self.previous_chain_len = self.send_count;
            self.dh_pair = pair;
            self.root_key = root_key;
            self.dh_ratchet_needed = false;
        }
        self.send_chain_key = next_chain_key;
        self.send_count = msg_num;

        Ok(RatchetMessage { header, payload })
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_text(
        &mut self,
        env: &impl Environment,
        plaintext: &str,
    ) -> Result<RatchetMessage, CryptoError> {
        self.encrypt(env, plaintext.as_bytes())
    }

    /// Decrypt a message, advancing the receiving side.
    ///
    /// Skipped keys are consulted first so late messages from an earlier
    /// chain never trigger a DH step. State changes are committed only if
    /// authentication succeeds.
    ///
    /// # Errors
    ///
    /// - `Authentication`: If the tag does not verify
    /// - `DuplicateMessage`: If the message key was already consumed
    /// - `SkipLimitExceeded`: If the header jumps more than [`MAX_SKIP`]
    ///   messages ahead
    /// - `InvalidKey`: If the header's ratchet key yields an all-zero DH
    ///   output
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;
        let aad = header.associated_data();

        let id = (header.ratchet_key, header.msg_num);
        if let Some(key) = self.skipped_keys.get(&id) {
            let plaintext = aead::decrypt(key.key(), &message.payload, Some(&aad))?;
            self.skipped_keys.remove(&id);
            return Ok(plaintext);
        }

        let advance = self.advance_receiving(header)?;
        let plaintext = aead::decrypt(advance.message_key.key(), &message.payload, Some(&aad))?;

        if let Some(root_key) = advance.dh_step {
            self.root_key = root_key;
            self.remote_dh_pub = Some(header.ratchet_key);
            self.dh_ratchet_needed = true;
        }
        self.recv_chain_key = advance.recv_chain_key;
        self.recv_count = header.msg_num;
        for (id, key) in advance.skipped {
            self.skipped_keys.insert(id, key);
        }

        Ok(plaintext)
    }

    /// Decrypt a message that must contain UTF-8 text.
    ///
    /// # Errors
    ///
    /// As [`RatchetState::decrypt`], plus `Encoding` for invalid UTF-8.
    pub fn decrypt_text(&mut self, message: &RatchetMessage) -> Result<String, CryptoError> {
        // Validate before committing so invalid UTF-8 leaves the state untouched
        let mut working = self.clone();
        let bytes = working.decrypt(message)?;
        let text =
            String::from_utf8(bytes).map_err(|e| CryptoError::Encoding { reason: e.to_string() })?;
        *self = working;
        Ok(text)
    }

    /// Compute the receive-side changes for `header` without mutating state.
    fn advance_receiving(&self, header: &MessageHeader) -> Result<ReceiveAdvance, CryptoError> {
        let mut skipped = Vec::new();
        let mut chain_key = self.recv_chain_key.clone();
        let mut count = self.recv_count;
        let mut dh_step = None;

        if self.remote_dh_pub != Some(header.ratchet_key) {
            if let Some(remote) = self.remote_dh_pub {
                chain_key =
                    skip_message_keys(chain_key, remote, count, header.previous_chain_len, &mut skipped)?;
            }

            let dh_output = self.dh_pair.diffie_hellman(&header.ratchet_key)?;
            let (root_key, new_chain_key) = kdf_root(&self.root_key, &dh_output);
            dh_step = Some(root_key);
            chain_key = new_chain_key;
            count = 0;
        }

        if header.msg_num <= count {
            return Err(CryptoError::DuplicateMessage { msg_num: header.msg_num });
        }
        chain_key =
            skip_message_keys(chain_key, header.ratchet_key, count, header.msg_num - 1, &mut skipped)?;

        let (recv_chain_key, message_key) = kdf_chain(&chain_key);
        Ok(ReceiveAdvance { dh_step, recv_chain_key, skipped, message_key })
    }
}

/// Derive the keys for messages `consumed + 1 ..= until` of a chain.
fn skip_message_keys(
    mut chain_key: ChainKey,
    ratchet_key: AgreementPublicKey,
    consumed: u32,
    until: u32,
    skipped: &mut Vec<(SkippedKeyId, MessageKey)>,
) -> Result<ChainKey, CryptoError> {
    if until <= consumed {
        return Ok(chain_key);
    }
    if until - consumed > MAX_SKIP {
        return Err(CryptoError::SkipLimitExceeded { current: consumed, requested: until + 1 });
    }

    for msg_num in consumed + 1..=until {
        let (next, message_key) = kdf_chain(&chain_key);
        skipped.push(((ratchet_key, msg_num), message_key));
        chain_key = next;
    }
    Ok(chain_key)
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("previous_chain_len", &self.previous_chain_len)
            .field("ratchet_key", &self.dh_pair.public_key())
            .field("remote_ratchet_key", &self.remote_dh_pub)
            .field("dh_ratchet_needed", &self.dh_ratchet_needed)
            .field("skipped_keys", &self.skipped_keys.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = encoding::encode(self.ratchet_key.as_bytes());
        write!(f, "{}#{} (pn {})", &key[..8], self.msg_num, self.previous_chain_len)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::env::test_env::SeededEnv;

    fn pair(env: &SeededEnv) -> (RatchetState, RatchetState) {
        let secret = SharedSecret::from_bytes([7u8; 32]);
        let bob_spk = AgreementKeyPair::generate(env);
        let alice = RatchetState::new_initiator(env, &secret, bob_spk.public_key());
        let bob = RatchetState::new_responder(&secret, bob_spk);
        (alice, bob)
    }

    #[test]
    fn message_numbers_start_at_one() {
        let env = SeededEnv::new(1);
        let (mut alice, _) = pair(&env);

        let first = alice.encrypt(&env, b"a").unwrap();
        let second = alice.encrypt(&env, b"b").unwrap();
        assert_eq!(first.header.msg_num, 1);
        assert_eq!(second.header.msg_num, 2);
        assert_eq!(alice.send_count(), 2);
    }

    #[test]
    fn sending_chain_never_repeats_a_message_key() {
        let env = SeededEnv::new(2);
        let mut chain_key = ChainKey::from_bytes([3u8; 32]);
        let mut seen = HashSet::new();

        for _ in 0..100 {
            let (next, message_key) = kdf_chain(&chain_key);
            assert!(seen.insert(*message_key.key()), "message key repeated");
            chain_key = next;
        }

        let (mut alice, _) = pair(&env);
        for n in 1..=100 {
            alice.encrypt(&env, b"x").unwrap();
            assert_eq!(alice.send_count(), n);
        }
    }

    #[test]
    fn first_message_is_decryptable() {
        let env = SeededEnv::new(3);
        let (mut alice, mut bob) = pair(&env);

        let message = alice.encrypt_text(&env, "hello").unwrap();
        assert_eq!(bob.decrypt_text(&message).unwrap(), "hello");
        assert_eq!(bob.recv_count(), 1);
        assert!(bob.dh_ratchet_needed());
    }

    #[test]
    fn ping_pong_ratchets_each_turn() {
        let env = SeededEnv::new(4);
        let (mut alice, mut bob) = pair(&env);

        let mut alice_keys = HashSet::new();
        let mut bob_keys = HashSet::new();
        for round in 0..5 {
            let text = format!("alice {round}");
            let message = alice.encrypt_text(&env, &text).unwrap();
            assert!(alice_keys.insert(message.header.ratchet_key));
            assert_eq!(bob.decrypt_text(&message).unwrap(), text);

            let text = format!("bob {round}");
            let message = bob.encrypt_text(&env, &text).unwrap();
            assert!(bob_keys.insert(message.header.ratchet_key));
            assert_eq!(alice.decrypt_text(&message).unwrap(), text);
        }
    }

    #[test]
    fn counters_are_per_chain_and_reset_on_dh_step() {
        let env = SeededEnv::new(14);
        let (mut alice, mut bob) = pair(&env);

        let burst: Vec<_> = (0..3).map(|_| alice.encrypt(&env, b"a").unwrap()).collect();
        assert_eq!(alice.send_count(), 3);
        for message in &burst {
            bob.decrypt(message).unwrap();
        }
        assert_eq!(bob.recv_count(), 3);

        // Bob's reply starts a new sending chain
        let reply = bob.encrypt(&env, b"b").unwrap();
        assert_eq!(reply.header.msg_num, 1);
        assert_eq!(reply.header.previous_chain_len, 0);
        bob.encrypt(&env, b"b").unwrap();
        assert_eq!(bob.send_count(), 2);
        assert_eq!(bob.recv_count(), 3);

        alice.decrypt(&reply).unwrap();
        assert_eq!(alice.recv_count(), 1);

        // Alice's previous chain length travels as PN
        let next = alice.encrypt(&env, b"a").unwrap();
        assert_eq!(next.header.msg_num, 1);
        assert_eq!(next.header.previous_chain_len, 3);
        assert_eq!(alice.send_count(), 1);

        bob.decrypt(&next).unwrap();
        assert_eq!(bob.recv_count(), 1);
    }

    #[test]
    fn late_messages_from_previous_chain_decrypt() {
        let env = SeededEnv::new(5);
        let (mut alice, mut bob) = pair(&env);

        let a1 = alice.encrypt(&env, b"a1").unwrap();
        let a2 = alice.encrypt(&env, b"a2").unwrap();
        let a3 = alice.encrypt(&env, b"a3").unwrap();
        bob.decrypt(&a1).unwrap();

        let b1 = bob.encrypt(&env, b"b1").unwrap();
        alice.decrypt(&b1).unwrap();

        // New chain announces that the previous one had three messages
        let a4 = alice.encrypt(&env, b"a4").unwrap();
        assert_eq!(a4.header.previous_chain_len, 3);
        assert_eq!(a4.header.msg_num, 1);

        assert_eq!(bob.decrypt(&a4).unwrap(), b"a4");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&a3).unwrap(), b"a3");
        assert_eq!(bob.decrypt(&a2).unwrap(), b"a2");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn replay_is_rejected_without_state_change() {
        let env = SeededEnv::new(6);
        let (mut alice, mut bob) = pair(&env);

        let a1 = alice.encrypt(&env, b"a1").unwrap();
        let a2 = alice.encrypt(&env, b"a2").unwrap();
        bob.decrypt(&a1).unwrap();
        bob.decrypt(&a2).unwrap();

        let result = bob.decrypt(&a1);
        assert_eq!(result, Err(CryptoError::DuplicateMessage { msg_num: 1 }));
        assert_eq!(bob.recv_count(), 2);
    }

    #[test]
    fn skipped_key_is_single_use() {
        let env = SeededEnv::new(7);
        let (mut alice, mut bob) = pair(&env);

        let a1 = alice.encrypt(&env, b"a1").unwrap();
        let a2 = alice.encrypt(&env, b"a2").unwrap();
        bob.decrypt(&a2).unwrap();
        assert_eq!(bob.skipped_key_count(), 1);

        assert_eq!(bob.decrypt(&a1).unwrap(), b"a1");
        assert!(bob.decrypt(&a1).is_err());
    }

    #[test]
    fn tampered_ciphertext_leaves_state_untouched() {
        let env = SeededEnv::new(8);
        let (mut alice, mut bob) = pair(&env);

        let message = alice.encrypt(&env, b"secret").unwrap();
        let mut tampered = message.clone();
        tampered.payload.ciphertext[0] ^= 0x01;

        assert_eq!(bob.decrypt(&tampered), Err(CryptoError::Authentication));
        assert_eq!(bob.recv_count(), 0);
        assert_eq!(bob.remote_ratchet_key(), None);

        assert_eq!(bob.decrypt(&message).unwrap(), b"secret");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let env = SeededEnv::new(9);
        let (mut alice, mut bob) = pair(&env);

        let a1 = alice.encrypt(&env, b"a1").unwrap();
        bob.decrypt(&a1).unwrap();
        let mut a2 = alice.encrypt(&env, b"a2").unwrap();
        a2.header.previous_chain_len += 1;

        assert_eq!(bob.decrypt(&a2), Err(CryptoError::Authentication));
    }

    #[test]
    fn skip_limit_is_enforced_before_derivation() {
        let env = SeededEnv::new(10);
        let (mut alice, mut bob) = pair(&env);

        let mut message = alice.encrypt(&env, b"far").unwrap();
        message.header.msg_num = MAX_SKIP + 2;

        assert!(matches!(bob.decrypt(&message), Err(CryptoError::SkipLimitExceeded { .. })));
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn skip_exactly_at_limit_is_accepted() {
        let env = SeededEnv::new(11);
        let (mut alice, mut bob) = pair(&env);

        let mut last = None;
        for _ in 0..=MAX_SKIP {
            last = Some(alice.encrypt(&env, b"m").unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.header.msg_num, MAX_SKIP + 1);

        bob.decrypt(&last).unwrap();
        assert_eq!(bob.skipped_key_count(), MAX_SKIP as usize);
    }

    #[test]
    fn skipped_cache_evicts_oldest_first() {
        let env = SeededEnv::new(12);
        let mut cache = SkippedKeys::default();
        let key = AgreementKeyPair::generate(&env).public_key();

        let mut chain_key = ChainKey::from_bytes([1u8; 32]);
        for n in 1..=(MAX_SKIPPED_KEYS as u32 + 5) {
            let (next, message_key) = kdf_chain(&chain_key);
            cache.insert((key, n), message_key);
            chain_key = next;
        }

        assert_eq!(cache.len(), MAX_SKIPPED_KEYS);
        assert!(cache.get(&(key, 1)).is_none());
        assert!(cache.get(&(key, 5)).is_none());
        assert!(cache.get(&(key, 6)).is_some());
    }

    #[test]
    fn state_survives_serialization() {
        let env = SeededEnv::new(13);
        let (mut alice, mut bob) = pair(&env);

        let a1 = alice.encrypt(&env, b"a1").unwrap();
        let a2 = alice.encrypt(&env, b"a2").unwrap();
        bob.decrypt(&a2).unwrap();

        let mut bytes = Vec::new();
        ciborium::into_writer(&bob, &mut bytes).unwrap();
        let mut restored: RatchetState = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(restored.skipped_key_count(), 1);
        assert_eq!(restored.decrypt(&a1).unwrap(), b"a1");

        let a3 = alice.encrypt(&env, b"a3").unwrap();
        assert_eq!(restored.decrypt(&a3).unwrap(), b"a3");
    }

    #[test]
    fn plain_state_has_no_remote_key() {
        let env = SeededEnv::new(14);
        let secret = SharedSecret::from_bytes([9u8; 32]);
        let mut state = init_ratchet_state(&env, &secret);

        assert!(!state.dh_ratchet_needed());
        let message = state.encrypt(&env, b"x").unwrap();
        assert_eq!(message.header.ratchet_key, state.ratchet_public_key());
        assert_eq!(state.send_count(), 1);
    }

    #[test]
    fn wire_roundtrip() {
        let env = SeededEnv::new(15);
        let (mut alice, mut bob) = pair(&env);

        let message = alice.encrypt(&env, b"wire").unwrap();
        let (header, payload) = message.to_wire();
        let parsed = RatchetMessage::from_wire(&header, &payload).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(bob.decrypt(&parsed).unwrap(), b"wire");
    }
}
