//! Property-based tests for the Double Ratchet
//!
//! These tests verify the session invariants:
//!
//! 1. **Round-trip**: every message decrypts to its plaintext
//! 2. **Out-of-order delivery**: any arrival order within a chain succeeds
//! 3. **Single use**: a message key never decrypts twice
//! 4. **Tamper sensitivity**: any flipped bit fails authentication and
//!    leaves the state unchanged

use std::sync::{Arc, Mutex};

use lockbox_crypto::{
    AgreementKeyPair, CryptoError, Environment, RatchetMessage, RatchetState, SharedSecret, aead,
};
use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

// Seeded environment so every case is reproducible
#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl TestEnv {
    fn seeded(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Environment for TestEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }
}

fn session(env: &TestEnv, secret: [u8; 32]) -> (RatchetState, RatchetState) {
    let secret = SharedSecret::from_bytes(secret);
    let bob_spk = AgreementKeyPair::generate(env);
    let alice = RatchetState::new_initiator(env, &secret, bob_spk.public_key());
    let bob = RatchetState::new_responder(&secret, bob_spk);
    (alice, bob)
}

fn encrypt_all(env: &TestEnv, state: &mut RatchetState, plaintexts: &[Vec<u8>]) -> Vec<RatchetMessage> {
    plaintexts.iter().map(|p| state.encrypt(env, p).unwrap()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_aead_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..1000),
        key in any::<[u8; 32]>(),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let sealed = aead::encrypt(&env, &key, &plaintext, None).unwrap();
        prop_assert_eq!(aead::decrypt(&key, &sealed, None).unwrap(), plaintext);
    }

    #[test]
    fn prop_aead_tamper_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..200),
        key in any::<[u8; 32]>(),
        aad in prop::collection::vec(any::<u8>(), 1..64),
        bit in any::<usize>(),
        target in 0usize..3,
    ) {
        let env = TestEnv::seeded(1);
        let mut sealed = aead::encrypt(&env, &key, &plaintext, Some(&aad)).unwrap();
        let mut aad = aad;

        match target {
            0 => {
                let len = sealed.ciphertext.len() * 8;
                sealed.ciphertext[(bit % len) / 8] ^= 1 << (bit % 8);
            },
            1 => sealed.nonce[(bit % 96) / 8] ^= 1 << (bit % 8),
            _ => {
                let len = aad.len() * 8;
                aad[(bit % len) / 8] ^= 1 << (bit % 8);
            },
        }

        prop_assert_eq!(aead::decrypt(&key, &sealed, Some(&aad)), Err(CryptoError::Authentication));
    }

    #[test]
    fn prop_ratchet_roundtrip(
        plaintexts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..20),
        secret in any::<[u8; 32]>(),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let (mut alice, mut bob) = session(&env, secret);

        let messages = encrypt_all(&env, &mut alice, &plaintexts);
        prop_assert_eq!(alice.send_count() as usize, plaintexts.len());

        for (message, plaintext) in messages.iter().zip(&plaintexts) {
            prop_assert_eq!(&bob.decrypt(message).unwrap(), plaintext);
        }
    }

    #[test]
    fn prop_out_of_order_delivery(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let (mut alice, mut bob) = session(&env, [5u8; 32]);

        let plaintexts: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16]).collect();
        let messages = encrypt_all(&env, &mut alice, &plaintexts);

        for &i in &order {
            prop_assert_eq!(&bob.decrypt(&messages[i]).unwrap(), &plaintexts[i]);
        }
        prop_assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn prop_message_key_single_use(
        order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let (mut alice, mut bob) = session(&env, [6u8; 32]);

        let plaintexts: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 4]).collect();
        let messages = encrypt_all(&env, &mut alice, &plaintexts);

        for &i in &order {
            bob.decrypt(&messages[i]).unwrap();
        }
        for message in &messages {
            prop_assert!(bob.decrypt(message).is_err());
        }
    }

    #[test]
    fn prop_conversation_with_interleaved_turns(
        turns in prop::collection::vec(1usize..4, 1..10),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let (mut alice, mut bob) = session(&env, [8u8; 32]);

        for (turn, &count) in turns.iter().enumerate() {
            let (sender, receiver) =
                if turn % 2 == 0 { (&mut alice, &mut bob) } else { (&mut bob, &mut alice) };

            let plaintexts: Vec<Vec<u8>> = (0..count).map(|i| format!("{turn}:{i}").into_bytes()).collect();
            let messages = encrypt_all(&env, sender, &plaintexts);

            // Deliver newest first to exercise skipped keys across DH steps
            for (message, plaintext) in messages.iter().zip(&plaintexts).rev() {
                prop_assert_eq!(&receiver.decrypt(message).unwrap(), plaintext);
            }
        }
    }

    #[test]
    fn prop_tampered_message_leaves_state_unchanged(
        plaintext in prop::collection::vec(any::<u8>(), 1..128),
        byte in any::<usize>(),
        seed in any::<u64>(),
    ) {
        let env = TestEnv::seeded(seed);
        let (mut alice, mut bob) = session(&env, [9u8; 32]);

        let message = alice.encrypt(&env, &plaintext).unwrap();
        let mut tampered = message.clone();
        let index = byte % tampered.payload.ciphertext.len();
        tampered.payload.ciphertext[index] ^= 0x80;

        prop_assert_eq!(bob.decrypt(&tampered), Err(CryptoError::Authentication));
        prop_assert_eq!(bob.recv_count(), 0);
        prop_assert_eq!(bob.decrypt(&message).unwrap(), plaintext);
    }
}
