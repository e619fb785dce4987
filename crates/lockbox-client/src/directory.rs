//! Key directory service
//!
//! The directory stores each user's published bundle and a pool of one-time
//! prekey public halves. Fetching a bundle removes the returned one-time
//! prekey from the pool atomically, so no two initiators receive the same
//! one.
//!
//! [`MemoryKeyDirectory`] is an in-process implementation for tests and the
//! demo binary; it can simulate an unreachable or slow service.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use lockbox_crypto::{
    AgreementPublicKey, IdentityPublicKey, KeyBundle, OneTimePreKeyId, PreKeySignature,
    PublicOneTimePreKey,
};
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

/// Bundle registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRegistration {
    /// Identity public key (Ed25519)
    pub identity_key: IdentityPublicKey,
    /// Signed prekey public key (X25519)
    pub signed_prekey: AgreementPublicKey,
    /// Identity signature over `signed_prekey`
    pub signed_prekey_signature: PreKeySignature,
    /// One-time prekeys to add to the pool
    pub one_time_prekeys: Vec<PublicOneTimePreKey>,
}

/// Remote key directory.
///
/// Implementations must be cheap to clone and safe to share across tasks.
pub trait KeyDirectory: Clone + Send + Sync + 'static {
    /// Fetch a user's bundle, removing at most one one-time prekey from the
    /// pool.
    ///
    /// # Errors
    ///
    /// - `NotFound`: If the user has never registered
    /// - `Network`: If the directory is unreachable
    fn fetch_bundle(
        &self,
        user: &str,
    ) -> impl Future<Output = Result<KeyBundle, DirectoryError>> + Send;

    /// Register or replace a user's bundle and add one-time prekeys.
    ///
    /// Re-registering keeps the existing pool.
    fn publish_bundle(
        &self,
        user: &str,
        registration: BundleRegistration,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Number of one-time prekeys available for a user.
    fn opk_count(&self, user: &str) -> impl Future<Output = Result<usize, DirectoryError>> + Send;

    /// Add one-time prekeys to a user's pool.
    ///
    /// Prekeys whose identifier was uploaded before are ignored, so
    /// redundant uploads are harmless.
    fn refill_opks(
        &self,
        user: &str,
        one_time_prekeys: Vec<PublicOneTimePreKey>,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}

/// In-memory key directory.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying state.
#[derive(Clone, Default)]
pub struct MemoryKeyDirectory {
    inner: Arc<Mutex<HashMap<String, UserEntry>>>,
    offline: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

struct UserEntry {
    identity_key: IdentityPublicKey,
    signed_prekey: AgreementPublicKey,
    signed_prekey_signature: PreKeySignature,
    /// Available one-time prekeys, oldest first
    pool: VecDeque<PublicOneTimePreKey>,
    /// Every identifier ever uploaded (available or consumed)
    seen_ids: HashSet<OneTimePreKeyId>,
}

impl UserEntry {
    fn add_one_time_prekeys(&mut self, one_time_prekeys: Vec<PublicOneTimePreKey>) {
        for opk in one_time_prekeys {
            if self.seen_ids.insert(opk.id) {
                self.pool.push_back(opk);
            }
        }
    }
}

impl MemoryKeyDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail with `Network` until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// One-time prekeys currently in a user's pool (0 if unregistered).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn available(&self, user: &str) -> usize {
        self.inner.lock().expect("Mutex poisoned").get(user).map_or(0, |entry| entry.pool.len())
    }

    /// Simulated network round trip.
    async fn round_trip(&self) -> Result<(), DirectoryError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(DirectoryError::Network { reason: "directory offline".to_string() });
        }
        Ok(())
    }
}

impl KeyDirectory for MemoryKeyDirectory {
    fn fetch_bundle(
        &self,
        user: &str,
    ) -> impl Future<Output = Result<KeyBundle, DirectoryError>> + Send {
        async move {
            self.round_trip().await?;

            let mut inner = self.inner.lock().expect("Mutex poisoned");
            let entry = inner
                .get_mut(user)
                .ok_or_else(|| DirectoryError::NotFound { user: user.to_string() })?;

            Ok(KeyBundle {
                identity_key: entry.identity_key,
                signed_prekey: entry.signed_prekey,
                signed_prekey_signature: entry.signed_prekey_signature,
                one_time_prekey: entry.pool.pop_front(),
            })
        }
    }

    fn publish_bundle(
        &self,
        user: &str,
        registration: BundleRegistration,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send {
        async move {
            self.round_trip().await?;

            let mut inner = self.inner.lock().expect("Mutex poisoned");
            let entry = inner.entry(user.to_string()).or_insert_with(|| UserEntry {
                identity_key: registration.identity_key,
                signed_prekey: registration.signed_prekey,
                signed_prekey_signature: registration.signed_prekey_signature,
                pool: VecDeque::new(),
                seen_ids: HashSet::new(),
            });

            entry.identity_key = registration.identity_key;
            entry.signed_prekey = registration.signed_prekey;
            entry.signed_prekey_signature = registration.signed_prekey_signature;
            entry.add_one_time_prekeys(registration.one_time_prekeys);
            Ok(())
        }
    }

    fn opk_count(&self, user: &str) -> impl Future<Output = Result<usize, DirectoryError>> + Send {
        async move {
            self.round_trip().await?;
            Ok(self.available(user))
        }
    }

    fn refill_opks(
        &self,
        user: &str,
        one_time_prekeys: Vec<PublicOneTimePreKey>,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send {
        async move {
            self.round_trip().await?;

            let mut inner = self.inner.lock().expect("Mutex poisoned");
            let entry = inner
                .get_mut(user)
                .ok_or_else(|| DirectoryError::NotFound { user: user.to_string() })?;
            entry.add_one_time_prekeys(one_time_prekeys);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use lockbox_crypto::{Environment, IdentityKeyPair, OneTimePreKey, SignedPreKey};
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[derive(Clone)]
    struct TestEnv(Arc<Mutex<ChaCha20Rng>>);

    impl Environment for TestEnv {
        fn random_bytes(&self, buffer: &mut [u8]) {
            self.0.lock().unwrap().fill_bytes(buffer);
        }
    }

    fn registration(opks: usize) -> (BundleRegistration, Vec<OneTimePreKey>) {
        let env = TestEnv(Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(1))));
        let identity = IdentityKeyPair::generate(&env);
        let spk = SignedPreKey::generate(&env, &identity);
        let batch = OneTimePreKey::generate_batch(&env, opks);

        let registration = BundleRegistration {
            identity_key: identity.public_key(),
            signed_prekey: spk.public_key(),
            signed_prekey_signature: spk.signature(),
            one_time_prekeys: batch.iter().map(OneTimePreKey::public).collect(),
        };
        (registration, batch)
    }

    #[tokio::test]
    async fn fetch_consumes_one_prekey_per_call() {
        let directory = MemoryKeyDirectory::new();
        let (registration, batch) = registration(2);
        directory.publish_bundle("bob", registration).await.unwrap();

        let first = directory.fetch_bundle("bob").await.unwrap();
        let second = directory.fetch_bundle("bob").await.unwrap();
        let third = directory.fetch_bundle("bob").await.unwrap();

        assert_eq!(first.one_time_prekey.map(|k| k.id), Some(batch[0].id()));
        assert_eq!(second.one_time_prekey.map(|k| k.id), Some(batch[1].id()));
        assert_eq!(third.one_time_prekey, None);
        assert!(third.verify().is_ok());
    }

    #[tokio::test]
    async fn refill_ignores_known_ids() {
        let directory = MemoryKeyDirectory::new();
        let (registration, _) = registration(3);
        let opks = registration.one_time_prekeys.clone();
        directory.publish_bundle("bob", registration).await.unwrap();

        directory.fetch_bundle("bob").await.unwrap();
        directory.refill_opks("bob", opks).await.unwrap();

        // Consumed id is not resurrected, available ids are not duplicated
        assert_eq!(directory.opk_count("bob").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let directory = MemoryKeyDirectory::new();
        let result = directory.fetch_bundle("nobody").await;
        assert!(matches!(result, Err(DirectoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn offline_directory_fails_with_network_error() {
        let directory = MemoryKeyDirectory::new();
        let (registration, _) = registration(1);
        directory.publish_bundle("bob", registration).await.unwrap();

        directory.set_offline(true);
        assert!(matches!(directory.opk_count("bob").await, Err(DirectoryError::Network { .. })));

        directory.set_offline(false);
        assert_eq!(directory.opk_count("bob").await.unwrap(), 1);
    }
}
