//! Local key bundle lifecycle
//!
//! Owns the identity key, the signed prekey (plus the one it replaced), and
//! the pool of one-time prekey private halves. Everything is persisted in
//! [`SecureStorage`] before it is published, so a crash never leaves the
//! directory advertising a key this client cannot use.
//!
//! # Replenishment
//!
//! [`KeyBundleManager::ensure_pool_size`] is best-effort: directory failures
//! are logged and reported as [`ReplenishOutcome::DirectoryUnavailable`],
//! because a low pool only degrades new-session setup. Concurrent calls are
//! serialized so two near-simultaneous starts do not both refill.

use lockbox_crypto::{
    AgreementKeyPair, AgreementPublicKey, Environment, IdentityKeyPair, KeyBundle, OneTimePreKey,
    OneTimePreKeyId, SignedPreKey,
};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::{
    directory::{BundleRegistration, KeyDirectory},
    error::ClientError,
    storage::{SecureStorage, StorageError},
};

const IDENTITY_KEY: &str = "identity";
const SIGNED_PREKEY_KEY: &str = "signed_prekey";
const PREVIOUS_SIGNED_PREKEY_KEY: &str = "previous_signed_prekey";
const ONE_TIME_PREKEYS_KEY: &str = "one_time_prekeys";

/// Result of a pool replenishment check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// The directory already held at least the minimum
    Sufficient {
        /// One-time prekeys available in the directory
        available: usize,
    },
    /// New one-time prekeys were generated, persisted, and uploaded
    Replenished {
        /// Number of prekeys uploaded
        uploaded: usize,
    },
    /// The directory could not be reached; nothing was uploaded
    DirectoryUnavailable,
}

/// Prekeys that change over the client's lifetime.
struct PreKeys {
    signed: SignedPreKey,
    /// Signed prekey replaced by the last rotation, kept so handshakes
    /// started against it can still complete
    previous_signed: Option<SignedPreKey>,
    one_time: Vec<OneTimePreKey>,
}

/// Local key material and its publication to a key directory.
pub struct KeyBundleManager<E: Environment, S: SecureStorage> {
    env: E,
    storage: S,
    user_id: String,
    identity: IdentityKeyPair,
    prekeys: Mutex<PreKeys>,
    replenish: Mutex<()>,
}

impl<E: Environment, S: SecureStorage> KeyBundleManager<E, S> {
    /// Load persisted key material, generating and persisting whatever is
    /// missing.
    ///
    /// The identity key is generated once per storage and never rotated.
    ///
    /// # Errors
    ///
    /// - `Storage`: If storage cannot be read or written
    /// - `Crypto`: If the stored identity seed has the wrong length
    pub fn load_or_create(env: E, storage: S, user_id: impl Into<String>) -> Result<Self, ClientError> {
        let user_id = user_id.into();

        let identity = match storage.get(IDENTITY_KEY)? {
            Some(seed) => {
                let seed = Zeroizing::new(seed);
                let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| {
                    StorageError::Serialization(format!(
                        "identity seed must be 32 bytes, got {}",
                        seed.len()
                    ))
                })?;
                IdentityKeyPair::from_seed(&Zeroizing::new(seed))
            },
            None => {
                let identity = IdentityKeyPair::generate(&env);
                storage.set(IDENTITY_KEY, identity.to_seed().as_slice())?;
                tracing::info!(user = %user_id, "Generated identity key");
                identity
            },
        };

        let signed = match storage.load::<SignedPreKey>(SIGNED_PREKEY_KEY)? {
            Some(signed) => signed,
            None => {
                let signed = SignedPreKey::generate(&env, &identity);
                storage.store(SIGNED_PREKEY_KEY, &signed)?;
                tracing::info!(user = %user_id, "Generated signed prekey");
                signed
            },
        };

        let previous_signed = storage.load::<SignedPreKey>(PREVIOUS_SIGNED_PREKEY_KEY)?;
        let one_time = storage.load::<Vec<OneTimePreKey>>(ONE_TIME_PREKEYS_KEY)?.unwrap_or_default();

        tracing::debug!(
            user = %user_id,
            one_time_prekeys = one_time.len(),
            has_previous_signed_prekey = previous_signed.is_some(),
            "Loaded key material"
        );

        Ok(Self {
            env,
            storage,
            user_id,
            identity,
            prekeys: Mutex::new(PreKeys { signed, previous_signed, one_time }),
            replenish: Mutex::new(()),
        })
    }

    /// Local user identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Identity key pair.
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Current bundle without a one-time prekey.
    pub async fn bundle(&self) -> KeyBundle {
        let prekeys = self.prekeys.lock().await;
        KeyBundle::new(&self.identity, &prekeys.signed, None)
    }

    /// Number of local one-time prekeys not yet consumed.
    pub async fn unused_one_time_prekeys(&self) -> usize {
        self.prekeys.lock().await.one_time.iter().filter(|opk| !opk.is_used()).count()
    }

    /// Register the bundle with the directory.
    ///
    /// Tops the local pool up to `initial_opks` unused prekeys first, then
    /// uploads every unused prekey. Safe to repeat: the directory ignores
    /// identifiers it has already seen.
    ///
    /// # Errors
    ///
    /// - `Directory`: If the directory rejects or cannot receive the bundle
    /// - `Storage`: If new prekeys cannot be persisted
    pub async fn publish<D: KeyDirectory>(
        &self,
        directory: &D,
        initial_opks: usize,
    ) -> Result<(), ClientError> {
        let registration = {
            let mut prekeys = self.prekeys.lock().await;

            let unused = prekeys.one_time.iter().filter(|opk| !opk.is_used()).count();
            if unused < initial_opks {
                let batch = OneTimePreKey::generate_batch(&self.env, initial_opks - unused);
                prekeys.one_time.extend(batch);
                self.storage.store(ONE_TIME_PREKEYS_KEY, &prekeys.one_time)?;
            }

            BundleRegistration {
                identity_key: self.identity.public_key(),
                signed_prekey: prekeys.signed.public_key(),
                signed_prekey_signature: prekeys.signed.signature(),
                one_time_prekeys: prekeys
                    .one_time
                    .iter()
                    .filter(|opk| !opk.is_used())
                    .map(OneTimePreKey::public)
                    .collect(),
            }
        };

        let uploaded = registration.one_time_prekeys.len();
        directory.publish_bundle(&self.user_id, registration).await?;

        tracing::info!(user = %self.user_id, one_time_prekeys = uploaded, "Published key bundle");
        Ok(())
    }

    /// Refill the directory's one-time prekey pool if it has fallen below
    /// `min_count`.
    ///
    /// Generates `target_count - available` prekeys, persists the private
    /// halves, then uploads the public halves. Directory failures are logged
    /// and swallowed.
    ///
    /// # Errors
    ///
    /// - `Storage`: If new prekeys cannot be persisted (nothing is uploaded)
    pub async fn ensure_pool_size<D: KeyDirectory>(
        &self,
        directory: &D,
        min_count: usize,
        target_count: usize,
    ) -> Result<ReplenishOutcome, ClientError> {
        let _serialized = self.replenish.lock().await;

        let available = match directory.opk_count(&self.user_id).await {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(user = %self.user_id, error = %e, "Skipping prekey replenishment");
                return Ok(ReplenishOutcome::DirectoryUnavailable);
            },
        };

        if available >= min_count {
            return Ok(ReplenishOutcome::Sufficient { available });
        }

        let needed = target_count.saturating_sub(available);
        if needed == 0 {
            return Ok(ReplenishOutcome::Sufficient { available });
        }

        let batch = OneTimePreKey::generate_batch(&self.env, needed);
        let publics = batch.iter().map(OneTimePreKey::public).collect();
        {
            let mut prekeys = self.prekeys.lock().await;
            prekeys.one_time.extend(batch);
            self.storage.store(ONE_TIME_PREKEYS_KEY, &prekeys.one_time)?;
        }

        if let Err(e) = directory.refill_opks(&self.user_id, publics).await {
            tracing::warn!(user = %self.user_id, error = %e, "Prekey upload failed");
            return Ok(ReplenishOutcome::DirectoryUnavailable);
        }

        tracing::info!(user = %self.user_id, available, uploaded = needed, "Replenished one-time prekeys");
        Ok(ReplenishOutcome::Replenished { uploaded: needed })
    }

    /// Private half of an unused one-time prekey, without consuming it.
    ///
    /// # Errors
    ///
    /// - `UnknownOneTimePreKey`: If the prekey is unknown or already used
    pub async fn one_time_prekey(&self, id: OneTimePreKeyId) -> Result<AgreementKeyPair, ClientError> {
        let prekeys = self.prekeys.lock().await;
        prekeys
            .one_time
            .iter()
            .find(|opk| opk.id() == id && !opk.is_used())
            .map(|opk| opk.key_pair().clone())
            .ok_or(ClientError::UnknownOneTimePreKey { id })
    }

    /// Mark a one-time prekey consumed and persist the flag.
    ///
    /// A consumed prekey is never returned for DH again.
    ///
    /// # Errors
    ///
    /// - `UnknownOneTimePreKey`: If the prekey is unknown or already used
    /// - `Storage`: If the flag cannot be persisted
    pub async fn mark_used(&self, id: OneTimePreKeyId) -> Result<(), ClientError> {
        let mut prekeys = self.prekeys.lock().await;

        let opk = prekeys
            .one_time
            .iter_mut()
            .find(|opk| opk.id() == id && !opk.is_used())
            .ok_or(ClientError::UnknownOneTimePreKey { id })?;
        opk.mark_used();

        self.storage.store(ONE_TIME_PREKEYS_KEY, &prekeys.one_time)?;
        tracing::debug!(user = %self.user_id, opk = %id, "Consumed one-time prekey");
        Ok(())
    }

    /// Private half of a one-time prekey, consumed atomically.
    ///
    /// # Errors
    ///
    /// As [`KeyBundleManager::mark_used`].
    pub async fn take_one_time_prekey(
        &self,
        id: OneTimePreKeyId,
    ) -> Result<AgreementKeyPair, ClientError> {
        let mut prekeys = self.prekeys.lock().await;

        let opk = prekeys
            .one_time
            .iter_mut()
            .find(|opk| opk.id() == id && !opk.is_used())
            .ok_or(ClientError::UnknownOneTimePreKey { id })?;
        opk.mark_used();
        let key_pair = opk.key_pair().clone();

        self.storage.store(ONE_TIME_PREKEYS_KEY, &prekeys.one_time)?;
        Ok(key_pair)
    }

    /// Signed prekey pair whose public half is `public_key`.
    ///
    /// Looks at the current signed prekey and the one it replaced.
    ///
    /// # Errors
    ///
    /// - `UnknownSignedPreKey`: If neither matches
    pub async fn signed_prekey_for(
        &self,
        public_key: &AgreementPublicKey,
    ) -> Result<AgreementKeyPair, ClientError> {
        let prekeys = self.prekeys.lock().await;

        std::iter::once(&prekeys.signed)
            .chain(prekeys.previous_signed.as_ref())
            .find(|spk| spk.public_key() == *public_key)
            .map(|spk| spk.key_pair().clone())
            .ok_or(ClientError::UnknownSignedPreKey)
    }

    /// Replace the signed prekey, keeping the old one for in-flight
    /// handshakes. Call [`KeyBundleManager::publish`] afterwards.
    ///
    /// Returns the new public key.
    ///
    /// # Errors
    ///
    /// - `Storage`: If the new prekey cannot be persisted
    pub async fn rotate_signed_prekey(&self) -> Result<AgreementPublicKey, ClientError> {
        let mut prekeys = self.prekeys.lock().await;

        let fresh = SignedPreKey::generate(&self.env, &self.identity);
        self.storage.store(PREVIOUS_SIGNED_PREKEY_KEY, &prekeys.signed)?;
        self.storage.store(SIGNED_PREKEY_KEY, &fresh)?;

        let public_key = fresh.public_key();
        prekeys.previous_signed = Some(std::mem::replace(&mut prekeys.signed, fresh));

        tracing::info!(user = %self.user_id, "Rotated signed prekey");
        Ok(public_key)
    }
}
