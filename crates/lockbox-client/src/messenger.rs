//! Messenger: session setup and message flow
//!
//! Ties the pieces together. Outgoing messages to a peer without a session
//! fetch the peer's bundle, run the X3DH initiator, and bootstrap a ratchet.
//! Incoming messages carrying handshake data run the X3DH responder and
//! consume the named one-time prekey.
//!
//! # Handshake acceptance
//!
//! - A handshake matching the current responder session is ignored and the
//!   message is decrypted with the existing ratchet
//! - A handshake that lost a tie-break is decrypted with the ratchet kept for
//!   it, without touching the current session
//! - A handshake accepted before (and not current) is a replay and rejected
//! - Any other handshake establishes a new session, replacing the current one
//!   once its message decrypts
//!
//! # Simultaneous initiation
//!
//! When both peers send a first message before either has replied, each
//! holds an unconfirmed initiator session when the other's handshake
//! arrives. The handshake with the lower ephemeral key wins on both sides:
//! its initiator keeps its session and keeps attaching the handshake, the
//! other side replaces its session with a responder session. The winner
//! still decrypts messages sent under the losing handshake through a
//! separate ratchet that never carries replies.
//!
//! Nothing is committed (session, prekey consumption, handshake record) unless
//! the message authenticates.

use std::future::Future;

use lockbox_crypto::{
    CryptoError, Environment, IdentityPublicKey, KeyBundle, RatchetMessage, RatchetState,
    derive_shared_secret_initiator, derive_shared_secret_responder,
};

use crate::{
    bundle_manager::{KeyBundleManager, ReplenishOutcome},
    config::ClientConfig,
    directory::KeyDirectory,
    envelope::{DecodedHandshake, Envelope, HandshakeInit},
    error::ClientError,
    session::{Session, SessionGuard, SessionStatus, SessionStore},
    storage::SecureStorage,
};

/// End-to-end encrypted messaging client for one local user.
///
/// Cheap operations on different peers run concurrently; operations on the
/// same peer are serialized by the session store.
pub struct Messenger<E: Environment, S: SecureStorage, D: KeyDirectory> {
    env: E,
    directory: D,
    keys: KeyBundleManager<E, S>,
    sessions: SessionStore<S>,
    config: ClientConfig,
}

impl<E: Environment, S: SecureStorage, D: KeyDirectory> Messenger<E, S, D> {
    /// Create a messenger, loading or generating local key material.
    ///
    /// Does not contact the directory; call [`Messenger::start`] for that.
    ///
    /// # Errors
    ///
    /// - `Storage`: If persisted key material cannot be read or written
    pub fn new(
        env: E,
        storage: S,
        directory: D,
        user_id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let keys = KeyBundleManager::load_or_create(env.clone(), storage.clone(), user_id)?;
        Ok(Self { env, directory, keys, sessions: SessionStore::new(storage), config })
    }

    /// Publish the key bundle and top up the one-time prekey pool.
    ///
    /// # Errors
    ///
    /// - `Directory`: If registration fails
    /// - `Timeout`: If registration exceeds the configured deadline
    /// - `Storage`: If generated prekeys cannot be persisted
    pub async fn start(&self) -> Result<(), ClientError> {
        self.with_deadline(self.keys.publish(&self.directory, self.config.initial_opks)).await?;

        self.replenish().await?;
        Ok(())
    }

    /// Local user identifier.
    pub fn user_id(&self) -> &str {
        self.keys.user_id()
    }

    /// Local identity public key.
    pub fn identity_key(&self) -> IdentityPublicKey {
        self.keys.identity().public_key()
    }

    /// Local key material.
    pub fn key_bundle_manager(&self) -> &KeyBundleManager<E, S> {
        &self.keys
    }

    /// Refill the directory's one-time prekey pool if it is low.
    ///
    /// Directory failures and timeouts are logged and reported as
    /// [`ReplenishOutcome::DirectoryUnavailable`].
    ///
    /// # Errors
    ///
    /// - `Storage`: If generated prekeys cannot be persisted
    pub async fn replenish(&self) -> Result<ReplenishOutcome, ClientError> {
        let check = self.keys.ensure_pool_size(
            &self.directory,
            self.config.opk_min,
            self.config.opk_target,
        );

        match tokio::time::timeout(self.config.fetch_timeout, check).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    user = %self.user_id(),
                    after = ?self.config.fetch_timeout,
                    "Prekey replenishment timed out"
                );
                Ok(ReplenishOutcome::DirectoryUnavailable)
            },
        }
    }

    /// Encrypt a UTF-8 message for `peer`.
    ///
    /// # Errors
    ///
    /// As [`Messenger::encrypt_bytes`].
    pub async fn encrypt_text(&self, peer: &str, plaintext: &str) -> Result<Envelope, ClientError> {
        self.encrypt_bytes(peer, plaintext.as_bytes()).await
    }

    /// Encrypt a message for `peer`, establishing a session first if needed.
    ///
    /// # Errors
    ///
    /// - `Directory`: If the peer's bundle cannot be fetched
    /// - `Timeout`: If the bundle fetch exceeds the configured deadline
    /// - `Crypto`: If the bundle does not verify or encryption fails
    /// - `Storage`: If the session cannot be persisted
    pub async fn encrypt_bytes(&self, peer: &str, plaintext: &[u8]) -> Result<Envelope, ClientError> {
        let mut guard = self.sessions.lock(peer).await?;

        let mut session = match guard.session() {
            Some(session) => session.clone(),
            None => self.initiate(peer).await?,
        };

        let message = session.ratchet_mut().encrypt(&self.env, plaintext)?;
        let envelope = Envelope::new(self.user_id(), &message, session.pending_handshake().cloned());
        guard.commit(session)?;

        tracing::debug!(
            peer,
            msg_num = message.header.msg_num,
            handshake = envelope.handshake.is_some(),
            "Encrypted message"
        );
        Ok(envelope)
    }

    /// Decrypt a message.
    ///
    /// # Errors
    ///
    /// - `Envelope`: If the envelope version or algorithm is unsupported
    /// - `MissingHandshake`: If there is no session and no handshake
    /// - `ReplayedHandshake`: If the handshake was accepted before
    /// - `UnknownOneTimePreKey` / `UnknownSignedPreKey`: If the handshake
    ///   names prekeys this client does not hold
    /// - `Crypto`: If authentication or ratchet checks fail
    /// - `Storage`: If the session cannot be persisted
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, ClientError> {
        self.open(envelope, Ok).await
    }

    /// Decrypt a message that must contain UTF-8 text.
    ///
    /// Invalid UTF-8 fails with `Crypto(Encoding)` and leaves the session
    /// unchanged.
    ///
    /// # Errors
    ///
    /// As [`Messenger::decrypt`].
    pub async fn decrypt_text(&self, envelope: &Envelope) -> Result<String, ClientError> {
        self.open(envelope, |bytes| {
            String::from_utf8(bytes)
                .map_err(|e| ClientError::from(CryptoError::Encoding { reason: e.to_string() }))
        })
        .await
    }

    /// Whether a session with `peer` exists.
    ///
    /// # Errors
    ///
    /// - `Storage`: If the persisted session cannot be read
    pub async fn has_session(&self, peer: &str) -> Result<bool, ClientError> {
        self.sessions.contains(peer).await
    }

    /// Counter snapshot of the session with `peer`.
    ///
    /// # Errors
    ///
    /// - `NoSession`: If no session exists
    /// - `Storage`: If the persisted session cannot be read
    pub async fn session_status(&self, peer: &str) -> Result<SessionStatus, ClientError> {
        let guard = self.sessions.lock(peer).await?;
        guard
            .session()
            .map(Session::status)
            .ok_or_else(|| ClientError::NoSession { peer: peer.to_string() })
    }

    /// Initiator side: fetch, verify, agree, bootstrap.
    async fn initiate(&self, peer: &str) -> Result<Session, ClientError> {
        let bundle: KeyBundle = self.with_deadline(self.directory.fetch_bundle(peer)).await?;

        if bundle.one_time_prekey.is_none() {
            tracing::warn!(peer, "Bundle has no one-time prekey, first messages lack DH4");
        }

        let output = derive_shared_secret_initiator(&self.env, self.keys.identity(), &bundle)?;
        let ratchet =
            RatchetState::new_initiator(&self.env, &output.shared_secret, bundle.signed_prekey);
        let handshake = HandshakeInit::new(
            &self.identity_key(),
            &output.ephemeral_public,
            &bundle.signed_prekey,
            output.one_time_prekey_id,
        );

        tracing::info!(
            peer,
            one_time_prekey = output.one_time_prekey_id.is_some(),
            "Initiated session"
        );
        Ok(Session::initiator(ratchet, bundle.identity_key, handshake))
    }

    async fn open<T>(
        &self,
        envelope: &Envelope,
        accept: impl FnOnce(Vec<u8>) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let message = envelope.ratchet_message()?;
        let handshake = envelope.handshake.as_ref().map(HandshakeInit::decode).transpose()?;
        let peer = envelope.sender.as_str();

        let mut guard = self.sessions.lock(peer).await?;

        let current = guard.session().and_then(Session::handshake_ephemeral).copied();
        let contended = guard.session().and_then(Session::contended_ephemeral).copied();
        let route = match handshake {
            Some(handshake) if Some(handshake.ephemeral_key) == current => Route::Current,
            Some(handshake) if Some(handshake.ephemeral_key) == contended => Route::Contended,
            Some(handshake) if guard.has_seen_handshake(&handshake.ephemeral_key) => {
                tracing::warn!(peer, "Rejected replayed handshake");
                return Err(ClientError::ReplayedHandshake { peer: peer.to_string() });
            },
            Some(handshake) => Route::Handshake(handshake),
            None => Route::Current,
        };

        let (value, consumed_prekey) = match route {
            Route::Handshake(handshake) => {
                let value = self.accept_handshake(&mut guard, &handshake, &message, accept).await?;
                (value, handshake.one_time_prekey_id.is_some())
            },
            Route::Contended => {
                let mut session = guard
                    .session()
                    .cloned()
                    .ok_or_else(|| ClientError::MissingHandshake { peer: peer.to_string() })?;
                let ratchet = session
                    .contended_ratchet_mut()
                    .ok_or_else(|| ClientError::MissingHandshake { peer: peer.to_string() })?;

                let value = accept(ratchet.decrypt(&message)?)?;
                guard.commit(session)?;
                (value, false)
            },
            Route::Current => {
                let mut session = guard
                    .session()
                    .cloned()
                    .ok_or_else(|| ClientError::MissingHandshake { peer: peer.to_string() })?;

                let value = accept(session.ratchet_mut().decrypt(&message)?)?;
                session.confirm();
                guard.commit(session)?;
                (value, false)
            },
        };

        tracing::debug!(peer, msg_num = message.header.msg_num, "Decrypted message");
        drop(guard);

        // Message is already committed
        if consumed_prekey {
            if let Err(e) = self.replenish().await {
                tracing::error!(user = %self.user_id(), error = %e, "Prekey replenishment failed");
            }
        }
        Ok(value)
    }

    /// Responder side: agree, decrypt, then consume and commit.
    async fn accept_handshake<T>(
        &self,
        guard: &mut SessionGuard<S>,
        handshake: &DecodedHandshake,
        message: &RatchetMessage,
        accept: impl FnOnce(Vec<u8>) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let signed_prekey = self.keys.signed_prekey_for(&handshake.signed_prekey).await?;
        let one_time_prekey = match handshake.one_time_prekey_id {
            Some(id) => Some(self.keys.one_time_prekey(id).await?),
            None => None,
        };

        let shared_secret = derive_shared_secret_responder(
            self.keys.identity(),
            &signed_prekey,
            &handshake.ephemeral_key,
            &handshake.identity_key,
            one_time_prekey.as_ref(),
        )?;

        let mut ratchet = RatchetState::new_responder(&shared_secret, signed_prekey);
        let value = accept(ratchet.decrypt(message)?)?;

        if let Some(id) = handshake.one_time_prekey_id {
            self.keys.mark_used(id).await?;
        }

        let session = match guard.session() {
            Some(own) if wins_tie_break(own, handshake)? => {
                tracing::info!(peer = %guard.peer(), "Kept own handshake on simultaneous initiation");
                let mut own = own.clone();
                own.contend(handshake.ephemeral_key, ratchet);
                own
            },
            previous => {
                let mut session =
                    Session::responder(ratchet, handshake.identity_key, handshake.ephemeral_key);
                if let Some(previous) = previous {
                    if *previous.peer_identity() != handshake.identity_key {
                        tracing::warn!(peer = %guard.peer(), "Peer identity key changed");
                        session.mark_identity_changed();
                    } else if previous.status().identity_changed {
                        session.mark_identity_changed();
                    }
                }

                tracing::info!(
                    peer = %guard.peer(),
                    one_time_prekey = handshake.one_time_prekey_id.is_some(),
                    "Accepted session from handshake"
                );
                session
            },
        };

        guard.commit(session)?;
        guard.record_handshake(handshake.ephemeral_key)?;
        Ok(value)
    }

    /// Bound a directory request by the configured deadline.
    async fn with_deadline<T, Err: Into<ClientError>>(
        &self,
        request: impl Future<Output = Result<T, Err>>,
    ) -> Result<T, ClientError> {
        let after = self.config.fetch_timeout;
        tokio::time::timeout(after, request)
            .await
            .map_err(|_| ClientError::Timeout { after })?
            .map_err(Into::into)
    }
}

/// How an incoming message reaches a ratchet.
enum Route {
    /// Existing session's main ratchet
    Current,
    /// Ratchet kept for a handshake that lost the tie-break
    Contended,
    /// New handshake to run the responder side for
    Handshake(DecodedHandshake),
}

/// Whether `own` keeps its handshake against the peer's.
///
/// Only an unconfirmed initiator session from the same peer identity
/// contends; the lower ephemeral key wins.
fn wins_tie_break(own: &Session, peer: &DecodedHandshake) -> Result<bool, ClientError> {
    if *own.peer_identity() != peer.identity_key {
        return Ok(false);
    }

    match own.pending_handshake() {
        Some(pending) => Ok(pending.decode()?.ephemeral_key < peer.ephemeral_key),
        None => Ok(false),
    }
}
