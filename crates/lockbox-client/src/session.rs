//! Per-conversation sessions and their store.
//!
//! A [`Session`] couples the Double Ratchet state with what the client needs
//! around it: the peer's identity, which side started the handshake, and the
//! handshake data still owed to the peer.
//!
//! [`SessionStore`] hands out one async lock per peer. Operations on
//! different conversations run concurrently; operations on the same
//! conversation are serialized, so ratchet steps are never interleaved.
//!
//! # Invariants
//!
//! - A committed session is persisted before it becomes visible in memory
//! - Work on a session happens on a copy; failures leave the stored session
//!   untouched

#![allow(clippy::disallowed_types, reason = "Slot map is only locked synchronously")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use lockbox_crypto::{AgreementPublicKey, IdentityPublicKey, RatchetState};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{envelope::HandshakeInit, error::ClientError, storage::SecureStorage};

/// Which side of the X3DH handshake this client played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Fetched the peer's bundle and sent the first message
    Initiator,
    /// Established the session from the peer's first message
    Responder,
}

/// Snapshot of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Handshake role
    pub role: Role,
    /// Messages sent in the current sending chain
    pub send_count: u32,
    /// Messages consumed in the current receiving chain
    pub recv_count: u32,
    /// Cached keys for messages that have not arrived
    pub skipped_keys: usize,
    /// True while outgoing messages still carry handshake data
    pub awaiting_reply: bool,
    /// True if the peer's identity key differs from the one first pinned
    pub identity_changed: bool,
}

/// Peer handshake that lost the tie-break against our own.
///
/// Its messages still decrypt through this ratchet, but replies always go
/// through the session's main ratchet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContendedHandshake {
    ephemeral: AgreementPublicKey,
    ratchet: RatchetState,
}

/// Session with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    ratchet: RatchetState,
    peer_identity: IdentityPublicKey,
    role: Role,
    /// Attached to outgoing messages until the peer replies
    pending_handshake: Option<HandshakeInit>,
    /// Initiator ephemeral key that established a responder session
    handshake_ephemeral: Option<AgreementPublicKey>,
    #[serde(default)]
    contended: Option<ContendedHandshake>,
    #[serde(default)]
    identity_changed: bool,
}

impl Session {
    /// Session created by sending the first message.
    pub fn initiator(
        ratchet: RatchetState,
        peer_identity: IdentityPublicKey,
        handshake: HandshakeInit,
    ) -> Self {
        Self {
            ratchet,
            peer_identity,
            role: Role::Initiator,
            pending_handshake: Some(handshake),
            handshake_ephemeral: None,
            contended: None,
            identity_changed: false,
        }
    }

    /// Session created from a peer's handshake.
    pub fn responder(
        ratchet: RatchetState,
        peer_identity: IdentityPublicKey,
        handshake_ephemeral: AgreementPublicKey,
    ) -> Self {
        Self {
            ratchet,
            peer_identity,
            role: Role::Responder,
            pending_handshake: None,
            handshake_ephemeral: Some(handshake_ephemeral),
            contended: None,
            identity_changed: false,
        }
    }

    /// Ratchet state.
    pub fn ratchet(&self) -> &RatchetState {
        &self.ratchet
    }

    /// Mutable ratchet state.
    pub fn ratchet_mut(&mut self) -> &mut RatchetState {
        &mut self.ratchet
    }

    /// Peer's identity key, pinned when the session was created.
    pub fn peer_identity(&self) -> &IdentityPublicKey {
        &self.peer_identity
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Handshake data to attach to the next outgoing message.
    pub fn pending_handshake(&self) -> Option<&HandshakeInit> {
        self.pending_handshake.as_ref()
    }

    /// Ephemeral key of the handshake that created this responder session.
    pub fn handshake_ephemeral(&self) -> Option<&AgreementPublicKey> {
        self.handshake_ephemeral.as_ref()
    }

    /// Stop attaching handshake data once the peer has replied.
    pub fn confirm(&mut self) {
        self.pending_handshake = None;
    }

    /// Ephemeral key of the peer handshake that lost the tie-break.
    pub fn contended_ephemeral(&self) -> Option<&AgreementPublicKey> {
        self.contended.as_ref().map(|contended| &contended.ephemeral)
    }

    /// Ratchet for messages sent under the losing peer handshake.
    pub fn contended_ratchet_mut(&mut self) -> Option<&mut RatchetState> {
        self.contended.as_mut().map(|contended| &mut contended.ratchet)
    }

    /// Keep receiving from a peer handshake while this session stays
    /// current. Replaces any earlier losing handshake.
    pub fn contend(&mut self, ephemeral: AgreementPublicKey, ratchet: RatchetState) {
        self.contended = Some(ContendedHandshake { ephemeral, ratchet });
    }

    /// Flag that this session replaced one pinned to a different identity.
    pub fn mark_identity_changed(&mut self) {
        self.identity_changed = true;
    }

    /// Counter snapshot.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            role: self.role,
            send_count: self.ratchet.send_count(),
            recv_count: self.ratchet.recv_count(),
            skipped_keys: self.ratchet.skipped_key_count(),
            awaiting_reply: self.pending_handshake.is_some(),
            identity_changed: self.identity_changed,
        }
    }
}

fn session_key(peer: &str) -> String {
    format!("session/{peer}")
}

fn handshakes_key(peer: &str) -> String {
    format!("handshakes/{peer}")
}

#[derive(Default)]
struct Slot {
    loaded: bool,
    session: Option<Session>,
    seen_handshakes: Vec<AgreementPublicKey>,
}

/// Sessions keyed by peer, loaded lazily from storage.
pub struct SessionStore<S: SecureStorage> {
    storage: S,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl<S: SecureStorage> SessionStore<S> {
    /// Create a store over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage, slots: Mutex::new(HashMap::new()) }
    }

    /// Acquire exclusive access to the conversation with `peer`.
    ///
    /// Waits while another task holds the same conversation. The persisted
    /// session is loaded on first access.
    ///
    /// # Errors
    ///
    /// - `Storage`: If the persisted session cannot be read
    pub async fn lock(&self, peer: &str) -> Result<SessionGuard<S>, ClientError> {
        let slot = {
            let mut slots = self.slots.lock().expect("Mutex poisoned");
            Arc::clone(slots.entry(peer.to_string()).or_default())
        };

        let mut slot = slot.lock_owned().await;
        if !slot.loaded {
            slot.session = self.storage.load(&session_key(peer))?;
            slot.seen_handshakes = self.storage.load(&handshakes_key(peer))?.unwrap_or_default();
            slot.loaded = true;
        }

        Ok(SessionGuard { storage: self.storage.clone(), peer: peer.to_string(), slot })
    }

    /// Run `f` on a copy of the session with `peer`, committing the copy
    /// only if `f` succeeds.
    ///
    /// # Errors
    ///
    /// - `NoSession`: If no session exists
    /// - `Storage`: If the session cannot be loaded or persisted
    /// - Any error returned by `f`
    pub async fn with_session<R>(
        &self,
        peer: &str,
        f: impl FnOnce(&mut Session) -> Result<R, ClientError>,
    ) -> Result<R, ClientError> {
        let mut guard = self.lock(peer).await?;
        let mut session =
            guard.session().cloned().ok_or_else(|| ClientError::NoSession { peer: peer.to_string() })?;

        let result = f(&mut session)?;
        guard.commit(session)?;
        Ok(result)
    }

    /// Whether a session with `peer` exists.
    pub async fn contains(&self, peer: &str) -> Result<bool, ClientError> {
        Ok(self.lock(peer).await?.session().is_some())
    }
}

/// Exclusive access to one conversation.
///
/// Dropping the guard releases the conversation without changing it.
pub struct SessionGuard<S: SecureStorage> {
    storage: S,
    peer: String,
    slot: OwnedMutexGuard<Slot>,
}

impl<S: SecureStorage> SessionGuard<S> {
    /// Conversation peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current session, if one exists.
    pub fn session(&self) -> Option<&Session> {
        self.slot.session.as_ref()
    }

    /// Persist `session` and make it current.
    ///
    /// # Errors
    ///
    /// - `Storage`: If the session cannot be persisted (the previous session
    ///   stays current)
    pub fn commit(&mut self, session: Session) -> Result<(), ClientError> {
        self.storage.store(&session_key(&self.peer), &session)?;
        self.slot.session = Some(session);
        Ok(())
    }

    /// Whether a handshake with this ephemeral key was already accepted.
    pub fn has_seen_handshake(&self, ephemeral: &AgreementPublicKey) -> bool {
        self.slot.seen_handshakes.contains(ephemeral)
    }

    /// Record an accepted handshake ephemeral key.
    ///
    /// # Errors
    ///
    /// - `Storage`: If the record cannot be persisted
    pub fn record_handshake(&mut self, ephemeral: AgreementPublicKey) -> Result<(), ClientError> {
        if self.has_seen_handshake(&ephemeral) {
            return Ok(());
        }

        let mut seen = self.slot.seen_handshakes.clone();
        seen.push(ephemeral);
        self.storage.store(&handshakes_key(&self.peer), &seen)?;
        self.slot.seen_handshakes = seen;
        Ok(())
    }
}
