//! Lockbox client engine.
//!
//! Async glue around [`lockbox_crypto`]: local key lifecycle, a key directory
//! seam, secure storage, per-conversation sessions, and the [`Messenger`]
//! that drives X3DH and the Double Ratchet for every message.
//!
//! # Architecture
//!
//! Cryptography stays synchronous and pure in [`lockbox_crypto`]. This crate
//! adds the parts that touch the outside world: the [`KeyDirectory`] (remote,
//! async, may time out), [`SecureStorage`] (local, synchronous), and the
//! per-peer locking that keeps ratchet steps for one conversation in order.
//!
//! # Components
//!
//! - [`Messenger`]: Session setup, encryption, decryption
//! - [`KeyBundleManager`]: Identity, signed prekey, one-time prekey pool
//! - [`SessionStore`]: Per-conversation locks and persisted sessions
//! - [`Envelope`]: Wire message with optional handshake data
//! - [`MemoryKeyDirectory`]: In-process directory for tests and demos
//! - [`MemoryStorage`] / [`RedbStorage`]: Storage backends
//! - [`SystemEnv`]: Production environment (OS RNG)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bundle_manager;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod messenger;
pub mod session;
pub mod storage;
mod system_env;

pub use bundle_manager::{KeyBundleManager, ReplenishOutcome};
pub use config::ClientConfig;
pub use directory::{BundleRegistration, KeyDirectory, MemoryKeyDirectory};
pub use envelope::{DecodedHandshake, Envelope, HandshakeInit};
pub use error::{ClientError, DirectoryError};
pub use messenger::Messenger;
pub use session::{Role, Session, SessionGuard, SessionStatus, SessionStore};
pub use storage::{MemoryStorage, RedbStorage, SecureStorage, StorageError};
pub use system_env::SystemEnv;
