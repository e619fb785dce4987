//! Lockbox demo binary.
//!
//! Runs a two-party conversation between `alice` and `bob` over an in-memory
//! key directory. Envelopes travel as CBOR through a transport that shuffles
//! every batch, so messages routinely arrive out of order.
//!
//! # Usage
//!
//! ```bash
//! # Ephemeral keys, OS randomness
//! lockbox-demo --messages 20
//!
//! # Reproducible run with key material persisted across runs
//! lockbox-demo --seed 7 --db-path /tmp/lockbox --log-level debug
//! ```

#![allow(clippy::disallowed_types, reason = "Seeded RNG is only locked synchronously")]

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::Parser;
use lockbox_client::{
    ClientConfig, ClientError, Envelope, MemoryKeyDirectory, MemoryStorage, Messenger,
    RedbStorage, SecureStorage, SystemEnv,
};
use lockbox_crypto::Environment;
use rand::{RngCore, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Lockbox two-party conversation demo
#[derive(Parser, Debug)]
#[command(name = "lockbox-demo")]
#[command(about = "End-to-end encrypted conversation over an unordered transport")]
#[command(version)]
struct Args {
    /// Messages each party sends
    #[arg(short, long, default_value = "10")]
    messages: usize,

    /// Directory for persistent key and session databases (in-memory if
    /// omitted)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Replenish the directory's one-time prekeys below this count
    #[arg(long, default_value = "10")]
    opk_min: usize,

    /// One-time prekey count after replenishment
    #[arg(long, default_value = "40")]
    opk_target: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed for key generation and delivery order (OS randomness if omitted)
    #[arg(long)]
    seed: Option<u64>,
}

/// Key material randomness: the OS RNG, or a seeded stream for
/// reproducible runs.
#[derive(Clone)]
enum DemoEnv {
    System(SystemEnv),
    Seeded(Arc<Mutex<ChaCha20Rng>>),
}

impl DemoEnv {
    fn new(seed: Option<u64>) -> Result<Self, ClientError> {
        match seed {
            Some(seed) => Ok(Self::Seeded(Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))))),
            None => Ok(Self::System(SystemEnv::new()?)),
        }
    }
}

impl Environment for DemoEnv {
    #[allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]
    fn random_bytes(&self, buffer: &mut [u8]) {
        match self {
            Self::System(env) => env.random_bytes(buffer),
            Self::Seeded(rng) => rng.lock().expect("Mutex poisoned").fill_bytes(buffer),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Lockbox demo starting");

    let config = ClientConfig {
        opk_min: args.opk_min,
        opk_target: args.opk_target,
        ..ClientConfig::default()
    };

    match &args.db_path {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            tracing::info!(path = %dir.display(), "Using persistent storage");
            let alice = RedbStorage::open(dir.join("alice.redb"))?;
            let bob = RedbStorage::open(dir.join("bob.redb"))?;
            converse(&args, config, alice, bob).await?;
        },
        None => converse(&args, config, MemoryStorage::new(), MemoryStorage::new()).await?,
    }

    tracing::info!("Lockbox demo finished");
    Ok(())
}

async fn converse<S: SecureStorage>(
    args: &Args,
    config: ClientConfig,
    alice_storage: S,
    bob_storage: S,
) -> Result<(), ClientError> {
    let directory = MemoryKeyDirectory::new();
    let mut transport = match args.seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    };

    let alice = Messenger::new(
        DemoEnv::new(args.seed)?,
        alice_storage,
        directory.clone(),
        "alice",
        config.clone(),
    )?;
    let bob = Messenger::new(
        DemoEnv::new(args.seed.map(|seed| seed.wrapping_add(1)))?,
        bob_storage,
        directory.clone(),
        "bob",
        config,
    )?;

    alice.start().await?;
    bob.start().await?;
    tracing::info!(
        alice = %alice.identity_key().to_base64(),
        bob = %bob.identity_key().to_base64(),
        "Clients registered"
    );

    let mut batch = Vec::with_capacity(args.messages);
    for i in 0..args.messages {
        let envelope = alice.encrypt_text("bob", &format!("Hello Bob, this is message {i}")).await?;
        batch.push(envelope.to_bytes()?);
    }
    deliver(&bob, &mut transport, batch).await?;

    let mut batch = Vec::with_capacity(args.messages);
    for i in 0..args.messages {
        let envelope = bob.encrypt_text("alice", &format!("Hi Alice, reply {i}")).await?;
        batch.push(envelope.to_bytes()?);
    }
    deliver(&alice, &mut transport, batch).await?;

    for (name, messenger, peer) in [("alice", &alice, "bob"), ("bob", &bob, "alice")] {
        let status = messenger.session_status(peer).await?;
        tracing::info!(
            user = name,
            role = ?status.role,
            sent = status.send_count,
            received = status.recv_count,
            skipped_keys = status.skipped_keys,
            directory_prekeys = directory.available(name),
            "Session summary"
        );
    }

    Ok(())
}

/// Shuffle a batch of encoded envelopes and hand them to `receiver`.
async fn deliver<S: SecureStorage>(
    receiver: &Messenger<DemoEnv, S, MemoryKeyDirectory>,
    transport: &mut ChaCha20Rng,
    mut batch: Vec<Vec<u8>>,
) -> Result<(), ClientError> {
    batch.shuffle(transport);

    for bytes in batch {
        let envelope = Envelope::from_bytes(&bytes)?;
        let text = receiver.decrypt_text(&envelope).await?;
        tracing::info!(
            to = receiver.user_id(),
            from = %envelope.sender,
            msg_num = envelope.header.msg_num,
            handshake = envelope.handshake.is_some(),
            text = %text,
            "Delivered"
        );
    }

    Ok(())
}
