//! Production Environment implementation using the OS RNG.
//!
//! `SystemEnv` is the capability handle every randomness-consuming operation
//! requires. It can only be obtained through [`SystemEnv::new`], which
//! probes the OS RNG first, so an unusable entropy source is a construction
//! error instead of a failure in the middle of a handshake.

use lockbox_crypto::{CryptoError, Environment};

/// Production environment using cryptographic RNG.
///
/// # Security
///
/// The RNG uses getrandom which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Suitable for
/// identity keys, prekeys, ephemeral and ratchet keys, and AEAD nonces.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails after a successful probe.
/// Continuing without randomness would produce predictable keys and nonces.
#[derive(Clone, Debug)]
pub struct SystemEnv {
    _probed: (),
}

impl SystemEnv {
    /// Probe the OS RNG and return a handle.
    ///
    /// # Errors
    ///
    /// - `Entropy`: If the OS RNG is unavailable
    pub fn new() -> Result<Self, CryptoError> {
        let mut probe = [0u8; 32];
        getrandom::fill(&mut probe).map_err(|e| CryptoError::Entropy { reason: e.to_string() })?;
        Ok(Self { _probed: () })
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys would be predictable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new().unwrap();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];

        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        // Extremely unlikely to be equal if random
        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[test]
    fn system_env_random_bytes_fills_buffer() {
        let env = SystemEnv::new().unwrap();

        let mut bytes = [0u8; 64];
        env.random_bytes(&mut bytes);

        let non_zero_count = bytes.iter().filter(|&&b| b != 0).count();
        assert!(non_zero_count > 32, "Most bytes should be non-zero");
    }
}
