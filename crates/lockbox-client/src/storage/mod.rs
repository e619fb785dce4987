//! Secure local storage for private key material and sessions
//!
//! The trait is synchronous and byte-oriented: values are opaque to the
//! backend. Typed values go through the CBOR helpers on the trait.
//!
//! # Keys
//!
//! - `identity`: 32-byte identity seed
//! - `signed_prekey`, `previous_signed_prekey`: CBOR [`SignedPreKey`]
//! - `one_time_prekeys`: CBOR list of one-time prekeys with used flags
//! - `session/<peer>`: CBOR session (ratchet state and handshake data)
//! - `handshakes/<peer>`: CBOR list of handshake ephemeral keys already
//!   accepted from the peer
//!
//! [`SignedPreKey`]: lockbox_crypto::SignedPreKey

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Serialize, de::DeserializeOwned};

pub use self::redb::RedbStorage;

/// Opaque key-value store for secret material.
///
/// Must be Clone (shared by the bundle manager and the session store),
/// Send + Sync, and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying storage.
pub trait SecureStorage: Clone + Send + Sync + 'static {
    /// Read the value stored under `key`.
    ///
    /// Returns `None` if nothing is stored.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, overwriting any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove the value under `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Read and CBOR-decode a value.
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.get(key)? else {
            return Ok(None);
        };

        ciborium::from_reader(bytes.as_slice())
            .map(Some)
            .map_err(|e| StorageError::Serialization(format!("{key}: {e}")))
    }

    /// CBOR-encode and store a value.
    fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| StorageError::Serialization(format!("{key}: {e}")))?;
        self.set(key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn typed_roundtrip() {
        let storage = MemoryStorage::new();
        let record = Record { name: "alice".to_string(), count: 3 };

        storage.store("record", &record).unwrap();
        let loaded: Option<Record> = storage.load("record").unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn missing_key_loads_none() {
        let storage = MemoryStorage::new();
        let loaded: Option<Record> = storage.load("absent").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn corrupt_value_is_serialization_error() {
        let storage = MemoryStorage::new();
        storage.set("record", &[0xFF, 0x00, 0x13]).unwrap();

        let result: Result<Option<Record>, _> = storage.load("record");
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
