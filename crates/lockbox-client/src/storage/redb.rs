//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Key material and sessions survive client restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, TableDefinition};

use super::{SecureStorage, StorageError};

/// Table: secrets
/// Key: storage key (e.g. `identity`, `session/<peer>`)
/// Value: opaque bytes (raw seed or CBOR)
const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the SECRETS table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(SECRETS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl SecureStorage for RedbStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SECRETS).map_err(|e| StorageError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(SECRETS).map_err(|e| StorageError::Io(e.to_string()))?;
            table.insert(key, value).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(SECRETS).map_err(|e| StorageError::Io(e.to_string()))?;
            table.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.set("identity", &[7u8; 32]).unwrap();
            storage.set("session/bob", b"state").unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.get("identity").unwrap(), Some(vec![7u8; 32]));
        assert_eq!(storage.get("session/bob").unwrap(), Some(b"state".to_vec()));
    }

    #[test]
    fn overwrite_and_delete() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("keys.redb")).unwrap();

        storage.set("k", b"one").unwrap();
        storage.set("k", b"two").unwrap();
        assert_eq!(storage.get("k").unwrap(), Some(b"two".to_vec()));

        storage.delete("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
        storage.delete("k").unwrap();
    }
}
