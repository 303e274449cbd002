//! Embedded registration database
//!
//! Nodes and controllers are registered as JSON blobs keyed by their id.
//! The store is a single `redb` file shared by every component that needs
//! to resolve an id at runtime (the ingest pipeline for node lookups, the
//! action dispatcher for controller lookups, the HTTP registrar endpoints
//! for CRUD).
//!
//! Reads and writes are synchronous; callers never hold any of their own
//! locks across a registrar call.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

/// Registered node/controller blobs keyed by their stable string id.
const REGISTRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("registrations");

pub type RegistrarResult<T> = Result<T, RegistrarError>;

/// Errors that can occur while touching the registration database
#[derive(Debug)]
pub enum RegistrarError {
    /// The database file could not be opened or created
    OpenFailed(String),

    /// A read or write transaction failed
    TransactionFailed(String),

    /// The stored blob is not valid UTF-8
    CorruptValue(String),
}

impl fmt::Display for RegistrarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrarError::OpenFailed(msg) => {
                write!(f, "failed to open registration database: {}", msg)
            }
            RegistrarError::TransactionFailed(msg) => {
                write!(f, "registration database transaction failed: {}", msg)
            }
            RegistrarError::CorruptValue(key) => {
                write!(f, "stored value for key '{}' is not valid UTF-8", key)
            }
        }
    }
}

impl std::error::Error for RegistrarError {}

/// Handle to the registration database
///
/// Cheap to clone via `Arc`; every component holds a non-owning reference
/// and the supervisor owns the lifecycle.
pub struct RegistrarDb {
    db: Database,
}

impl RegistrarDb {
    /// Open (or create) the registration database at the given path
    pub fn open(path: impl AsRef<Path>) -> RegistrarResult<Arc<Self>> {
        let path = path.as_ref();
        info!("opening registration database at {}", path.display());

        let db = Database::create(path)
            .map_err(|e| RegistrarError::OpenFailed(e.to_string()))?;

        // Make sure the table exists so first reads don't fail
        let tx = db
            .begin_write()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        tx.open_table(REGISTRATIONS)
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        tx.commit()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;

        Ok(Arc::new(Self { db }))
    }

    /// Check whether a key is present
    pub fn exists(&self, key: &str) -> RegistrarResult<bool> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        let table = tx
            .open_table(REGISTRATIONS)
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;

        let found = table
            .get(key)
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?
            .is_some();
        Ok(found)
    }

    /// Store a value under a key, replacing any previous value
    pub fn store(&self, key: &str, value: &str) -> RegistrarResult<()> {
        debug!("storing registration for key '{key}'");

        let tx = self
            .db
            .begin_write()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        {
            let mut table = tx
                .open_table(REGISTRATIONS)
                .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
            table
                .insert(key, value.as_bytes())
                .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        Ok(())
    }

    /// Load the value stored under a key, if any
    pub fn load(&self, key: &str) -> RegistrarResult<Option<String>> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        let table = tx
            .open_table(REGISTRATIONS)
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;

        let Some(value) = table
            .get(key)
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?
        else {
            return Ok(None);
        };

        let decoded = String::from_utf8(value.value().to_vec())
            .map_err(|_| RegistrarError::CorruptValue(key.to_string()))?;
        Ok(Some(decoded))
    }

    /// Remove a key. Removing an absent key is not an error.
    pub fn remove(&self, key: &str) -> RegistrarResult<()> {
        debug!("removing registration for key '{key}'");

        let tx = self
            .db
            .begin_write()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        {
            let mut table = tx
                .open_table(REGISTRATIONS)
                .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| RegistrarError::TransactionFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> (tempfile::TempDir, Arc<RegistrarDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = RegistrarDb::open(dir.path().join("registrar.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_store_load_remove() {
        let (_dir, db) = open_test_db();

        assert!(!db.exists("n1").unwrap());
        assert!(db.load("n1").unwrap().is_none());

        db.store("n1", r#"{"id":"n1","sensors":[]}"#).unwrap();
        assert!(db.exists("n1").unwrap());
        assert_eq!(
            db.load("n1").unwrap().as_deref(),
            Some(r#"{"id":"n1","sensors":[]}"#)
        );

        db.remove("n1").unwrap();
        assert!(!db.exists("n1").unwrap());
    }

    #[test]
    fn test_store_replaces_previous_value() {
        let (_dir, db) = open_test_db();

        db.store("c1", "first").unwrap();
        db.store("c1", "second").unwrap();
        assert_eq!(db.load("c1").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_remove_absent_key_is_ok() {
        let (_dir, db) = open_test_db();
        db.remove("missing").unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registrar.redb");

        {
            let db = RegistrarDb::open(&path).unwrap();
            db.store("n1", "blob").unwrap();
        }

        let db = RegistrarDb::open(&path).unwrap();
        assert_eq!(db.load("n1").unwrap().as_deref(), Some("blob"));
    }
}
