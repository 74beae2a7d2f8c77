pub mod repository;
pub mod sqlite;

pub use sqlite::*;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Corrupted column {column}: {reason}")]
    CorruptedColumn { column: String, reason: String },

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Shared handle to the gateway database.
///
/// SQLite connections are not `Sync`, so all access goes through one
/// mutex-guarded connection. Callers keep the critical section short and
/// never hold it across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and run migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(path)?))
    }

    /// In-memory database with the full schema (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_memory_database()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
