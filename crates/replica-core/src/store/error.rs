//! Store error handling
//!
//! Provides typed errors for local store operations with descriptive messages
//! and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while talking to the local store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to open the database file
    #[error("Failed to open local store at '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The database file is locked by another process
    #[error("Local store at '{path}' is locked by another process")]
    Locked { path: PathBuf },

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row could not be converted to or from JSON
    #[error("Row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Table referenced by a caller is not present
    #[error("Table '{0}' does not exist in the local store")]
    MissingTable(String),

    /// Row shape is not usable for the requested operation
    #[error("Invalid row for table '{table}': {details}")]
    InvalidRow { table: String, details: String },

    /// The worker thread owning the connection is gone
    #[error("Local store worker has shut down")]
    WorkerGone,

    /// Failed to spawn the worker thread
    #[error("Failed to start local store worker: {0}")]
    Spawn(#[source] io::Error),
}

impl StoreError {
    /// Classify an open failure for a database path
    pub fn from_open(error: rusqlite::Error, path: PathBuf) -> Self {
        match error.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Locked { path }
            }
            _ => StoreError::Open {
                path,
                source: error,
            },
        }
    }

    /// Check if retrying the failed operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Locked { .. } | StoreError::Open { .. } | StoreError::CreateDirectory { .. }
        )
    }

    /// A row references a parent that is not in the store
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::Locked { .. } => {
                Some("Close other replica processes using the same data directory and try again.")
            }
            StoreError::Open { .. } => {
                Some("Check that the data directory exists and is writable.")
            }
            StoreError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StoreError::MissingTable(_) => {
                Some("Run `replica migrate` so the local schema matches the server.")
            }
            _ => None,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
