//! Error types for the replication engine
//!
//! Each layer has its own error enum; the store's lives in
//! [`crate::store::StoreError`]. Errors shared between concurrent callers
//! (single-flight initialization, broadcast feed failures) travel as
//! `Arc<SyncError>`.

use std::sync::Arc;
use thiserror::Error;

use crate::store::StoreError;

/// Errors from the HTTP API that owns authoritative data
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("No upstream API is configured")]
    NotConfigured,

    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Non-success response
    #[error("Upstream rejected the request ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Errors while bringing the local schema up to date
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A migration failed even after resetting the local schema
    #[error("Migration '{name}' failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Could not fetch migrations: {0}")]
    Source(#[from] UpstreamError),

    #[error("Invalid migration manifest: {0}")]
    InvalidManifest(String),
}

/// Errors from subscriptions and change-feed replay
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Shared failure of an initialization several callers were waiting on
    #[error("Initialization failed: {0}")]
    Initialization(#[source] Arc<SyncError>),

    #[error("Table '{0}' is not present in the local schema")]
    MissingTable(String),

    #[error("Could not open change feed for '{key}': {message}")]
    Connect { key: String, message: String },

    #[error("Change feed for '{key}' failed: {message}")]
    Stream { key: String, message: String },

    /// Subscriptions were cleared while this one was still being created
    #[error("Subscription '{0}' was cancelled during setup")]
    Cancelled(String),

    #[error("Invalid subscription: {0}")]
    InvalidOptions(String),
}

impl SyncError {
    /// Unwrap shared initialization failures to the underlying cause
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Initialization(inner) => inner.root(),
            other => other,
        }
    }

    /// Check if retrying may succeed
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            SyncError::Store(e) => e.is_recoverable(),
            SyncError::Connect { .. } | SyncError::Stream { .. } | SyncError::Cancelled(_) => true,
            SyncError::Migration(MigrationError::Source(_)) => true,
            _ => false,
        }
    }
}

/// Errors from optimistic writes
#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The upstream call failed; local changes were rolled back
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{table} '{id}' not found")]
    NotFound { table: String, id: String },

    #[error("Invalid {table} payload: {source}")]
    Encoding {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid reorder: {0}")]
    Reorder(#[from] crate::optimistic::ReorderError),

    #[error("{0} does not support reordering")]
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_shared_failures() {
        let inner = Arc::new(SyncError::MissingTable("spaces".to_string()));
        let outer = SyncError::Initialization(Arc::new(SyncError::Initialization(inner)));

        assert!(matches!(outer.root(), SyncError::MissingTable(t) if t == "spaces"));
        assert!(!outer.is_recoverable());
        assert!(outer.to_string().contains("Initialization failed"));
    }

    #[test]
    fn test_stream_errors_are_recoverable() {
        let err = SyncError::Stream {
            key: "spaces".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_upstream_status() {
        let err = UpstreamError::Status {
            status: 409,
            message: "slug taken".to_string(),
        };
        assert_eq!(err.status(), Some(409));
        assert_eq!(UpstreamError::NotConfigured.status(), None);

        let write: WriteError = err.into();
        assert!(write.to_string().contains("slug taken"));
    }
}
