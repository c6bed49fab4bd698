//! Replica Core Library
//!
//! Local-first replication engine: server tables are mirrored into an
//! embedded SQLite store, kept current by per-table change feeds, and edited
//! optimistically with rollback when the server rejects a write.
//!
//! # Architecture
//!
//! - **Store**: SQLite owned by a worker thread, reached through an async handle
//! - **Schema**: versioned migrations with reset-on-drift and deferred foreign keys
//! - **Sync**: shared change feeds per key, replayed into the store
//! - **Optimistic**: local-first writes, echo suppression and rollback
//!
//! Reads are served from the local store; the network is only used for
//! change feeds and writes.
//!
//! # Quick Start
//!
//! ```text
//! let replica = Replica::new(Config::load()?);
//!
//! // Keep companies in sync
//! let sub = replica.subscribe(ShapeOptions::new("companies")).await?;
//!
//! // Write optimistically
//! let company = replica.writer::<Company>().await?.create(Company::new("Acme", "acme", "u1")).await?;
//!
//! // Read locally
//! let companies = replica.queries("u1").await?.companies().await?;
//! ```
//!
//! # Modules
//!
//! - `replica`: Engine context (main entry point)
//! - `store`: Local store handle and lazy cell
//! - `schema`: Migration manifest and table materializer
//! - `sync`: Subscriptions, change feeds and replay
//! - `optimistic`: Pending operations and the optimistic writer
//! - `query`: Read accessors over the local store
//! - `models`: Typed rows of the replicated tables
//! - `upstream`: Server API client
//! - `config`: Application configuration

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod error;
pub mod models;
pub mod optimistic;
pub mod query;
pub mod replica;
pub mod schema;
pub mod store;
pub mod sync;
pub mod upstream;

pub use config::Config;
pub use error::{MigrationError, SyncError, UpstreamError, WriteError};
pub use models::{
    Company, CompanyMember, CompanyRole, InviteLink, Resource, Space, SpaceItem, SpaceItemRow, SpaceItemType,
    SpaceMember, SpaceRole, User,
};
pub use optimistic::{EchoPolicy, OptimisticWriter, PendingLedger};
pub use query::{ItemNode, Queries};
pub use replica::{Replica, ReplicaBuilder};
pub use store::{LocalStore, Row, RowKey, StoreCell, StoreError};
pub use sync::{ShapeOptions, Subscription, SyncCallbacks, SyncRegistry};
pub use upstream::{HttpUpstream, Upstream};

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// Callbacks run user code; a panic there must not wedge shared state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
