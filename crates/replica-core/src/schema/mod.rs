//! Local schema management
//!
//! ## Architecture
//!
//! - **Manifest**: ordered, named migrations (embedded or fetched from the
//!   server) and the plan derived from the last applied one.
//! - **Materializer**: applies the plan, resets the schema when the local
//!   state is unknown or a migration fails, then defers foreign keys.
//! - **Deferral**: table rebuilds that make every foreign key
//!   `DEFERRABLE INITIALLY DEFERRED`, so per-table replay order never
//!   violates a constraint mid-transaction.

mod defer;
mod manifest;
mod materializer;

pub use defer::{defer_foreign_keys, defer_references};
pub use manifest::{Manifest, Migration, MigrationPlan, MigrationSource};
pub use materializer::{
    ensure_table, last_applied, reset, status, AppliedMigration, MaterializeReport, Materializer,
    TRACKING_TABLE,
};
