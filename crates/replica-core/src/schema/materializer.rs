//! Table materializer
//!
//! Brings the local schema in line with the migration manifest before any
//! change feed starts. The local store is a cache of server data, so the
//! recovery policy for anything unexpected is to drop every table and
//! rebuild from the first migration.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::defer::defer_foreign_keys;
use super::manifest::{Manifest, Migration, MigrationPlan, MigrationSource};
use crate::error::{MigrationError, SyncError};
use crate::store::table::{quote_ident, table_columns, table_exists};
use crate::store::{LocalStore, StoreError};

/// Name of the migration-tracking table
pub const TRACKING_TABLE: &str = "replica_migrations";

const TRACKING_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS replica_migrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        migration_name TEXT NOT NULL UNIQUE,
        applied_at TEXT NOT NULL,
        checksum TEXT,
        success BOOLEAN DEFAULT TRUE
    );
"#;

/// A migration recorded in the tracking table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: String,
    pub checksum: Option<String>,
}

/// What `ensure_ready` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    /// Migrations applied during this run, in order
    pub applied: Vec<String>,
    /// Whether the local schema was dropped and rebuilt
    pub reset: bool,
    /// Tables rebuilt to defer their foreign keys
    pub deferred: Vec<String>,
}

impl MaterializeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && !self.reset && self.deferred.is_empty()
    }
}

/// Applies migrations from a [`MigrationSource`] to a local store
#[derive(Clone)]
pub struct Materializer {
    source: Arc<dyn MigrationSource>,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new(Arc::new(Manifest::embedded()))
    }
}

impl Materializer {
    pub fn new(source: Arc<dyn MigrationSource>) -> Self {
        Self { source }
    }

    /// Make the local schema match the manifest
    pub async fn ensure_ready(&self, store: &LocalStore) -> Result<MaterializeReport, MigrationError> {
        store.exec(TRACKING_DDL).await?;

        let manifest = self.source.manifest().await?;
        let last = last_applied(store).await?;
        let mut report = MaterializeReport::default();

        match manifest.plan(last.as_deref()) {
            MigrationPlan::UpToDate => {
                debug!(last = last.as_deref(), "Local schema up to date");
            }
            MigrationPlan::Apply(pending) => {
                info!("Applying {} migration(s)", pending.len());
                if let Err(e) = apply_all(store, &pending, &mut report).await {
                    warn!("Migration failed ({}); resetting local schema", e);
                    self.rebuild(store, &manifest, &mut report).await?;
                }
            }
            MigrationPlan::Reset(_) => {
                warn!(
                    last = last.as_deref(),
                    "Recorded migration is unknown to the manifest; resetting local schema"
                );
                self.rebuild(store, &manifest, &mut report).await?;
            }
        }

        report.deferred = store.call(defer_foreign_keys).await?;
        Ok(report)
    }

    async fn rebuild(
        &self,
        store: &LocalStore,
        manifest: &Manifest,
        report: &mut MaterializeReport,
    ) -> Result<(), MigrationError> {
        reset(store).await?;
        report.reset = true;
        report.applied.clear();
        apply_all(store, manifest.migrations(), report).await
    }
}

async fn apply_all(
    store: &LocalStore,
    migrations: &[Migration],
    report: &mut MaterializeReport,
) -> Result<(), MigrationError> {
    for migration in migrations {
        apply_one(store, migration.clone()).await?;
        report.applied.push(migration.name.clone());
    }
    Ok(())
}

/// Run one migration and record it in the same transaction
async fn apply_one(store: &LocalStore, migration: Migration) -> Result<(), MigrationError> {
    let name = migration.name.clone();
    store
        .call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&migration.sql)?;
            tx.execute(
                "INSERT INTO replica_migrations (migration_name, applied_at, checksum, success)
                 VALUES (?1, ?2, ?3, 1)",
                rusqlite::params![migration.name, Utc::now().to_rfc3339(), migration.checksum],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|source| MigrationError::Failed {
            name: name.clone(),
            source,
        })?;

    info!(migration = %name, "Applied migration");
    Ok(())
}

/// Drop every table except the tracking table and clear the tracking table
pub async fn reset(store: &LocalStore) -> Result<(), MigrationError> {
    let dropped = store.call(drop_all_tables).await?;
    info!("Reset local schema, dropped {} table(s)", dropped);
    Ok(())
}

fn drop_all_tables(conn: &mut Connection) -> Result<usize, StoreError> {
    let tables = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1",
        )?;
        let names = stmt
            .query_map([TRACKING_TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
    };

    conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    let result = (|| -> Result<(), StoreError> {
        let tx = conn.transaction()?;
        for table in &tables {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
        }
        tx.execute_batch("DELETE FROM replica_migrations")?;
        tx.commit()?;
        Ok(())
    })();
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    result?;

    Ok(tables.len())
}

/// Name of the most recent successfully applied migration
pub async fn last_applied(store: &LocalStore) -> Result<Option<String>, StoreError> {
    let row = store
        .query_one(
            "SELECT migration_name FROM replica_migrations WHERE success = 1 ORDER BY id DESC LIMIT 1",
            vec![],
        )
        .await?;
    Ok(row.and_then(|r| r.get("migration_name").and_then(|v| v.as_str()).map(str::to_string)))
}

/// Applied migrations in order
pub async fn status(store: &LocalStore) -> Result<Vec<AppliedMigration>, StoreError> {
    store
        .call(|conn| {
            if !table_exists(conn, TRACKING_TABLE)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT migration_name, applied_at, checksum FROM replica_migrations
                 WHERE success = 1 ORDER BY id",
            )?;
            let applied = stmt
                .query_map([], |row| {
                    Ok(AppliedMigration {
                        name: row.get(0)?,
                        applied_at: row.get(1)?,
                        checksum: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(applied)
        })
        .await
}

/// Verify a replicated table exists; returns its columns
pub async fn ensure_table(store: &LocalStore, table: &str) -> Result<Vec<String>, SyncError> {
    let name = table.to_string();
    let columns = store
        .call(move |conn| {
            if table_exists(conn, &name)? {
                Ok(Some(table_columns(conn, &name)?))
            } else {
                Ok(None)
            }
        })
        .await?;

    columns.ok_or_else(|| SyncError::MissingTable(table.to_string()))
}
