//! Change replay
//!
//! Consumes one shared change feed and applies it to the local store.
//!
//! ## Architecture
//!
//! - **Batching**: every message already buffered on the feed is drained and
//!   consecutive changes are applied in one transaction. A failed batch is
//!   retried one message at a time and failing messages are skipped.
//! - **Parking**: a change rejected by a foreign key is parked on the stream
//!   and retried after every later flush that wrote rows, so a child may
//!   arrive before its parent in any order across batches.
//! - **Echo suppression**: each change is first checked against the pending
//!   ledger; echoes of our own optimistic writes are dropped.
//! - **Timestamp guard**: an update older than the stored `updated_at` is
//!   ignored.
//! - **Fan-out**: after commit, listeners are notified in registration order.
//! - **Refetch**: `must-refetch` deletes only the rows inside the stream's
//!   filter; rows owned by other subscriptions on the table stay.

use futures_util::{FutureExt, StreamExt};
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::feed::{ChangeFeed, FeedItem, StreamError};
use super::message::{ChangeMessage, Control, Operation, ShapeMessage};
use super::registry::{ErrorSlot, SharedStream};
use crate::error::SyncError;
use crate::lock;
use crate::models::timestamp;
use crate::optimistic::{PendingLedger, Verdict};
use crate::store::table::{delete_row, fetch_row, insert_row, project, quote_ident, update_row};
use crate::store::{Row, RowKey, StoreResult};

/// Upper bound on messages taken from the feed per batch
const MAX_BATCH: usize = 500;

/// Column compared by the last-writer-wins guard
const TIMESTAMP_COLUMN: &str = "updated_at";

/// A change ready to be written
#[derive(Debug, Clone)]
pub(crate) struct PreparedChange {
    operation: Operation,
    key: RowKey,
    /// Projected onto the table's columns, key columns filled in
    row: Row,
}

/// What applying a change did to the store
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Inserted(Row),
    Updated { row: Row, previous: Row },
    Deleted(RowKey),
    /// Identical to what is stored
    Unchanged,
    /// Older than what is stored
    Stale,
    /// Delete of a row we never had
    Missing,
}

impl Outcome {
    /// Whether the store changed in a way that can satisfy a parked child
    fn is_write(&self) -> bool {
        matches!(self, Outcome::Inserted(_) | Outcome::Updated { .. })
    }
}

pub(crate) struct Replayer {
    entry: Arc<SharedStream>,
    ledger: PendingLedger,
    errors: ErrorSlot,
}

impl Replayer {
    pub(crate) fn new(entry: Arc<SharedStream>, ledger: PendingLedger, errors: ErrorSlot) -> Self {
        Self { entry, ledger, errors }
    }

    /// Replay the feed until it ends or the task is aborted
    pub(crate) async fn run(self, feed: ChangeFeed) {
        let mut feed = feed.fuse();
        let mut batches = 0u64;

        while let Some(first) = feed.next().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match feed.next().now_or_never() {
                    Some(Some(item)) => batch.push(item),
                    _ => break,
                }
            }
            batches += 1;
            trace!(key = %self.entry.key, size = batch.len(), "Replaying batch");
            self.process(batch).await;
        }

        info!(key = %self.entry.key, batches, "Change feed ended");
    }

    async fn process(&self, batch: Vec<FeedItem>) {
        let mut chunk = Vec::new();
        for item in batch {
            match item {
                Ok(ShapeMessage::Change(change)) => {
                    if let Some(prepared) = self.prepare(change) {
                        chunk.push(prepared);
                    }
                }
                Ok(ShapeMessage::Control(control)) => {
                    self.flush(std::mem::take(&mut chunk)).await;
                    self.control(control.headers.control).await;
                }
                Err(e) => {
                    self.flush(std::mem::take(&mut chunk)).await;
                    self.fail(e);
                }
            }
        }
        self.flush(chunk).await;
    }

    fn prepare(&self, change: ChangeMessage) -> Option<PreparedChange> {
        let operation = change.operation();
        let Some(key) = change.row_key(&self.entry.primary_key) else {
            warn!(key = %self.entry.key, ?operation, "Skipping change without a row identity");
            return None;
        };

        if self.ledger.classify(&self.entry.table, operation, Some(&key), &change.value) == Verdict::Suppress {
            debug!(table = %self.entry.table, row = %key, ?operation, "Dropped echo of local write");
            return None;
        }

        let mut row = project(&change.value, &self.entry.columns);
        for (column, value) in key.parts() {
            row.entry(column.clone()).or_insert_with(|| value.clone());
        }
        Some(PreparedChange { operation, key, row })
    }

    /// Apply a run of changes and notify listeners
    async fn flush(&self, chunk: Vec<PreparedChange>) {
        if chunk.is_empty() {
            return;
        }

        let chunk = Arc::new(self.absorb_parked(chunk));
        let outcomes = match self.apply_batch(Arc::clone(&chunk)).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(
                    key = %self.entry.key,
                    size = chunk.len(),
                    "Batch failed, replaying messages one by one: {}", e
                );
                self.apply_each(Arc::clone(&chunk)).await
            }
        };

        let wrote = outcomes.iter().any(Outcome::is_write);
        for outcome in &outcomes {
            self.fan_out(outcome);
        }
        if wrote {
            self.retry_parked().await;
        }
    }

    /// Fold parked changes into newer changes for the same row
    ///
    /// A delete discards the parked change. Anything else is written on top
    /// of the parked values, so columns the newer change lacks survive.
    fn absorb_parked(&self, mut chunk: Vec<PreparedChange>) -> Vec<PreparedChange> {
        let mut parked = lock(&self.entry.parked);
        if parked.is_empty() {
            return chunk;
        }

        for change in &mut chunk {
            let Some(position) = parked.iter().position(|p| p.key == change.key) else {
                continue;
            };
            let older = parked.remove(position);
            if change.operation != Operation::Delete {
                let mut row = older.row;
                row.extend(std::mem::take(&mut change.row));
                change.row = row;
            }
        }
        chunk
    }

    /// Re-apply parked changes until a pass leaves the queue no shorter
    async fn retry_parked(&self) {
        loop {
            let waiting = std::mem::take(&mut *lock(&self.entry.parked));
            if waiting.is_empty() {
                return;
            }

            let before = waiting.len();
            let outcomes = self.apply_each(Arc::new(waiting)).await;
            for outcome in &outcomes {
                self.fan_out(outcome);
            }

            let after = lock(&self.entry.parked).len();
            debug!(key = %self.entry.key, before, after, "Retried parked changes");
            if after == 0 || after >= before {
                return;
            }
        }
    }

    async fn apply_batch(&self, chunk: Arc<Vec<PreparedChange>>) -> StoreResult<Vec<Outcome>> {
        let table = self.entry.table.clone();
        self.entry
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut outcomes = Vec::with_capacity(chunk.len());
                for change in chunk.iter() {
                    outcomes.push(apply_change(&tx, &table, change)?);
                }
                tx.commit()?;
                Ok(outcomes)
            })
            .await
    }

    /// Apply changes one by one; foreign-key failures are parked
    async fn apply_each(&self, chunk: Arc<Vec<PreparedChange>>) -> Vec<Outcome> {
        let table = self.entry.table.clone();
        let changes = Arc::clone(&chunk);
        let results = self
            .entry
            .store
            .call(move |conn| {
                Ok(changes
                    .iter()
                    .map(|c| apply_change(conn, &table, c))
                    .collect::<Vec<_>>())
            })
            .await;

        let results = match results {
            Ok(results) => results,
            Err(e) => {
                warn!(key = %self.entry.key, "Store unavailable during replay: {}", e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(results.len());
        for (change, result) in chunk.iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_foreign_key_violation() => {
                    debug!(table = %self.entry.table, row = %change.key, "Parent row not replayed yet, parking change");
                    lock(&self.entry.parked).push(change.clone());
                }
                Err(e) => {
                    warn!(table = %self.entry.table, row = %change.key, "Skipping change: {}", e);
                }
            }
        }
        outcomes
    }

    fn fan_out(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Unchanged | Outcome::Missing => return,
            Outcome::Stale => {
                debug!(table = %self.entry.table, "Ignored update older than local row");
                return;
            }
            _ => {}
        }

        for registration in self.entry.registrations() {
            match outcome {
                Outcome::Inserted(row) => registration.insert(row),
                Outcome::Updated { row, previous } => registration.update(row, Some(previous)),
                Outcome::Deleted(key) => registration.delete(key),
                Outcome::Unchanged | Outcome::Stale | Outcome::Missing => {}
            }
        }
    }

    async fn control(&self, control: Control) {
        match control {
            Control::UpToDate => {
                let orphans = lock(&self.entry.parked).len();
                if orphans > 0 {
                    warn!(key = %self.entry.key, orphans, "Rows still waiting for a parent row at up-to-date");
                }
                if let Some(registrations) = self.entry.mark_up_to_date() {
                    info!(key = %self.entry.key, listeners = registrations.len(), "Initial sync complete");
                    for registration in registrations {
                        registration.up_to_date();
                    }
                }
            }
            Control::MustRefetch => {
                warn!(
                    key = %self.entry.key,
                    filter = self.entry.where_clause.as_deref().unwrap_or("none"),
                    "Server requested refetch, clearing local rows"
                );
                lock(&self.entry.parked).clear();
                let mut sql = format!("DELETE FROM {}", quote_ident(&self.entry.table));
                if let Some(clause) = &self.entry.where_clause {
                    sql.push_str(&format!(" WHERE ({})", clause));
                }
                if let Err(e) = self.entry.store.execute(sql, Vec::new()).await {
                    warn!(key = %self.entry.key, "Failed to clear table for refetch: {}", e);
                }
            }
        }
    }

    /// Record a feed failure and tell every listener; the feed stays subscribed
    fn fail(&self, error: StreamError) {
        warn!(key = %self.entry.key, "Change feed error: {}", error);
        let error = Arc::new(SyncError::Stream {
            key: self.entry.key.clone(),
            message: error.to_string(),
        });
        *lock(&self.errors) = Some(Arc::clone(&error));

        for registration in self.entry.registrations() {
            registration.error(&error);
        }
    }
}

fn apply_change(conn: &Connection, table: &str, change: &PreparedChange) -> StoreResult<Outcome> {
    if change.operation == Operation::Delete {
        return Ok(match delete_row(conn, table, &change.key)? {
            0 => Outcome::Missing,
            _ => Outcome::Deleted(change.key.clone()),
        });
    }

    let Some(existing) = fetch_row(conn, table, &change.key)? else {
        insert_row(conn, table, &change.row)?;
        return Ok(Outcome::Inserted(change.row.clone()));
    };

    if is_stale(&existing, &change.row) {
        return Ok(Outcome::Stale);
    }

    // Partial update: only the columns that differ
    let changes: Row = change
        .row
        .iter()
        .filter(|(column, value)| existing.get(column.as_str()) != Some(*value))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    if changes.is_empty() {
        return Ok(Outcome::Unchanged);
    }

    update_row(conn, table, &change.key, &changes)?;
    let mut row = existing.clone();
    row.extend(changes);
    Ok(Outcome::Updated { row, previous: existing })
}

/// Incoming row is older than the stored one
fn is_stale(existing: &Row, incoming: &Row) -> bool {
    let stamp = |row: &Row| {
        row.get(TIMESTAMP_COLUMN)
            .and_then(Value::as_str)
            .and_then(timestamp::parse)
    };
    match (stamp(existing), stamp(incoming)) {
        (Some(stored), Some(incoming)) => incoming < stored,
        _ => false,
    }
}
