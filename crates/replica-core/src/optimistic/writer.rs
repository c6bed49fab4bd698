//! Optimistic writes
//!
//! Every mutation follows the same three steps:
//!
//! 1. record a pending operation and apply the change to the local store,
//!    capturing whatever is needed to undo it;
//! 2. submit the change upstream;
//! 3. on success fold the server's answer into the local row, on failure
//!    restore the captured state and return the upstream error.
//!
//! The pending operation is dropped once step 2 settles, whatever the outcome.

use rusqlite::Connection;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ledger::{PendingKind, PendingLedger};
use super::reorder::{plan_reorder, Placement};
use crate::error::{UpstreamError, WriteError};
use crate::models::{timestamp, Resource};
use crate::store::table::{
    delete_row, fetch_row, fetch_where, insert_row, project, quote_ident, table_columns, update_row,
};
use crate::store::{LocalStore, Row, RowKey, StoreResult};
use crate::upstream::Upstream;

/// Prefix of client-generated identities
pub const TEMP_ID_PREFIX: &str = "temp-";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Optimistic writer for one resource type
pub struct OptimisticWriter<R: Resource> {
    store: LocalStore,
    upstream: Arc<dyn Upstream>,
    ledger: PendingLedger,
    _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Clone for OptimisticWriter<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            upstream: Arc::clone(&self.upstream),
            ledger: self.ledger.clone(),
            _resource: PhantomData,
        }
    }
}

impl<R: Resource> OptimisticWriter<R> {
    pub fn new(store: LocalStore, upstream: Arc<dyn Upstream>, ledger: PendingLedger) -> Self {
        Self {
            store,
            upstream,
            ledger,
            _resource: PhantomData,
        }
    }

    /// Insert `draft` under a temporary id, then swap in the server's row
    pub async fn create(&self, draft: R) -> Result<R, WriteError> {
        let table = R::TABLE;
        let mut row = draft.to_row().map_err(|source| encoding::<R>(source))?;
        let temp_id = format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4());
        row.insert("id".to_string(), Value::String(temp_id.clone()));

        let submitted = submitted_fields::<R>(&row);
        let guard = self
            .ledger
            .record(table, PendingKind::Create, vec![temp_id.clone()], submitted.clone());

        let local = row.clone();
        self.store
            .call(move |conn| {
                let columns = table_columns(conn, table)?;
                insert_row(conn, table, &project(&local, &columns))
            })
            .await?;
        debug!(table, id = %temp_id, "Inserted optimistic row");

        let response = self.upstream.create(R::collection_path(&row), submitted).await;
        let server_row = match response.and_then(|server| match server.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(server),
            _ => Err(UpstreamError::InvalidResponse(format!("{} response carries no id", R::NAME))),
        }) {
            Ok(server) => server,
            Err(e) => {
                warn!(table, id = %temp_id, "Create rejected upstream, rolling back: {}", e);
                let key = RowKey::id(temp_id.clone());
                self.rollback(move |conn| delete_row(conn, table, &key).map(|_| ()))
                    .await;
                return Err(e.into());
            }
        };

        let server_id = server_row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        guard.add_target(server_id.clone());

        let stored = self
            .store
            .call(move |conn| replace_temp::<R>(conn, &temp_id, &server_id, server_row))
            .await?;
        drop(guard);

        info!(table, id = ?stored.get("id"), "Created {}", R::NAME);
        R::from_row(&stored).map_err(encoding::<R>)
    }

    /// Apply `patch` locally, then upstream; restores the prior row on failure
    pub async fn update(&self, id: &str, mut patch: Row) -> Result<R, WriteError> {
        let table = R::TABLE;
        patch.remove("id");
        let key = RowKey::id(id);

        let _guard = self
            .ledger
            .record(table, PendingKind::Update, vec![id.to_string()], patch.clone());

        let local_key = key.clone();
        let local_patch = patch.clone();
        let prior = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(prior) = fetch_row(&tx, table, &local_key)? else {
                    return Ok(None);
                };
                let columns = table_columns(&tx, table)?;
                let mut changes = project(&local_patch, &columns);
                touch(&mut changes, &columns);
                update_row(&tx, table, &local_key, &changes)?;
                tx.commit()?;
                Ok(Some(prior))
            })
            .await?
            .ok_or_else(|| not_found::<R>(id))?;

        match self.upstream.update(R::member_path(&prior), patch).await {
            Ok(server) => {
                let confirm_key = key.clone();
                let current = self
                    .store
                    .call(move |conn| {
                        if let Some(mut server) = server {
                            server.remove("id");
                            let columns = table_columns(conn, table)?;
                            update_row(conn, table, &confirm_key, &project(&server, &columns))?;
                        }
                        fetch_row(conn, table, &confirm_key)
                    })
                    .await?
                    .ok_or_else(|| not_found::<R>(id))?;
                info!(table, id, "Updated {}", R::NAME);
                R::from_row(&current).map_err(encoding::<R>)
            }
            Err(e) => {
                warn!(table, id, "Update rejected upstream, rolling back: {}", e);
                self.rollback(move |conn| update_row(conn, table, &key, &prior).map(|_| ()))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Remove a row locally, reparenting its children to the root
    pub async fn delete(&self, id: &str) -> Result<(), WriteError> {
        let table = R::TABLE;
        let key = RowKey::id(id);
        let _guard = self
            .ledger
            .record(table, PendingKind::Delete, vec![id.to_string()], Row::new());

        let local_key = key.clone();
        let captured = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(prior) = fetch_row(&tx, table, &local_key)? else {
                    return Ok(None);
                };
                let children = match R::PARENT_COLUMN {
                    Some(parent) => {
                        let children = fetch_where(&tx, table, parent, &Value::String(local_id(&local_key)))?;
                        tx.execute(
                            &format!(
                                "UPDATE {} SET {} = NULL WHERE {} = ?1",
                                quote_ident(table),
                                quote_ident(parent),
                                quote_ident(parent)
                            ),
                            [local_id(&local_key)],
                        )?;
                        children
                    }
                    None => Vec::new(),
                };
                delete_row(&tx, table, &local_key)?;
                tx.commit()?;
                Ok(Some((prior, children)))
            })
            .await?;
        let (prior, children) = captured.ok_or_else(|| not_found::<R>(id))?;
        debug!(table, id, children = children.len(), "Deleted row locally");

        match self.upstream.delete(R::member_path(&prior)).await {
            Ok(()) => {
                info!(table, id, "Deleted {}", R::NAME);
                Ok(())
            }
            Err(e) => {
                warn!(table, id, "Delete rejected upstream, rolling back: {}", e);
                self.rollback(move |conn| {
                    let tx = conn.transaction()?;
                    insert_row(&tx, table, &prior)?;
                    if let Some(parent) = R::PARENT_COLUMN {
                        for child in &children {
                            if let Some(child_key) = RowKey::from_row(&["id".to_string()], child) {
                                let mut restore = Row::new();
                                restore.insert(parent.to_string(), child.get(parent).cloned().unwrap_or(Value::Null));
                                update_row(&tx, table, &child_key, &restore)?;
                            }
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await;
                Err(e.into())
            }
        }
    }

    /// Move `id` to `new_index` under `new_parent`, renumbering siblings
    ///
    /// Returns the placements that changed.
    pub async fn reorder(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_index: usize,
    ) -> Result<Vec<Placement>, WriteError> {
        let table = R::TABLE;
        let (Some(order), Some(scope)) = (R::ORDER_COLUMN, R::SCOPE_COLUMN) else {
            return Err(WriteError::Unsupported(R::NAME));
        };
        if new_parent.is_some() && R::PARENT_COLUMN.is_none() {
            return Err(WriteError::Unsupported(R::NAME));
        }

        let key = RowKey::id(id);
        let (moved, items) = self
            .store
            .call(move |conn| {
                let Some(moved) = fetch_row(conn, table, &key)? else {
                    return Ok(None);
                };
                let scope_value = moved.get(scope).cloned().unwrap_or(Value::Null);
                let items = fetch_where(conn, table, scope, &scope_value)?;
                Ok(Some((moved, items)))
            })
            .await?
            .ok_or_else(|| not_found::<R>(id))?;

        let path = R::reorder_path(&moved).ok_or(WriteError::Unsupported(R::NAME))?;
        let before: Vec<Placement> = items.iter().filter_map(|row| placement::<R>(row, order)).collect();
        let plan = plan_reorder(&before, id, new_parent, new_index)?;
        if plan.is_empty() {
            return Ok(plan);
        }

        let _guard = self.ledger.record(
            table,
            PendingKind::Reorder,
            plan.iter().map(|p| p.id.clone()).collect(),
            Row::new(),
        );

        let prior: Vec<Placement> = before
            .into_iter()
            .filter(|b| plan.iter().any(|p| p.id == b.id))
            .collect();

        let local_plan = plan.clone();
        self.store
            .call(move |conn| apply_placements::<R>(conn, order, &local_plan))
            .await?;
        debug!(table, id, moved = plan.len(), "Reordered locally");

        match self.upstream.reorder(path, plan.clone()).await {
            Ok(()) => {
                info!(table, id, "Reordered {}", R::NAME);
                Ok(plan)
            }
            Err(e) => {
                warn!(table, id, "Reorder rejected upstream, rolling back: {}", e);
                self.rollback(move |conn| apply_placements::<R>(conn, order, &prior)).await;
                Err(e.into())
            }
        }
    }

    /// Restore captured state; a failure here is logged, the upstream error wins
    async fn rollback<F>(&self, f: F)
    where
        F: FnOnce(&mut Connection) -> StoreResult<()> + Send + 'static,
    {
        if let Err(e) = self.store.call(f).await {
            error!(table = R::TABLE, "Rollback failed: {}", e);
        }
    }
}

fn encoding<R: Resource>(source: serde_json::Error) -> WriteError {
    WriteError::Encoding {
        table: R::TABLE.to_string(),
        source,
    }
}

fn not_found<R: Resource>(id: &str) -> WriteError {
    WriteError::NotFound {
        table: R::NAME.to_string(),
        id: id.to_string(),
    }
}

fn local_id(key: &RowKey) -> String {
    key.identity()
}

/// Fields the caller chose, i.e. everything the server does not generate
fn submitted_fields<R: Resource>(row: &Row) -> Row {
    row.iter()
        .filter(|(k, v)| !v.is_null() && !R::GENERATED_COLUMNS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Stamp `updated_at` on a local change when the table has one
fn touch(changes: &mut Row, columns: &[String]) {
    if !changes.is_empty() && columns.iter().any(|c| c == "updated_at") {
        changes.insert(
            "updated_at".to_string(),
            Value::String(timestamp::format(chrono::Utc::now())),
        );
    }
}

fn placement<R: Resource>(row: &Row, order: &str) -> Option<Placement> {
    Some(Placement {
        id: row.get("id")?.as_str()?.to_string(),
        parent_id: R::PARENT_COLUMN
            .and_then(|parent| row.get(parent))
            .and_then(Value::as_str)
            .map(str::to_string),
        order_index: row.get(order).and_then(Value::as_i64).unwrap_or(0),
    })
}

fn apply_placements<R: Resource>(conn: &mut Connection, order: &str, placements: &[Placement]) -> StoreResult<()> {
    let tx = conn.transaction()?;
    for p in placements {
        let mut changes = Row::new();
        changes.insert(order.to_string(), Value::from(p.order_index));
        if let Some(parent) = R::PARENT_COLUMN {
            changes.insert(
                parent.to_string(),
                p.parent_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        update_row(&tx, R::TABLE, &RowKey::id(p.id.clone()), &changes)?;
    }
    tx.commit()?;
    Ok(())
}

/// Swap the temporary row for the server's, in place
fn replace_temp<R: Resource>(
    conn: &mut Connection,
    temp_id: &str,
    server_id: &str,
    server_row: Row,
) -> StoreResult<Row> {
    let table = R::TABLE;
    let tx = conn.transaction()?;
    let columns = table_columns(&tx, table)?;
    let server_row = project(&server_row, &columns);
    let temp_key = RowKey::id(temp_id);
    let server_key = RowKey::id(server_id);

    if fetch_row(&tx, table, &server_key)?.is_some() {
        // The feed delivered the server row first
        delete_row(&tx, table, &temp_key)?;
        update_row(&tx, table, &server_key, &server_row)?;
    } else if update_row(&tx, table, &temp_key, &server_row)? == 0 {
        insert_row(&tx, table, &server_row)?;
    }

    if let Some(parent) = R::PARENT_COLUMN {
        tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(table),
                quote_ident(parent),
                quote_ident(parent)
            ),
            [server_id, temp_id],
        )?;
    }

    let stored = fetch_row(&tx, table, &server_key)?.unwrap_or(server_row);
    tx.commit()?;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, SpaceItem, SpaceItemType};
    use crate::schema::Materializer;
    use futures_util::future::{BoxFuture, FutureExt};
    use serde_json::json;
    use std::sync::Mutex;

    /// Upstream that records calls and answers from a script
    #[derive(Default)]
    struct ScriptedUpstream {
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn outcome<T>(&self, call: String, ok: T) -> Result<T, UpstreamError> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                Err(UpstreamError::Status {
                    status: 500,
                    message: "boom".to_string(),
                })
            } else {
                Ok(ok)
            }
        }
    }

    impl Upstream for ScriptedUpstream {
        fn create(&self, path: String, mut body: Row) -> BoxFuture<'_, Result<Row, UpstreamError>> {
            body.insert("id".to_string(), json!("srv-42"));
            body.insert("owner_id".to_string(), json!("u1"));
            body.insert("created_by".to_string(), json!("u1"));
            body.insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
            body.insert("updated_at".to_string(), json!("2024-01-01T00:00:00Z"));
            let result = self.outcome(format!("POST {}", path), body);
            async move { result }.boxed()
        }

        fn update(&self, path: String, _patch: Row) -> BoxFuture<'_, Result<Option<Row>, UpstreamError>> {
            let result = self.outcome(format!("PATCH {}", path), None);
            async move { result }.boxed()
        }

        fn delete(&self, path: String) -> BoxFuture<'_, Result<(), UpstreamError>> {
            let result = self.outcome(format!("DELETE {}", path), ());
            async move { result }.boxed()
        }

        fn reorder(&self, path: String, _placements: Vec<Placement>) -> BoxFuture<'_, Result<(), UpstreamError>> {
            let result = self.outcome(format!("POST {}", path), ());
            async move { result }.boxed()
        }
    }

    async fn store() -> LocalStore {
        let store = LocalStore::open_in_memory().await.unwrap();
        Materializer::default().ensure_ready(&store).await.unwrap();
        store
    }

    fn writer<R: Resource>(store: &LocalStore, upstream: Arc<ScriptedUpstream>) -> OptimisticWriter<R> {
        OptimisticWriter::new(store.clone(), upstream, PendingLedger::default())
    }

    async fn seed_items(store: &LocalStore) {
        store
            .exec(
                "INSERT INTO space_items (id, space_id, parent_id, type, name, order_index, created_by, created_at, updated_at) VALUES
                 ('folder', 's1', NULL, 'folder', 'Folder', 0, 'u1', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z'),
                 ('a', 's1', 'folder', 'table', 'A', 0, 'u1', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z'),
                 ('b', 's1', 'folder', 'table', 'B', 1, 'u1', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z'),
                 ('c', 's1', NULL, 'view', 'C', 1, 'u1', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z');",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_replaces_temp_row() {
        let store = store().await;
        let upstream = Arc::new(ScriptedUpstream::default());
        let companies = writer::<Company>(&store, upstream.clone());

        let created = companies.create(Company::new("Acme", "acme", "u1")).await.unwrap();
        assert_eq!(created.id, "srv-42");
        assert_eq!(created.name, "Acme");

        let rows = store.query("SELECT id FROM companies", vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("srv-42"));
        assert_eq!(*upstream.calls.lock().unwrap(), vec!["POST /api/companies"]);
        assert!(companies.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_row() {
        let store = store().await;
        let companies = writer::<Company>(&store, Arc::new(ScriptedUpstream::failing()));

        let err = companies.create(Company::new("Acme", "acme", "u1")).await.unwrap_err();
        assert!(matches!(err, WriteError::Upstream(UpstreamError::Status { status: 500, .. })));

        let rows = store.query("SELECT id FROM companies", vec![]).await.unwrap();
        assert!(rows.is_empty());
        assert!(companies.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_rollback() {
        let store = store().await;
        seed_items(&store).await;

        let ok = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::default()));
        let patch = json!({"name": "Renamed"}).as_object().cloned().unwrap();
        let item = ok.update("c", patch.clone()).await.unwrap();
        assert_eq!(item.name, "Renamed");
        assert_ne!(item.updated_at, "2024-01-01T00:00:00Z");

        let failing = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::failing()));
        let again = json!({"name": "Broken"}).as_object().cloned().unwrap();
        assert!(failing.update("c", again).await.is_err());
        let row = store
            .query_one("SELECT name FROM space_items WHERE id = 'c'", vec![])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], json!("Renamed"));

        let missing = ok.update("nope", patch).await.unwrap_err();
        assert!(matches!(missing, WriteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_reparents_children_and_restores_on_failure() {
        let store = store().await;
        seed_items(&store).await;

        let failing = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::failing()));
        assert!(failing.delete("folder").await.is_err());
        let children = store
            .query("SELECT id FROM space_items WHERE parent_id = 'folder' ORDER BY id", vec![])
            .await
            .unwrap();
        assert_eq!(children.len(), 2);

        let upstream = Arc::new(ScriptedUpstream::default());
        let ok = writer::<SpaceItem>(&store, upstream.clone());
        ok.delete("folder").await.unwrap();
        let rows = store
            .query("SELECT id, parent_id FROM space_items ORDER BY id", vec![])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r["parent_id"].is_null()));
        assert_eq!(*upstream.calls.lock().unwrap(), vec!["DELETE /api/space-items/folder"]);
    }

    #[tokio::test]
    async fn test_reorder_moves_into_folder() {
        let store = store().await;
        seed_items(&store).await;
        let upstream = Arc::new(ScriptedUpstream::default());
        let items = writer::<SpaceItem>(&store, upstream.clone());

        let plan = items.reorder("c", Some("folder"), 0).await.unwrap();
        assert!(plan.iter().any(|p| p.id == "c" && p.order_index == 0));

        let rows = store
            .query(
                "SELECT id, order_index FROM space_items WHERE parent_id = 'folder' ORDER BY order_index",
                vec![],
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("a"), json!("b")]);
        assert_eq!(
            *upstream.calls.lock().unwrap(),
            vec!["POST /api/spaces/s1/items/reorder"]
        );
    }

    #[tokio::test]
    async fn test_reorder_rollback_restores_positions() {
        let store = store().await;
        seed_items(&store).await;
        let items = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::failing()));

        assert!(items.reorder("b", Some("folder"), 0).await.is_err());
        let rows = store
            .query("SELECT id, order_index FROM space_items WHERE parent_id = 'folder' ORDER BY order_index", vec![])
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_reorder_unsupported_and_invalid() {
        let store = store().await;
        seed_items(&store).await;
        let companies = writer::<Company>(&store, Arc::new(ScriptedUpstream::default()));
        assert!(matches!(
            companies.reorder("x", None, 0).await,
            Err(WriteError::Unsupported(_))
        ));

        let items = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::default()));
        assert!(matches!(
            items.reorder("folder", Some("a"), 0).await,
            Err(WriteError::Reorder(_))
        ));
    }

    #[tokio::test]
    async fn test_create_space_item_gets_server_id() {
        let store = store().await;
        seed_items(&store).await;
        let items = writer::<SpaceItem>(&store, Arc::new(ScriptedUpstream::default()));

        let created = items
            .create(SpaceItem::new("s1", SpaceItemType::Folder, "New"))
            .await
            .unwrap();
        assert_eq!(created.id, "srv-42");
        assert!(!is_temp_id(&created.id));
        assert!(is_temp_id("temp-123"));
    }
}
