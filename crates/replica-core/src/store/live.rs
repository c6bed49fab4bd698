//! Live queries
//!
//! A live query carries its initial result and can be subscribed to. Each
//! committed write re-runs the query; subscribers hear about it only when the
//! result actually differs from what they last saw.

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use super::value::Row;
use super::LocalStore;

/// Query result that tracks subsequent writes
pub struct LiveQuery {
    store: LocalStore,
    sql: String,
    params: Vec<Value>,
    initial: Vec<Row>,
}

impl LiveQuery {
    pub(super) fn new(store: LocalStore, sql: String, params: Vec<Value>, initial: Vec<Row>) -> Self {
        Self {
            store,
            sql,
            params,
            initial,
        }
    }

    /// Result at the time the live query was created
    pub fn initial_data(&self) -> &[Row] {
        &self.initial
    }

    /// Invoke `callback` with the new result whenever it changes
    pub fn subscribe<F>(&self, callback: F) -> LiveSubscription
    where
        F: Fn(&[Row]) + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let sql = self.sql.clone();
        let params = self.params.clone();
        let mut last = self.initial.clone();
        let mut changes = store.changes();
        changes.borrow_and_update();

        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                match store.query(sql.clone(), params.clone()).await {
                    Ok(rows) if rows != last => {
                        callback(&rows);
                        last = rows;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Live query failed to refresh: {}", e);
                    }
                }
            }
        });

        LiveSubscription { task }
    }
}

/// Handle returned by [`LiveQuery::subscribe`]; dropping it stops delivery
pub struct LiveSubscription {
    task: JoinHandle<()>,
}

impl LiveSubscription {
    pub fn unsubscribe(&self) {
        self.task.abort();
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_live_query_notifies_on_change() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .exec("CREATE TABLE spaces (id TEXT PRIMARY KEY, name TEXT)")
            .await
            .unwrap();

        let live = store
            .live_query("SELECT * FROM spaces ORDER BY name", vec![])
            .await
            .unwrap();
        assert!(live.initial_data().is_empty());

        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _sub = live.subscribe(move |rows| sink.lock().unwrap().push(rows.len()));

        store
            .execute("INSERT INTO spaces VALUES (?1, ?2)", vec![json!("s1"), json!("Design")])
            .await
            .unwrap();

        assert!(wait_for(|| seen.lock().unwrap().as_slice() == [1]).await);
    }

    #[tokio::test]
    async fn test_live_query_ignores_unrelated_writes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .exec("CREATE TABLE a (id TEXT); CREATE TABLE b (id TEXT);")
            .await
            .unwrap();

        let live = store.live_query("SELECT * FROM a", vec![]).await.unwrap();
        let calls: Arc<Mutex<u32>> = Arc::default();
        let counter = Arc::clone(&calls);
        let _sub = live.subscribe(move |_| *counter.lock().unwrap() += 1);

        store.execute("INSERT INTO b VALUES ('x')", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock().unwrap(), 0);

        store.execute("INSERT INTO a VALUES ('y')", vec![]).await.unwrap();
        assert!(wait_for(|| *calls.lock().unwrap() == 1).await);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.exec("CREATE TABLE a (id TEXT)").await.unwrap();

        let live = store.live_query("SELECT * FROM a", vec![]).await.unwrap();
        let calls: Arc<Mutex<u32>> = Arc::default();
        let counter = Arc::clone(&calls);
        let sub = live.subscribe(move |_| *counter.lock().unwrap() += 1);
        sub.unsubscribe();

        store.execute("INSERT INTO a VALUES ('y')", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
