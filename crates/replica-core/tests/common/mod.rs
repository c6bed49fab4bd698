//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use replica_core::optimistic::{ManualClock, Placement};
use replica_core::sync::{feed_from_receiver, ChangeFeed, FeedItem, ShapeMessage, ShapeRequest, StreamError, StreamFactory};
use replica_core::{Config, Replica, Row, UpstreamError, Upstream};

/// Feed factory driven by the test: one channel per opened feed
#[derive(Default)]
pub struct FakeStreams {
    opened: AtomicUsize,
    feeds: Mutex<Vec<(ShapeRequest, mpsc::Sender<FeedItem>)>>,
}

impl FakeStreams {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sender of the most recent feed opened for `table`
    pub fn feed(&self, table: &str) -> mpsc::Sender<FeedItem> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(request, _)| request.table == table)
            .map(|(_, tx)| tx.clone())
            .unwrap_or_else(|| panic!("no feed opened for {}", table))
    }

    /// Sender of the most recent feed opened under subscription `key`
    pub fn feed_by_key(&self, key: &str) -> mpsc::Sender<FeedItem> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(request, _)| request.key == key)
            .map(|(_, tx)| tx.clone())
            .unwrap_or_else(|| panic!("no feed opened under key {}", key))
    }

    pub async fn send(&self, table: &str, messages: Vec<ShapeMessage>) {
        let tx = self.feed(table);
        for message in messages {
            tx.send(Ok(message)).await.unwrap();
        }
    }

    pub async fn send_to_key(&self, key: &str, messages: Vec<ShapeMessage>) {
        let tx = self.feed_by_key(key);
        for message in messages {
            tx.send(Ok(message)).await.unwrap();
        }
    }

    pub async fn fail(&self, table: &str, error: StreamError) {
        self.feed(table).send(Err(error)).await.unwrap();
    }
}

impl StreamFactory for FakeStreams {
    fn open(&self, request: ShapeRequest) -> BoxFuture<'static, Result<ChangeFeed, StreamError>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.feeds.lock().unwrap().push((request, tx));
        async move { Ok(feed_from_receiver(rx)) }.boxed()
    }
}

/// Server API that assigns `srv-<n>` ids and can be told to reject
#[derive(Default)]
pub struct FakeUpstream {
    reject: AtomicBool,
    next_id: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeUpstream {
    pub fn starting_at(first_id: usize) -> Self {
        Self {
            next_id: AtomicUsize::new(first_id),
            ..Default::default()
        }
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer<T>(&self, call: String, ok: T) -> Result<T, UpstreamError> {
        self.calls.lock().unwrap().push(call);
        if self.reject.load(Ordering::SeqCst) {
            Err(UpstreamError::Status {
                status: 422,
                message: "rejected".to_string(),
            })
        } else {
            Ok(ok)
        }
    }
}

impl Upstream for FakeUpstream {
    fn create(&self, path: String, mut body: Row) -> BoxFuture<'_, Result<Row, UpstreamError>> {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        body.insert("id".to_string(), json!(id));
        body.entry("created_by".to_string()).or_insert(json!("u1"));
        let result = self.answer(format!("POST {}", path), body);
        async move { result }.boxed()
    }

    fn update(&self, path: String, _patch: Row) -> BoxFuture<'_, Result<Option<Row>, UpstreamError>> {
        let result = self.answer(format!("PATCH {}", path), None);
        async move { result }.boxed()
    }

    fn delete(&self, path: String) -> BoxFuture<'_, Result<(), UpstreamError>> {
        let result = self.answer(format!("DELETE {}", path), ());
        async move { result }.boxed()
    }

    fn reorder(&self, path: String, _placements: Vec<Placement>) -> BoxFuture<'_, Result<(), UpstreamError>> {
        let result = self.answer(format!("POST {}", path), ());
        async move { result }.boxed()
    }
}

/// In-memory replica wired to fakes
pub struct Harness {
    pub replica: Replica,
    pub streams: Arc<FakeStreams>,
    pub upstream: Arc<FakeUpstream>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(FakeUpstream::starting_at(42))
}

pub fn harness_with(upstream: FakeUpstream) -> Harness {
    let streams = Arc::new(FakeStreams::default());
    let upstream = Arc::new(upstream);
    let clock = Arc::new(ManualClock::new());
    let replica = Replica::builder(Config::default())
        .in_memory()
        .streams(streams.clone())
        .upstream(upstream.clone())
        .clock(clock.clone())
        .build();

    Harness {
        replica,
        streams,
        upstream,
        clock,
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

pub fn company(id: &str, name: &str, updated_at: &str) -> Row {
    row(json!({
        "id": id,
        "name": name,
        "slug": id,
        "owner_id": "u1",
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": updated_at
    }))
}

pub fn space_item(id: &str, parent_id: Option<&str>, order_index: i64) -> Row {
    row(json!({
        "id": id,
        "space_id": "s1",
        "parent_id": parent_id,
        "type": if parent_id.is_none() { "folder" } else { "table" },
        "name": id.to_uppercase(),
        "order_index": order_index,
        "created_by": "u1",
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    }))
}

/// HTTP endpoint that accepts connections and never answers
pub async fn silent_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// Poll `check` until it holds, failing after about a second
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Number of rows in `table`
pub async fn count(replica: &Replica, table: &str) -> i64 {
    let store = replica.store().await.unwrap();
    store
        .query_one(format!("SELECT COUNT(*) AS n FROM \"{}\"", table), Vec::new())
        .await
        .unwrap()
        .and_then(|r| r.get("n").and_then(Value::as_i64))
        .unwrap_or(0)
}

pub async fn fetch(replica: &Replica, table: &str, id: &str) -> Option<Row> {
    let store = replica.store().await.unwrap();
    store
        .query_one(format!("SELECT * FROM \"{}\" WHERE id = ?1", table), vec![json!(id)])
        .await
        .unwrap()
}
