//! Local relational store
//!
//! An embedded SQLite database owned by a dedicated worker thread.
//!
//! ## Architecture
//!
//! - **Worker**: a single OS thread owns the `rusqlite::Connection`; every
//!   operation is a closure sent over a channel and answered on a oneshot.
//! - **Handle**: `LocalStore` is a cheap, cloneable sender, safe to share
//!   across tasks.
//! - **Change notifications**: an SQLite update hook bumps a generation
//!   counter after any committed write, which drives live queries.
//! - **Cell**: `StoreCell` lazily opens the store once per process, with
//!   single-flight initialization and retry after failure.

mod cell;
pub mod error;
mod live;
pub mod table;
pub mod value;

pub use cell::{CellState, StoreCell, StoreInitializer};
pub use error::{StoreError, StoreResult};
pub use live::{LiveQuery, LiveSubscription};
pub use table::RowKey;
pub use value::Row;

use rusqlite::Connection;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

enum Command {
    Run(Job),
    Close(oneshot::Sender<()>),
}

/// Handle to the local store
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    changes: watch::Receiver<u64>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl LocalStore {
    /// Open (or create) a store backed by a database file
    ///
    /// The parent directory must already exist.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::spawn(Some(path.as_ref().to_path_buf())).await
    }

    /// Open a private in-memory store
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::spawn(None).await
    }

    async fn spawn(path: Option<PathBuf>) -> StoreResult<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (change_tx, changes) = watch::channel(0u64);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_path = path.clone();
        std::thread::Builder::new()
            .name("replica-store".to_string())
            .spawn(move || match open_connection(worker_path.as_deref()) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    run_worker(conn, receiver, change_tx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(StoreError::Spawn)?;

        ready_rx.await.map_err(|_| StoreError::WorkerGone)??;

        match &path {
            Some(p) => info!("Opened local store at {:?}", p),
            None => debug!("Opened in-memory local store"),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                changes,
                path,
            }),
        })
    }

    /// Path of the database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Run a closure on the worker thread with exclusive access to the connection
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            let result = f(&mut worker.conn);
            worker.publish();
            let _ = reply.send(result);
        });
        self.inner
            .commands
            .send(Command::Run(job))
            .map_err(|_| StoreError::WorkerGone)?;
        response.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Run a read query and return every row
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> StoreResult<Vec<Row>> {
        let sql = sql.into();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            Ok(value::read_rows(&mut stmt, &params)?)
        })
        .await
    }

    /// Run a read query and return the first row, if any
    pub async fn query_one(&self, sql: impl Into<String>, params: Vec<Value>) -> StoreResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Execute a single statement; returns the number of rows changed
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> StoreResult<usize> {
        let sql = sql.into();
        self.call(move |conn| {
            let bound = value::params(&params);
            Ok(conn.execute(&sql, rusqlite::params_from_iter(bound.iter()))?)
        })
        .await
    }

    /// Execute a batch of statements without parameters
    pub async fn exec(&self, sql: impl Into<String>) -> StoreResult<()> {
        let sql = sql.into();
        self.call(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    /// Run a query now and keep it live against subsequent writes
    pub async fn live_query(&self, sql: impl Into<String>, params: Vec<Value>) -> StoreResult<LiveQuery> {
        let sql = sql.into();
        let initial = self.query(sql.clone(), params.clone()).await?;
        Ok(LiveQuery::new(self.clone(), sql, params, initial))
    }

    /// Receiver that changes whenever a write commits
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.clone()
    }

    /// Stop the worker; later calls on any clone fail with `WorkerGone`
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Close(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

fn open_connection(path: Option<&Path>) -> StoreResult<Connection> {
    let conn = match path {
        Some(path) => {
            let conn = Connection::open(path).map_err(|e| StoreError::from_open(e, path.to_path_buf()))?;
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn
        }
        None => Connection::open_in_memory()?,
    };
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

struct Worker {
    conn: Connection,
    dirty: Arc<AtomicBool>,
    changes: watch::Sender<u64>,
}

impl Worker {
    /// Announce committed writes to live queries
    fn publish(&self) {
        if self.conn.is_autocommit() && self.dirty.swap(false, Ordering::AcqRel) {
            self.changes.send_modify(|generation| *generation += 1);
        }
    }
}

fn run_worker(
    conn: Connection,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    changes: watch::Sender<u64>,
) {
    let dirty = Arc::new(AtomicBool::new(false));
    let hook_flag = Arc::clone(&dirty);
    conn.update_hook(Some(move |_action, _db: &str, _table: &str, _rowid| {
        hook_flag.store(true, Ordering::Release);
    }));

    let mut worker = Worker {
        conn,
        dirty,
        changes,
    };

    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Run(job) => {
                if catch_unwind(AssertUnwindSafe(|| job(&mut worker))).is_err() {
                    error!("Local store job panicked");
                    worker.publish();
                }
            }
            Command::Close(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }

    debug!("Local store worker stopped");
}
