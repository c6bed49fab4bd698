//! Lazily initialized, process-wide store
//!
//! `StoreCell::get` opens the store and materializes the schema exactly once,
//! however many callers race for it. While initialization is in flight every
//! caller awaits the same shared future; once it settles all of them observe
//! the same outcome. A failed attempt is not cached: the next `get` starts a
//! fresh one.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::LocalStore;
use crate::error::SyncError;
use crate::lock;

type SharedInit = Shared<BoxFuture<'static, Result<LocalStore, Arc<SyncError>>>>;

/// Produces a fresh initialization attempt
pub type StoreInitializer =
    Arc<dyn Fn() -> BoxFuture<'static, Result<LocalStore, SyncError>> + Send + Sync>;

/// Observable state of a [`StoreCell`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

enum State {
    Uninitialized,
    Initializing { attempt: u64, init: SharedInit },
    Ready(LocalStore),
    Failed(Arc<SyncError>),
}

pub struct StoreCell {
    state: Mutex<State>,
    attempts: AtomicU64,
    initializer: StoreInitializer,
}

impl StoreCell {
    pub fn new(initializer: StoreInitializer) -> Self {
        Self {
            state: Mutex::new(State::Uninitialized),
            attempts: AtomicU64::new(0),
            initializer,
        }
    }

    /// Build a cell from an async closure
    pub fn with_initializer<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<LocalStore, SyncError>> + Send + 'static,
    {
        Self::new(Arc::new(move || f().boxed()))
    }

    /// Get the store, initializing it if needed
    pub async fn get(&self) -> Result<LocalStore, SyncError> {
        let (attempt, init) = {
            let mut state = lock(&self.state);
            let in_flight = match &*state {
                State::Ready(store) => return Ok(store.clone()),
                State::Initializing { attempt, init } => Some((*attempt, init.clone())),
                State::Uninitialized | State::Failed(_) => None,
            };

            match in_flight {
                Some(joined) => joined,
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(attempt, "Initializing local store");
                    let init = (self.initializer)()
                        .map(|result| result.map_err(Arc::new))
                        .boxed()
                        .shared();
                    *state = State::Initializing {
                        attempt,
                        init: init.clone(),
                    };
                    (attempt, init)
                }
            }
        };

        let result = init.await;
        self.settle(attempt, &result);
        result.map_err(SyncError::Initialization)
    }

    /// Record the outcome of `attempt` unless the cell has moved on
    fn settle(&self, attempt: u64, result: &Result<LocalStore, Arc<SyncError>>) {
        let mut state = lock(&self.state);
        let current = matches!(&*state, State::Initializing { attempt: a, .. } if *a == attempt);
        if !current {
            return;
        }

        *state = match result {
            Ok(store) => {
                info!(attempt, "Local store ready");
                State::Ready(store.clone())
            }
            Err(e) => {
                warn!(attempt, "Local store initialization failed: {}", e);
                State::Failed(Arc::clone(e))
            }
        };
    }

    /// Forget the current store; the next `get` initializes again
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        if !matches!(&*state, State::Uninitialized) {
            debug!("Resetting local store cell");
        }
        *state = State::Uninitialized;
    }

    pub fn state(&self) -> CellState {
        match &*lock(&self.state) {
            State::Uninitialized => CellState::Uninitialized,
            State::Initializing { .. } => CellState::Initializing,
            State::Ready(_) => CellState::Ready,
            State::Failed(_) => CellState::Failed,
        }
    }

    /// Error from the most recent failed attempt
    pub fn last_error(&self) -> Option<Arc<SyncError>> {
        match &*lock(&self.state) {
            State::Failed(e) => Some(Arc::clone(e)),
            _ => None,
        }
    }

    /// Number of initialization attempts started so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StoreCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCell")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_cell(fail_first: usize) -> (Arc<StoreCell>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cell = StoreCell::with_initializer(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if call < fail_first {
                    Err(SyncError::Store(StoreError::WorkerGone))
                } else {
                    Ok(LocalStore::open_in_memory().await?)
                }
            }
        });
        (Arc::new(cell), calls)
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_initialization() {
        let (cell, calls) = counting_cell(0);

        let (a, b, c) = tokio::join!(cell.get(), cell.get(), cell.get());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.state(), CellState::Ready);

        // All callers hold the same store
        a.exec("CREATE TABLE shared (id TEXT)").await.unwrap();
        assert!(b.query("SELECT * FROM shared", vec![]).await.is_ok());
        assert!(c.query("SELECT * FROM shared", vec![]).await.is_ok());

        cell.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_retried() {
        let (cell, calls) = counting_cell(1);

        let (a, b) = tokio::join!(cell.get(), cell.get());
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.state(), CellState::Failed);
        assert!(cell.last_error().is_some());

        let err = a.unwrap_err();
        assert!(matches!(err.root(), SyncError::Store(StoreError::WorkerGone)));

        cell.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.state(), CellState::Ready);
        assert!(cell.last_error().is_none());
    }

    #[tokio::test]
    async fn test_reset_forces_reinitialization() {
        let (cell, calls) = counting_cell(0);

        cell.get().await.unwrap();
        cell.reset();
        assert_eq!(cell.state(), CellState::Uninitialized);

        cell.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.attempts(), 2);
    }

    #[tokio::test]
    async fn test_reset_during_initialization_discards_stale_result() {
        let (cell, calls) = counting_cell(0);

        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.get().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cell.reset();

        // The in-flight caller still gets its store, but the cell does not keep it
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(cell.state(), CellState::Uninitialized);

        cell.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
