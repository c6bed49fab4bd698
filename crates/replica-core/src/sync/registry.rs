//! Subscription registry
//!
//! Maps each subscription key to exactly one shared change feed, however many
//! callers subscribe to it.
//!
//! ## Lifecycle
//!
//! - The first `subscribe` for a key starts a creation: get the store, check
//!   the table, open the feed, then store the entry and start the replayer.
//! - Subscribers arriving while that creation is in flight join it instead
//!   of opening a second feed. The in-flight slot is cleared when creation
//!   settles, so a failed creation is retried by the next `subscribe`.
//! - Each caller holds a [`Subscription`]. When the last one for a key is
//!   released the feed is torn down, exactly once.
//! - `unsubscribe_all` tears down every key; creations still in flight at
//!   that moment are cancelled when they settle.

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::callbacks::{Registration, RegistrationId, SyncCallbacks};
use super::feed::{ChangeFeed, ShapeRequest, StreamFactory};
use super::replayer::{PreparedChange, Replayer};
use crate::error::SyncError;
use crate::lock;
use crate::optimistic::PendingLedger;
use crate::schema::ensure_table;
use crate::store::{LocalStore, StoreCell};

/// Process-wide record of the most recent shared failure
pub(crate) type ErrorSlot = Arc<Mutex<Option<Arc<SyncError>>>>;

type Creation = Shared<BoxFuture<'static, Result<Arc<SharedStream>, Arc<SyncError>>>>;

/// What to subscribe to and who to tell
#[derive(Debug)]
pub struct ShapeOptions {
    pub table: String,
    /// Defaults to the table name
    pub key: Option<String>,
    pub primary_key: Vec<String>,
    pub where_clause: Option<String>,
    pub callbacks: SyncCallbacks,
}

impl ShapeOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: None,
            primary_key: vec!["id".to_string()],
            where_clause: None,
            callbacks: SyncCallbacks::default(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    pub fn callbacks(mut self, callbacks: SyncCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Effective subscription key
    pub fn resolved_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.table)
    }
}

// ==================== Shared stream ====================

/// One live change feed and everyone listening to it
pub(crate) struct SharedStream {
    pub(crate) key: String,
    pub(crate) table: String,
    /// Server-side row filter; bounds which local rows this key owns
    pub(crate) where_clause: Option<String>,
    pub(crate) primary_key: Vec<String>,
    pub(crate) columns: Vec<String>,
    pub(crate) store: LocalStore,
    /// Changes waiting for a parent row not replayed yet
    pub(crate) parked: Mutex<Vec<PreparedChange>>,
    listeners: Mutex<Listeners>,
    task: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

#[derive(Default)]
struct Listeners {
    registrations: Vec<Arc<Registration>>,
    up_to_date: bool,
}

impl SharedStream {
    pub(crate) fn new(
        key: String,
        table: String,
        where_clause: Option<String>,
        primary_key: Vec<String>,
        columns: Vec<String>,
        store: LocalStore,
    ) -> Self {
        Self {
            key,
            table,
            where_clause,
            primary_key,
            columns,
            store,
            parked: Mutex::new(Vec::new()),
            listeners: Mutex::new(Listeners::default()),
            task: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Snapshot in registration order
    pub(crate) fn registrations(&self) -> Vec<Arc<Registration>> {
        lock(&self.listeners).registrations.clone()
    }

    /// Add a listener; returns whether the backfill already completed
    pub(crate) fn register(&self, registration: Arc<Registration>) -> bool {
        let mut listeners = lock(&self.listeners);
        listeners.registrations.push(registration);
        listeners.up_to_date
    }

    /// Remove a listener; `Some(remaining)` if it was registered here
    fn unregister(&self, id: RegistrationId) -> Option<usize> {
        let mut listeners = lock(&self.listeners);
        let before = listeners.registrations.len();
        listeners.registrations.retain(|r| r.id != id);
        (listeners.registrations.len() < before).then_some(listeners.registrations.len())
    }

    fn listener_count(&self) -> usize {
        lock(&self.listeners).registrations.len()
    }

    /// Flip the backfill flag; returns the listeners to notify the first time
    pub(crate) fn mark_up_to_date(&self) -> Option<Vec<Arc<Registration>>> {
        let mut listeners = lock(&self.listeners);
        if listeners.up_to_date {
            return None;
        }
        listeners.up_to_date = true;
        Some(listeners.registrations.clone())
    }

    pub(crate) fn is_up_to_date(&self) -> bool {
        lock(&self.listeners).up_to_date
    }

    fn start(&self, task: JoinHandle<()>) {
        *lock(&self.task) = Some(task);
    }

    /// Stop the replayer and drop the feed; only the first call does anything
    fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        info!(key = %self.key, "Change feed torn down");
        true
    }
}

// ==================== Registry ====================

/// Shared change feeds keyed by subscription key
#[derive(Clone)]
pub struct SyncRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<StoreCell>,
    streams: Arc<dyn StreamFactory>,
    ledger: PendingLedger,
    state: Mutex<RegistryState>,
    errors: ErrorSlot,
    next_registration: AtomicU64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Arc<SharedStream>>,
    in_flight: HashMap<String, InFlight>,
    /// Bumped by `unsubscribe_all`; creations from an older epoch are cancelled
    epoch: u64,
}

struct InFlight {
    epoch: u64,
    creation: Creation,
    /// Registrations to attach when the creation succeeds
    waiting: Vec<Arc<Registration>>,
}

impl std::fmt::Debug for SyncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegistry")
            .field("keys", &self.subscribed_keys())
            .finish()
    }
}

impl SyncRegistry {
    pub fn new(store: Arc<StoreCell>, streams: Arc<dyn StreamFactory>, ledger: PendingLedger) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                streams,
                ledger,
                state: Mutex::new(RegistryState::default()),
                errors: Arc::new(Mutex::new(None)),
                next_registration: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to a shape, sharing the feed with other subscribers of the key
    pub async fn subscribe(&self, options: ShapeOptions) -> Result<Subscription, SyncError> {
        if options.table.is_empty() {
            return Err(SyncError::InvalidOptions("table name is empty".to_string()));
        }
        if options.primary_key.is_empty() {
            return Err(SyncError::InvalidOptions(format!(
                "no primary key columns for '{}'",
                options.table
            )));
        }

        let key = options.resolved_key().to_string();
        let id = RegistrationId(self.inner.next_registration.fetch_add(1, Ordering::Relaxed) + 1);
        let registration = Arc::new(Registration::new(id, options.callbacks));
        // Dropping the handle before setup finishes releases the registration
        let subscription = Subscription {
            key: key.clone(),
            registration: Arc::clone(&registration),
            registry: Arc::downgrade(&self.inner),
            done: AtomicBool::new(false),
        };

        let creation = {
            let mut state = lock(&self.inner.state);

            if let Some(entry) = state.entries.get(&key).cloned() {
                if entry.table != options.table {
                    subscription.done.store(true, Ordering::Release);
                    return Err(SyncError::InvalidOptions(format!(
                        "key '{}' is already bound to table '{}'",
                        key, entry.table
                    )));
                }
                let ready = entry.register(Arc::clone(&registration));
                debug!(key = %key, registration = %id, listeners = entry.listener_count(), "Joined existing change feed");
                drop(state);
                if ready {
                    // Late subscriber: the backfill signal already went out
                    let late = Arc::clone(&registration);
                    tokio::spawn(async move { late.up_to_date() });
                }
                return Ok(subscription);
            }

            let epoch = state.epoch;
            match state.in_flight.get_mut(&key) {
                Some(in_flight) => {
                    debug!(key = %key, registration = %id, "Joining in-flight subscription setup");
                    in_flight.waiting.push(Arc::clone(&registration));
                    in_flight.creation.clone()
                }
                None => {
                    let request = ShapeRequest {
                        key: key.clone(),
                        table: options.table.clone(),
                        where_clause: options.where_clause.clone(),
                        params: Default::default(),
                    };
                    let creation = create(Arc::clone(&self.inner), request, options.primary_key, epoch)
                        .boxed()
                        .shared();
                    state.in_flight.insert(
                        key.clone(),
                        InFlight {
                            epoch,
                            creation: creation.clone(),
                            waiting: vec![Arc::clone(&registration)],
                        },
                    );
                    creation
                }
            }
        };

        match creation.await {
            Ok(_) => Ok(subscription),
            Err(e) => {
                subscription.done.store(true, Ordering::Release);
                registration.error(&e);
                registration.deactivate();
                Err(SyncError::Initialization(e))
            }
        }
    }

    /// Subscribe to several shapes; failures are logged and skipped
    pub async fn subscribe_many(&self, shapes: Vec<ShapeOptions>) -> Vec<Subscription> {
        let attempts = shapes.into_iter().map(|options| {
            let key = options.resolved_key().to_string();
            async move { (key, self.subscribe(options).await) }
        });

        join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    warn!(key = %key, "Skipping subscription: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Tear down every live feed, e.g. on logout
    pub fn unsubscribe_all(&self) {
        let entries: Vec<Arc<SharedStream>> = {
            let mut state = lock(&self.inner.state);
            state.epoch += 1;
            state.in_flight.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            for registration in entry.registrations() {
                registration.deactivate();
            }
            entry.teardown();
        }
        info!(count = entries.len(), "Unsubscribed from all change feeds");
    }

    pub fn has_subscription(&self, key: &str) -> bool {
        lock(&self.inner.state).entries.contains_key(key)
    }

    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.state).entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscribed_tables(&self) -> Vec<String> {
        lock(&self.inner.state)
            .entries
            .values()
            .map(|e| e.table.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_table_subscribed(&self, table: &str) -> bool {
        lock(&self.inner.state).entries.values().any(|e| e.table == table)
    }

    /// Whether the feed for `key` has finished its initial backfill
    pub fn is_up_to_date(&self, key: &str) -> bool {
        lock(&self.inner.state)
            .entries
            .get(key)
            .map_or(false, |e| e.is_up_to_date())
    }

    /// Number of subscribers sharing the feed for `key`
    pub fn listener_count(&self, key: &str) -> usize {
        lock(&self.inner.state)
            .entries
            .get(key)
            .map_or(0, |e| e.listener_count())
    }

    /// Most recent shared failure (feed error or setup failure)
    pub fn last_error(&self) -> Option<Arc<SyncError>> {
        lock(&self.inner.errors).clone()
    }

    pub fn clear_error(&self) {
        lock(&self.inner.errors).take();
    }
}

impl RegistryInner {
    fn release(&self, key: &str, id: RegistrationId) {
        let emptied = {
            let mut state = lock(&self.state);
            if let Some(in_flight) = state.in_flight.get_mut(key) {
                in_flight.waiting.retain(|r| r.id != id);
            }
            match state.entries.get(key).and_then(|e| e.unregister(id)) {
                Some(0) => state.entries.remove(key),
                _ => None,
            }
        };

        if let Some(entry) = emptied {
            debug!(key, "Last subscriber left");
            entry.teardown();
        }
    }
}

async fn create(
    inner: Arc<RegistryInner>,
    request: ShapeRequest,
    primary_key: Vec<String>,
    epoch: u64,
) -> Result<Arc<SharedStream>, Arc<SyncError>> {
    let key = request.key.clone();
    let opened = open(&inner, request, primary_key).await;

    let mut state = lock(&inner.state);
    let current = state.in_flight.get(&key).map_or(false, |f| f.epoch == epoch);
    let waiting = if current {
        state.in_flight.remove(&key).map(|f| f.waiting).unwrap_or_default()
    } else {
        Vec::new()
    };

    let (entry, feed) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            drop(state);
            warn!(key = %key, "Subscription setup failed: {}", e);
            let e = Arc::new(e);
            *lock(&inner.errors) = Some(Arc::clone(&e));
            return Err(e);
        }
    };

    if state.epoch != epoch || waiting.is_empty() {
        drop(state);
        debug!(key = %key, "Subscription setup cancelled");
        entry.teardown();
        return Err(Arc::new(SyncError::Cancelled(key)));
    }

    for registration in waiting {
        entry.register(registration);
    }
    // Stored before the first message is consumed
    state.entries.insert(key.clone(), Arc::clone(&entry));
    let replayer = Replayer::new(Arc::clone(&entry), inner.ledger.clone(), Arc::clone(&inner.errors));
    entry.start(tokio::spawn(replayer.run(feed)));
    drop(state);

    info!(key = %key, table = %entry.table, "Subscribed to change feed");
    Ok(entry)
}

async fn open(
    inner: &RegistryInner,
    request: ShapeRequest,
    primary_key: Vec<String>,
) -> Result<(Arc<SharedStream>, ChangeFeed), SyncError> {
    let store = inner.store.get().await?;
    let columns = ensure_table(&store, &request.table).await?;
    if let Some(missing) = primary_key.iter().find(|c| !columns.contains(c)) {
        return Err(SyncError::InvalidOptions(format!(
            "primary key column '{}' is not in table '{}'",
            missing, request.table
        )));
    }

    let key = request.key.clone();
    let table = request.table.clone();
    let where_clause = request.where_clause.clone();
    let feed = inner
        .streams
        .open(request)
        .await
        .map_err(|e| SyncError::Connect {
            key: key.clone(),
            message: e.to_string(),
        })?;

    let entry = SharedStream::new(key, table, where_clause, primary_key, columns, store);
    Ok((Arc::new(entry), feed))
}

// ==================== Subscription handle ====================

/// A caller's hold on a shared change feed
///
/// Unsubscribing is idempotent; dropping the handle unsubscribes.
pub struct Subscription {
    key: String,
    registration: Arc<Registration>,
    registry: Weak<RegistryInner>,
    done: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> RegistrationId {
        self.registration.id
    }

    /// Panics caught in this subscriber's callbacks
    pub fn callback_panics(&self) -> u64 {
        self.registration.panics()
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire) && self.registration.is_active()
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registration.deactivate();
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, self.registration.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.registration.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
