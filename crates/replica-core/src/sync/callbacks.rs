//! Subscriber callbacks
//!
//! Each `subscribe` call registers one [`SyncCallbacks`] set. Delivery to a
//! registration is isolated: a panicking callback is caught, logged and
//! counted, and the next registration still receives the event.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{error, warn};

use crate::error::SyncError;
use crate::store::{Row, RowKey};

type InsertFn = Box<dyn Fn(&Row) + Send + Sync>;
type UpdateFn = Box<dyn Fn(&Row, Option<&Row>) + Send + Sync>;
type DeleteFn = Box<dyn Fn(&RowKey) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&SyncError) + Send + Sync>;
type ReadyFn = Box<dyn Fn() + Send + Sync>;

/// Event handlers for one subscriber; every handler is optional
#[derive(Default)]
pub struct SyncCallbacks {
    on_insert: Option<InsertFn>,
    on_update: Option<UpdateFn>,
    on_delete: Option<DeleteFn>,
    on_error: Option<ErrorFn>,
    on_up_to_date: Option<ReadyFn>,
}

impl SyncCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, f: impl Fn(&Row) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Box::new(f));
        self
    }

    /// Receives the new row and, when it was stored locally, the previous one
    pub fn on_update(mut self, f: impl Fn(&Row, Option<&Row>) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&RowKey) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called once the initial backfill has been replayed
    pub fn on_up_to_date(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_up_to_date = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SyncCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCallbacks")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_up_to_date", &self.on_up_to_date.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Unique id of a callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// A callback set attached to a shared stream
pub(crate) struct Registration {
    pub(crate) id: RegistrationId,
    callbacks: SyncCallbacks,
    active: AtomicBool,
    panics: AtomicU64,
}

impl Registration {
    pub(crate) fn new(id: RegistrationId, callbacks: SyncCallbacks) -> Self {
        Self {
            id,
            callbacks,
            active: AtomicBool::new(true),
            panics: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery; returns whether it was active before
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, row: &Row) {
        if let Some(f) = &self.callbacks.on_insert {
            self.guard("insert", || f(row));
        }
    }

    pub(crate) fn update(&self, row: &Row, previous: Option<&Row>) {
        if let Some(f) = &self.callbacks.on_update {
            self.guard("update", || f(row, previous));
        }
    }

    pub(crate) fn delete(&self, key: &RowKey) {
        if let Some(f) = &self.callbacks.on_delete {
            self.guard("delete", || f(key));
        }
    }

    pub(crate) fn error(&self, err: &SyncError) {
        match &self.callbacks.on_error {
            Some(f) => self.guard("error", || f(err)),
            None => warn!(registration = %self.id, "Unhandled sync error: {}", err),
        }
    }

    pub(crate) fn up_to_date(&self) {
        if let Some(f) = &self.callbacks.on_up_to_date {
            self.guard("up-to-date", || f());
        }
    }

    fn guard(&self, event: &str, f: impl FnOnce()) {
        if !self.is_active() {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            self.panics.fetch_add(1, Ordering::Relaxed);
            error!(
                registration = %self.id,
                event,
                "Sync callback panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispatch_reaches_configured_handlers() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let (a, b, c, d) = (seen.clone(), seen.clone(), seen.clone(), seen.clone());
        let callbacks = SyncCallbacks::new()
            .on_insert(move |row| a.lock().unwrap().push(format!("insert {}", row["id"])))
            .on_update(move |_, prev| b.lock().unwrap().push(format!("update {}", prev.is_some())))
            .on_delete(move |key| c.lock().unwrap().push(format!("delete {}", key)))
            .on_up_to_date(move || d.lock().unwrap().push("ready".to_string()));
        let reg = Registration::new(RegistrationId(1), callbacks);

        let row = json!({"id": "r1"}).as_object().cloned().unwrap();
        reg.insert(&row);
        reg.update(&row, Some(&row));
        reg.delete(&RowKey::id("r1"));
        reg.up_to_date();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["insert \"r1\"", "update true", "delete r1", "ready"]
        );
    }

    #[test]
    fn test_panics_are_contained_and_counted() {
        let reg = Registration::new(
            RegistrationId(7),
            SyncCallbacks::new().on_insert(|_| panic!("handler bug")),
        );

        reg.insert(&Row::new());
        reg.insert(&Row::new());
        assert_eq!(reg.panics(), 2);
    }

    #[test]
    fn test_inactive_registration_receives_nothing() {
        let calls: Arc<Mutex<u32>> = Arc::default();
        let counter = calls.clone();
        let reg = Registration::new(
            RegistrationId(2),
            SyncCallbacks::new().on_up_to_date(move || *counter.lock().unwrap() += 1),
        );

        assert!(reg.deactivate());
        assert!(!reg.deactivate());
        reg.up_to_date();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_missing_handlers_are_fine() {
        let reg = Registration::new(RegistrationId(3), SyncCallbacks::default());
        reg.insert(&Row::new());
        reg.error(&SyncError::Cancelled("k".to_string()));
        assert_eq!(reg.panics(), 0);
        assert_eq!(RegistrationId(3).to_string(), "reg-3");
    }
}
