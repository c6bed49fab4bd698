//! Echo-suppression policy
//!
//! Decides how long a pending local mutation shadows incoming feed events and
//! how an insert from the feed is matched to a create whose server identity
//! is not known yet.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::ledger::{PendingKind, PendingOperation};
use crate::config::EchoConfig;
use crate::lock;
use crate::store::Row;

/// Source of "now" for recency windows
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.elapsed) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *lock(&self.elapsed)
    }
}

/// Decides whether a feed row is the echo of a pending create
pub trait EchoMatcher: Send + Sync {
    fn matches(&self, pending: &PendingOperation, row: &Row) -> bool;
}

/// Matches when every fingerprint field equals the row's value
///
/// A field absent from the row counts as null. An empty fingerprint never
/// matches, so a create without user-supplied fields can only be matched by
/// identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintMatcher;

impl EchoMatcher for FingerprintMatcher {
    fn matches(&self, pending: &PendingOperation, row: &Row) -> bool {
        !pending.fingerprint.is_empty()
            && pending
                .fingerprint
                .iter()
                .all(|(k, v)| row.get(k).unwrap_or(&Value::Null) == v)
    }
}

/// Windows, clock and matcher used by the pending ledger
#[derive(Clone)]
pub struct EchoPolicy {
    pub create_window: Duration,
    pub update_window: Duration,
    pub delete_window: Duration,
    pub reorder_window: Duration,
    clock: Arc<dyn Clock>,
    matcher: Arc<dyn EchoMatcher>,
}

impl Default for EchoPolicy {
    fn default() -> Self {
        Self::from_config(&EchoConfig::default())
    }
}

impl std::fmt::Debug for EchoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoPolicy")
            .field("create_window", &self.create_window)
            .field("update_window", &self.update_window)
            .field("delete_window", &self.delete_window)
            .field("reorder_window", &self.reorder_window)
            .finish()
    }
}

impl EchoPolicy {
    pub fn from_config(config: &EchoConfig) -> Self {
        Self {
            create_window: Duration::from_millis(config.create_window_ms),
            update_window: Duration::from_millis(config.update_window_ms),
            delete_window: Duration::from_millis(config.delete_window_ms),
            reorder_window: Duration::from_millis(config.reorder_window_ms),
            clock: Arc::new(SystemClock),
            matcher: Arc::new(FingerprintMatcher),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn EchoMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn window(&self, kind: PendingKind) -> Duration {
        match kind {
            PendingKind::Create => self.create_window,
            PendingKind::Update => self.update_window,
            PendingKind::Delete => self.delete_window,
            PendingKind::Reorder => self.reorder_window,
        }
    }

    /// Whether `pending` still shadows feed events at `now`
    pub fn is_fresh(&self, pending: &PendingOperation, now: Instant) -> bool {
        now.saturating_duration_since(pending.created_at) <= self.window(pending.kind)
    }

    pub fn matches(&self, pending: &PendingOperation, row: &Row) -> bool {
        self.matcher.matches(pending, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn pending(fingerprint: Value) -> PendingOperation {
        PendingOperation {
            id: 1,
            table: "companies".to_string(),
            kind: PendingKind::Create,
            targets: vec!["temp-1".to_string()],
            fingerprint: fingerprint.as_object().cloned().unwrap(),
            created_at: Instant::now(),
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_matches_superset_row() {
        let op = pending(json!({"name": "Acme", "slug": "acme"}));
        let echo = row(json!({"id": "srv-42", "name": "Acme", "slug": "acme", "created_at": "now"}));
        assert!(FingerprintMatcher.matches(&op, &echo));

        let other = row(json!({"id": "srv-43", "name": "Acme", "slug": "acme-2"}));
        assert!(!FingerprintMatcher.matches(&op, &other));
    }

    #[test]
    fn test_missing_field_counts_as_null() {
        let op = pending(json!({"name": "Acme", "description": null}));
        assert!(FingerprintMatcher.matches(&op, &row(json!({"name": "Acme"}))));
    }

    #[test]
    fn test_empty_fingerprint_never_matches() {
        let op = pending(json!({}));
        assert!(!FingerprintMatcher.matches(&op, &row(json!({"name": "x"}))));
    }

    #[test]
    fn test_windows_follow_config_and_clock() {
        let clock = Arc::new(ManualClock::new());
        let policy = EchoPolicy::default().with_clock(clock.clone());
        let mut op = pending(json!({"name": "x"}));
        op.created_at = policy.now();

        assert_eq!(policy.window(PendingKind::Create), Duration::from_secs(5));
        assert_eq!(policy.window(PendingKind::Reorder), Duration::from_secs(15));

        clock.advance(Duration::from_secs(5));
        assert!(policy.is_fresh(&op, policy.now()));
        clock.advance(Duration::from_millis(1));
        assert!(!policy.is_fresh(&op, policy.now()));

        op.kind = PendingKind::Update;
        assert!(policy.is_fresh(&op, policy.now()));
    }

    proptest! {
        /// The echo of a create carries the submitted fields plus whatever the
        /// server adds; it must match. Changing any submitted field must not.
        #[test]
        fn prop_echo_matches_only_its_own_create(
            fields in proptest::collection::btree_map("f_[a-z]{1,5}", "[a-zA-Z0-9 ]{0,8}", 1..5),
            server_id in "[a-f0-9]{8}",
            tweak in any::<prop::sample::Index>(),
        ) {
            let fingerprint: Row = fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let op = PendingOperation {
                id: 1,
                table: "t".to_string(),
                kind: PendingKind::Create,
                targets: vec!["temp-x".to_string()],
                fingerprint: fingerprint.clone(),
                created_at: Instant::now(),
            };

            let mut echo = fingerprint.clone();
            echo.insert("id".to_string(), Value::String(server_id));
            echo.insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
            prop_assert!(FingerprintMatcher.matches(&op, &echo));

            let keys: Vec<String> = fields.keys().cloned().collect();
            let changed = &keys[tweak.index(keys.len())];
            let mut different = echo.clone();
            let original = fields[changed].clone();
            different.insert(changed.clone(), Value::String(format!("{}!", original)));
            prop_assert!(!FingerprintMatcher.matches(&op, &different));
        }
    }
}
