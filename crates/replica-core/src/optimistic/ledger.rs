//! Pending local mutations
//!
//! The writer records every optimistic mutation here before applying it; the
//! replayer asks the ledger whether an incoming feed event is the echo of one
//! of them. Entries are removed by [`PendingGuard`] when the upstream round
//! trip settles, whatever its outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use super::policy::EchoPolicy;
use crate::lock;
use crate::store::{Row, RowKey};
use crate::sync::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    Create,
    Update,
    Delete,
    Reorder,
}

/// A local mutation whose upstream round trip has not settled
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: u64,
    pub table: String,
    pub kind: PendingKind,
    /// Identities of the rows touched locally
    pub targets: Vec<String>,
    /// Submitted field values, used to recognise a create's echo
    pub fingerprint: Row,
    pub created_at: Instant,
}

impl PendingOperation {
    fn targets(&self, key: &RowKey) -> bool {
        let identity = key.identity();
        self.targets.iter().any(|t| *t == identity)
    }
}

/// What the replayer should do with a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Apply,
    /// Already reflected locally by a pending mutation
    Suppress,
}

#[derive(Clone, Default)]
pub struct PendingLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    operations: Mutex<Vec<PendingOperation>>,
    next_id: AtomicU64,
    policy: EchoPolicy,
}

impl std::fmt::Debug for PendingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLedger")
            .field("pending", &self.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl PendingLedger {
    pub fn new(policy: EchoPolicy) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                operations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> &EchoPolicy {
        &self.inner.policy
    }

    /// Record a mutation; it stays pending until the guard is dropped
    pub fn record(
        &self,
        table: &str,
        kind: PendingKind,
        targets: Vec<String>,
        fingerprint: Row,
    ) -> PendingGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let operation = PendingOperation {
            id,
            table: table.to_string(),
            kind,
            targets,
            fingerprint,
            created_at: self.inner.policy.now(),
        };
        debug!(id, table, ?kind, targets = ?operation.targets, "Recorded pending operation");
        lock(&self.inner.operations).push(operation);

        PendingGuard {
            ledger: self.clone(),
            id,
        }
    }

    /// Decide whether a feed event is the echo of a pending mutation
    pub fn classify(&self, table: &str, operation: Operation, key: Option<&RowKey>, row: &Row) -> Verdict {
        let policy = &self.inner.policy;
        let now = policy.now();
        let operations = lock(&self.inner.operations);

        let hit = operations
            .iter()
            .filter(|p| p.table == table && policy.is_fresh(p, now))
            .find(|p| {
                let targeted = key.map(|k| p.targets(k)).unwrap_or(false);
                match (operation, p.kind) {
                    (Operation::Insert, PendingKind::Create) => targeted || policy.matches(p, row),
                    // A locally deleted row must not be resurrected by its own echo
                    (Operation::Update, PendingKind::Update)
                    | (Operation::Update, PendingKind::Reorder)
                    | (Operation::Update, PendingKind::Delete) => targeted,
                    (Operation::Delete, PendingKind::Delete) => targeted,
                    _ => false,
                }
            });

        match hit {
            Some(p) => {
                debug!(pending = p.id, table, ?operation, "Suppressing echo of pending operation");
                Verdict::Suppress
            }
            None => Verdict::Apply,
        }
    }

    /// Snapshot of the pending operations
    pub fn pending(&self) -> Vec<PendingOperation> {
        lock(&self.inner.operations).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.operations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        lock(&self.inner.operations).retain(|p| p.id != id);
    }

    fn add_target(&self, id: u64, target: String) {
        if let Some(p) = lock(&self.inner.operations).iter_mut().find(|p| p.id == id) {
            p.targets.push(target);
        }
    }
}

/// Keeps an operation pending; removes it on drop
#[must_use = "the operation stops being pending when the guard is dropped"]
pub struct PendingGuard {
    ledger: PendingLedger,
    id: u64,
}

impl PendingGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Also shadow events for `target`, e.g. the server-assigned id of a create
    pub fn add_target(&self, target: impl Into<String>) {
        self.ledger.add_target(self.id, target.into());
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.ledger.remove(self.id);
    }
}
