//! Optimistic write coordination
//!
//! ## Architecture
//!
//! - **Ledger**: pending local mutations with their targets, kind and age.
//! - **Policy**: recency windows per kind, an injectable clock and the echo
//!   matcher used for creates whose server id is not known yet.
//! - **Writer**: apply locally, submit upstream, then confirm or roll back.
//! - **Reorder**: pure planning of sibling positions.

mod ledger;
mod policy;
mod reorder;
mod writer;

pub use ledger::{PendingGuard, PendingKind, PendingLedger, PendingOperation, Verdict};
pub use policy::{Clock, EchoMatcher, EchoPolicy, FingerprintMatcher, ManualClock, SystemClock};
pub use reorder::{plan_reorder, Placement, ReorderError};
pub use writer::{is_temp_id, OptimisticWriter, TEMP_ID_PREFIX};
