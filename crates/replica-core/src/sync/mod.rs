//! Replication of server tables into the local store
//!
//! ## Architecture
//!
//! - **Feed**: a `StreamFactory` opens one ordered change feed per
//!   subscription key. The WebSocket factory reconnects with backoff and
//!   resumes from the last offset.
//! - **Registry**: one shared feed per key, single-flight creation and
//!   reference-counted teardown.
//! - **Replayer**: applies feed messages to the store and fans them out to
//!   every registered callback set.
//! - **Callbacks**: per-subscriber closures, each call isolated so a
//!   panicking listener cannot affect the others.

mod callbacks;
mod feed;
mod message;
mod registry;
mod replayer;

pub use callbacks::{RegistrationId, SyncCallbacks};
pub use feed::{
    feed_from_receiver, feed_url, ChangeFeed, FeedConfig, FeedItem, OfflineStreams, ShapeRequest, StreamError,
    StreamFactory, WsStreamFactory,
};
pub use message::{ChangeHeaders, ChangeMessage, Control, Operation, ShapeMessage};
pub use registry::{ShapeOptions, Subscription, SyncRegistry};
