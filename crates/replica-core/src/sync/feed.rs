//! Change feeds
//!
//! A [`StreamFactory`] opens one ordered, at-least-once feed of
//! [`ShapeMessage`]s per subscription key. The production factory speaks
//! WebSocket and keeps the feed alive across disconnects.
//!
//! ## Reconnection
//!
//! The WebSocket pump runs on its own task. When the socket drops it emits a
//! `Disconnected` error into the feed, waits with exponential backoff
//! (1s doubling up to 30s by default) and reconnects from the last offset it
//! saw, so the replayer resumes where it left off. The pump stops as soon as
//! the feed is dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::ShapeMessage;
use crate::config::ReconnectConfig;

/// Errors surfaced on a change feed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Server error: {0}")]
    Server(String),
}

pub type FeedItem = Result<ShapeMessage, StreamError>;

/// Ordered messages for one subscription; ends when the source is exhausted
pub type ChangeFeed = BoxStream<'static, FeedItem>;

/// What a subscription asks the server for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub key: String,
    pub table: String,
    pub where_clause: Option<String>,
    /// Extra query parameters passed through to the server
    pub params: BTreeMap<String, String>,
}

impl ShapeRequest {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            key: table.clone(),
            table,
            where_clause: None,
            params: BTreeMap::new(),
        }
    }
}

/// Opens change feeds
pub trait StreamFactory: Send + Sync {
    fn open(&self, request: ShapeRequest) -> BoxFuture<'static, Result<ChangeFeed, StreamError>>;
}

/// Factory used when no feed endpoint is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStreams;

impl StreamFactory for OfflineStreams {
    fn open(&self, request: ShapeRequest) -> BoxFuture<'static, Result<ChangeFeed, StreamError>> {
        async move {
            Err(StreamError::Connect(format!(
                "no stream_url configured for '{}'",
                request.key
            )))
        }
        .boxed()
    }
}

/// Expose an mpsc receiver as a change feed
pub fn feed_from_receiver(receiver: mpsc::Receiver<FeedItem>) -> ChangeFeed {
    stream::unfold(receiver, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

// ==================== WebSocket feed ====================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the WebSocket feed
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Base URL of the feed endpoint
    pub url: String,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Capacity of the buffer between the socket and the replayer
    pub buffer: usize,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>, reconnect: &ReconnectConfig) -> Self {
        Self {
            url: url.into(),
            initial_reconnect_delay: reconnect.initial_delay(),
            max_reconnect_delay: reconnect.max_delay(),
            buffer: 256,
        }
    }
}

/// Change feeds over WebSocket
#[derive(Debug, Clone)]
pub struct WsStreamFactory {
    config: FeedConfig,
}

impl WsStreamFactory {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

impl StreamFactory for WsStreamFactory {
    fn open(&self, request: ShapeRequest) -> BoxFuture<'static, Result<ChangeFeed, StreamError>> {
        let config = self.config.clone();
        async move {
            let url = feed_url(&config.url, &request, None)?;
            // The first connection is made eagerly so setup failures reach the subscriber
            let (socket, _) = connect_async(url.as_str())
                .await
                .map_err(|e| StreamError::Connect(e.to_string()))?;
            info!(key = %request.key, "Change feed connected");

            let (tx, rx) = mpsc::channel(config.buffer.max(1));
            tokio::spawn(pump(config, request, socket, tx));
            Ok(feed_from_receiver(rx))
        }
        .boxed()
    }
}

/// Build the feed URL for a request, resuming from `offset` when known
pub fn feed_url(
    base: &str,
    request: &ShapeRequest,
    offset: Option<&str>,
) -> Result<reqwest::Url, StreamError> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| StreamError::Connect(format!("invalid stream url '{}': {}", base, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("table", &request.table);
        query.append_pair("offset", offset.unwrap_or("-1"));
        if let Some(clause) = &request.where_clause {
            query.append_pair("where", clause);
        }
        for (name, value) in &request.params {
            query.append_pair(name, value);
        }
    }
    Ok(url)
}

enum Disconnect {
    /// The feed was dropped; stop for good
    ReceiverGone,
    /// The socket went away for this reason
    Closed(String),
}

async fn pump(config: FeedConfig, request: ShapeRequest, first: WsStream, tx: mpsc::Sender<FeedItem>) {
    let mut offset: Option<String> = None;
    let mut reconnect_delay = config.initial_reconnect_delay;
    let mut socket = Some(first);

    loop {
        let ws = match socket.take() {
            Some(ws) => ws,
            None => {
                let connected = match feed_url(&config.url, &request, offset.as_deref()) {
                    Ok(url) => tokio::select! {
                        _ = tx.closed() => return,
                        result = connect_async(url.as_str()) => result.map_err(|e| e.to_string()),
                    },
                    Err(e) => Err(e.to_string()),
                };

                match connected {
                    Ok((ws, _)) => {
                        info!(key = %request.key, offset = offset.as_deref(), "Change feed reconnected");
                        reconnect_delay = config.initial_reconnect_delay;
                        ws
                    }
                    Err(e) => {
                        if tx.send(Err(StreamError::Connect(e))).await.is_err() {
                            return;
                        }
                        if !backoff(&tx, &mut reconnect_delay, config.max_reconnect_delay).await {
                            return;
                        }
                        continue;
                    }
                }
            }
        };

        match forward(ws, &tx, &mut offset).await {
            Disconnect::ReceiverGone => {
                debug!(key = %request.key, "Change feed dropped, stopping pump");
                return;
            }
            Disconnect::Closed(reason) => {
                warn!(key = %request.key, "Change feed disconnected: {}", reason);
                if tx.send(Err(StreamError::Disconnected(reason))).await.is_err() {
                    return;
                }
            }
        }

        if !backoff(&tx, &mut reconnect_delay, config.max_reconnect_delay).await {
            return;
        }
    }
}

/// Sleep for the current delay and double it; false if the feed was dropped meanwhile
async fn backoff(tx: &mpsc::Sender<FeedItem>, delay: &mut Duration, max: Duration) -> bool {
    tokio::select! {
        _ = tx.closed() => return false,
        _ = tokio::time::sleep(*delay) => {}
    }
    *delay = (*delay * 2).min(max);
    true
}

async fn forward(mut ws: WsStream, tx: &mpsc::Sender<FeedItem>, offset: &mut Option<String>) -> Disconnect {
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                ws.close(None).await.ok();
                return Disconnect::ReceiverGone;
            }
            frame = ws.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping non-UTF-8 change-feed frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                return Disconnect::Closed(
                    frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string()),
                );
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Disconnect::Closed(e.to_string()),
            None => return Disconnect::Closed("connection closed".to_string()),
        };

        let messages = match ShapeMessage::decode_batch(&text) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Skipping malformed change-feed frame: {}", e);
                continue;
            }
        };

        for message in messages {
            if let Some(o) = message.offset() {
                *offset = Some(o.to_string());
            }
            if tx.send(Ok(message)).await.is_err() {
                return Disconnect::ReceiverGone;
            }
        }
    }
}
