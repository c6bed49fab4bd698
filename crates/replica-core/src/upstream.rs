//! Upstream API client
//!
//! The server owns authoritative data. Optimistic writes are submitted
//! through the [`Upstream`] trait; [`HttpUpstream`] is the production
//! implementation over `reqwest` and also serves the migration manifest.

use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{MigrationError, UpstreamError};
use crate::optimistic::Placement;
use crate::schema::{Manifest, Migration, MigrationSource};
use crate::store::Row;

/// Write endpoints of the server API
pub trait Upstream: Send + Sync {
    /// POST a new row; returns the stored row with its final identity
    fn create(&self, path: String, body: Row) -> BoxFuture<'_, Result<Row, UpstreamError>>;

    /// PATCH a row; returns the stored row when the server sends one back
    fn update(&self, path: String, patch: Row) -> BoxFuture<'_, Result<Option<Row>, UpstreamError>>;

    fn delete(&self, path: String) -> BoxFuture<'_, Result<(), UpstreamError>>;

    fn reorder(&self, path: String, placements: Vec<Placement>) -> BoxFuture<'_, Result<(), UpstreamError>>;
}

/// Upstream used when no API URL is configured; every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

impl Upstream for Unconfigured {
    fn create(&self, _path: String, _body: Row) -> BoxFuture<'_, Result<Row, UpstreamError>> {
        async { Err(UpstreamError::NotConfigured) }.boxed()
    }

    fn update(&self, _path: String, _patch: Row) -> BoxFuture<'_, Result<Option<Row>, UpstreamError>> {
        async { Err(UpstreamError::NotConfigured) }.boxed()
    }

    fn delete(&self, _path: String) -> BoxFuture<'_, Result<(), UpstreamError>> {
        async { Err(UpstreamError::NotConfigured) }.boxed()
    }

    fn reorder(&self, _path: String, _placements: Vec<Placement>) -> BoxFuture<'_, Result<(), UpstreamError>> {
        async { Err(UpstreamError::NotConfigured) }.boxed()
    }
}

/// JSON-over-HTTP client for the server API
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct MigrationList {
    migrations: Vec<MigrationMeta>,
}

#[derive(Deserialize)]
struct MigrationMeta {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    checksum: String,
}

#[derive(Deserialize)]
struct MigrationBody {
    sql: String,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Use a preconfigured client, e.g. one carrying session cookies
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: UpstreamConfig::default().timeout(),
        }
    }

    /// Upper bound on a whole request, response body included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Request(e)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response, UpstreamError> {
        debug!(%method, path, "Upstream request");
        let mut request = self.client.request(method, self.url(path)).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(UpstreamError::Status {
            status: status.as_u16(),
            message: error_message(&text).unwrap_or_else(|| status.to_string()),
        })
    }

    /// Parse a response body that may be empty
    async fn json_body(&self, response: Response) -> Result<Option<Value>, UpstreamError> {
        let text = response.text().await.map_err(|e| self.request_error(e))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }

    async fn fetch_manifest(&self) -> Result<Manifest, MigrationError> {
        let response = self.send(Method::GET, "/api/pglite/migrations", None).await?;
        let list: MigrationList = response.json().await.map_err(|e| self.request_error(e))?;

        let mut migrations = Vec::with_capacity(list.migrations.len());
        for meta in list.migrations {
            let path = format!("/api/pglite/migrations/{}", meta.name);
            let body: MigrationBody = self
                .send(Method::GET, &path, None)
                .await?
                .json()
                .await
                .map_err(|e| self.request_error(e))?;
            migrations.push(Migration {
                name: meta.name,
                description: meta.description,
                checksum: meta.checksum,
                sql: body.sql,
            });
        }

        Manifest::new(migrations)
    }
}

impl Upstream for HttpUpstream {
    fn create(&self, path: String, body: Row) -> BoxFuture<'_, Result<Row, UpstreamError>> {
        async move {
            let response = self.send(Method::POST, &path, Some(Value::Object(body))).await?;
            match self.json_body(response).await? {
                Some(value) => into_row(value).ok_or_else(|| {
                    UpstreamError::InvalidResponse(format!("{} did not return an object", path))
                }),
                None => Err(UpstreamError::InvalidResponse(format!("{} returned an empty body", path))),
            }
        }
        .boxed()
    }

    fn update(&self, path: String, patch: Row) -> BoxFuture<'_, Result<Option<Row>, UpstreamError>> {
        async move {
            let response = self.send(Method::PATCH, &path, Some(Value::Object(patch))).await?;
            Ok(self.json_body(response).await?.and_then(into_row))
        }
        .boxed()
    }

    fn delete(&self, path: String) -> BoxFuture<'_, Result<(), UpstreamError>> {
        async move {
            self.send(Method::DELETE, &path, None).await?;
            Ok(())
        }
        .boxed()
    }

    fn reorder(&self, path: String, placements: Vec<Placement>) -> BoxFuture<'_, Result<(), UpstreamError>> {
        async move {
            self.send(Method::POST, &path, Some(json!({ "items": placements }))).await?;
            Ok(())
        }
        .boxed()
    }
}

impl MigrationSource for HttpUpstream {
    fn manifest(&self) -> BoxFuture<'_, Result<Manifest, MigrationError>> {
        self.fetch_manifest().boxed()
    }
}

/// Accept a bare object or one wrapped as `{"data": {...}}`
fn into_row(value: Value) -> Option<Row> {
    match value {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(inner)) if !map.contains_key("id") => Some(inner),
            Some(other) => {
                map.insert("data".to_string(), other);
                Some(map)
            }
            None => Some(map),
        },
        _ => None,
    }
}

/// Error text from a server error body (`statusMessage` or `message`)
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["statusMessage", "message"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}
