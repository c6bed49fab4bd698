//! Engine context
//!
//! `Replica` owns every piece of shared state (the lazily opened store, the
//! subscription registry, the pending-write ledger and the upstream client).
//! Nothing is global: each instance is fully isolated, so tests and multiple
//! accounts can run side by side.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::SyncError;
use crate::models::Resource;
use crate::optimistic::{Clock, EchoPolicy, OptimisticWriter, PendingLedger};
use crate::query::Queries;
use crate::schema::{Manifest, Materializer, MigrationSource};
use crate::store::{CellState, LocalStore, StoreCell, StoreError};
use crate::sync::{
    FeedConfig, OfflineStreams, ShapeOptions, StreamFactory, Subscription, SyncRegistry, WsStreamFactory,
};
use crate::upstream::{HttpUpstream, Unconfigured, Upstream};

/// A local replica of the server's tables
pub struct Replica {
    config: Config,
    cell: Arc<StoreCell>,
    registry: SyncRegistry,
    ledger: PendingLedger,
    upstream: Arc<dyn Upstream>,
}

/// Builder for [`Replica`]; anything not set is derived from the config
pub struct ReplicaBuilder {
    config: Config,
    streams: Option<Arc<dyn StreamFactory>>,
    upstream: Option<Arc<dyn Upstream>>,
    migrations: Option<Arc<dyn MigrationSource>>,
    clock: Option<Arc<dyn Clock>>,
    in_memory: bool,
}

impl ReplicaBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            streams: None,
            upstream: None,
            migrations: None,
            clock: None,
            in_memory: false,
        }
    }

    pub fn streams(mut self, streams: Arc<dyn StreamFactory>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Where migrations come from; defaults to the schema shipped with the crate
    pub fn migrations(mut self, source: Arc<dyn MigrationSource>) -> Self {
        self.migrations = Some(source);
        self
    }

    /// Clock used by the echo-suppression windows
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Keep the store in memory instead of under `data_dir`
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn build(self) -> Replica {
        let config = self.config;

        let streams: Arc<dyn StreamFactory> = match (self.streams, &config.stream_url) {
            (Some(streams), _) => streams,
            (None, Some(url)) => Arc::new(WsStreamFactory::new(FeedConfig::new(url.clone(), &config.reconnect))),
            (None, None) => Arc::new(OfflineStreams),
        };
        let upstream: Arc<dyn Upstream> = match (self.upstream, &config.api_url) {
            (Some(upstream), _) => upstream,
            (None, Some(url)) => {
                Arc::new(HttpUpstream::new(url.clone()).with_timeout(config.upstream.timeout()))
            }
            (None, None) => Arc::new(Unconfigured),
        };

        let mut policy = EchoPolicy::from_config(&config.echo);
        if let Some(clock) = self.clock {
            policy = policy.with_clock(clock);
        }
        let ledger = PendingLedger::new(policy);

        let source: Arc<dyn MigrationSource> = match self.migrations {
            Some(source) => source,
            None => Arc::new(Manifest::embedded()),
        };
        let materializer = Materializer::new(source);
        let location = (!self.in_memory).then(|| config.database_path());
        let cell = Arc::new(StoreCell::with_initializer(move || {
            open_store(location.clone(), materializer.clone())
        }));

        let registry = SyncRegistry::new(Arc::clone(&cell), streams, ledger.clone());

        Replica {
            config,
            cell,
            registry,
            ledger,
            upstream,
        }
    }
}

async fn open_store(location: Option<PathBuf>, materializer: Materializer) -> Result<LocalStore, SyncError> {
    let store = match location {
        Some(path) => {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|source| StoreError::CreateDirectory {
                        path: dir.to_path_buf(),
                        source,
                    })?;
            }
            LocalStore::open(&path).await?
        }
        None => LocalStore::open_in_memory().await?,
    };

    let report = materializer.ensure_ready(&store).await?;
    if !report.is_noop() {
        info!(?report, "Local schema updated");
    }
    Ok(store)
}

impl Replica {
    pub fn builder(config: Config) -> ReplicaBuilder {
        ReplicaBuilder::new(config)
    }

    /// Replica with transports derived from the config
    pub fn new(config: Config) -> Self {
        ReplicaBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The local store, opened and migrated on first use
    pub async fn store(&self) -> Result<LocalStore, SyncError> {
        self.cell.get().await
    }

    pub fn store_state(&self) -> CellState {
        self.cell.state()
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    pub async fn subscribe(&self, options: ShapeOptions) -> Result<Subscription, SyncError> {
        self.registry.subscribe(options).await
    }

    /// Subscribe to every table listed in the config
    pub async fn subscribe_configured(&self) -> Vec<Subscription> {
        let shapes = self.config.tables.iter().map(|table| ShapeOptions::new(table.as_str())).collect();
        self.registry.subscribe_many(shapes).await
    }

    /// Optimistic writer for one resource type
    pub async fn writer<R: Resource>(&self) -> Result<OptimisticWriter<R>, SyncError> {
        let store = self.store().await?;
        Ok(OptimisticWriter::new(
            store,
            Arc::clone(&self.upstream),
            self.ledger.clone(),
        ))
    }

    /// Read accessors for `user_id`
    pub async fn queries(&self, user_id: impl Into<String>) -> Result<Queries, SyncError> {
        Ok(Queries::new(self.store().await?, user_id))
    }

    /// Drop every subscription and forget the store, e.g. on logout
    pub fn shutdown(&self) {
        self.registry.unsubscribe_all();
        self.cell.reset();
        debug!("Replica shut down");
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("data_dir", &self.config.data_dir)
            .field("store", &self.cell.state())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Company;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_is_created_under_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().join("nested").join("data"),
            ..Config::default()
        };
        let replica = Replica::new(config.clone());
        assert_eq!(replica.store_state(), CellState::Uninitialized);

        let store = replica.store().await.unwrap();
        assert_eq!(store.path(), Some(config.database_path().as_path()));
        assert!(config.database_path().exists());
        assert_eq!(replica.store_state(), CellState::Ready);
    }

    #[tokio::test]
    async fn test_offline_replica_reports_connect_error() {
        let replica = Replica::builder(Config::default()).in_memory().build();

        let err = replica.subscribe(ShapeOptions::new("companies")).await.unwrap_err();
        assert!(matches!(err.root(), SyncError::Connect { .. }));
        assert!(replica.registry().last_error().is_some());
        assert!(replica.subscribe_configured().await.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_upstream_rolls_back_writes() {
        let replica = Replica::builder(Config::default()).in_memory().build();
        let writer = replica.writer::<Company>().await.unwrap();

        assert!(writer.create(Company::new("Acme", "acme", "u1")).await.is_err());
        let queries = replica.queries("u1").await.unwrap();
        assert!(queries.companies().await.unwrap().is_empty());
        assert!(replica.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_resets_store() {
        let replica = Replica::builder(Config::default()).in_memory().build();
        replica.store().await.unwrap();

        replica.shutdown();
        assert_eq!(replica.store_state(), CellState::Uninitialized);
        replica.store().await.unwrap();
    }
}
