//! Command handlers

pub mod config;
pub mod migrate;
pub mod query;
pub mod status;
pub mod sync;

use anyhow::{Context, Result};

use replica_core::{Config, LocalStore};

/// Open the on-disk store without touching the schema
pub(crate) async fn open_store(config: &Config) -> Result<LocalStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;
    let path = config.database_path();
    LocalStore::open(&path)
        .await
        .with_context(|| format!("Failed to open local store at {:?}", path))
}
