//! Migrate command handler

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use replica_core::schema::{self, Manifest, Materializer, MigrationSource};
use replica_core::{Config, HttpUpstream};

use crate::output::{Output, OutputFormat};

/// Bring the local schema up to date
pub async fn run(config: &Config, remote: bool, reset: bool, output: &Output) -> Result<()> {
    let source: Arc<dyn MigrationSource> = if remote {
        let Some(ref api_url) = config.api_url else {
            bail!(
                "API URL not configured. Set it with:\n  \
                 replica config set api_url http://your-server:3000"
            );
        };
        Arc::new(HttpUpstream::new(api_url.clone()).with_timeout(config.upstream.timeout()))
    } else {
        Arc::new(Manifest::embedded())
    };

    let store = super::open_store(config).await?;
    if reset {
        schema::reset(&store).await.context("Failed to reset local schema")?;
        output.message("Local schema dropped.");
    }

    let report = Materializer::new(source)
        .ensure_ready(&store)
        .await
        .context("Migration failed")?;
    store.close().await;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Quiet => {
            for name in &report.applied {
                println!("{}", name);
            }
        }
        OutputFormat::Human => {
            if report.is_noop() {
                output.success("Local schema is up to date");
                return Ok(());
            }
            if report.reset {
                println!("Local schema was unknown to the manifest and has been rebuilt.");
            }
            for name in &report.applied {
                println!("  applied  {}", name);
            }
            for table in &report.deferred {
                println!("  deferred {}", table);
            }
            output.success(&format!("{} migration(s) applied", report.applied.len()));
        }
    }

    Ok(())
}
