//! Status command handler

use anyhow::Result;
use serde_json::Value;

use replica_core::schema::{self, TRACKING_TABLE};
use replica_core::store::table::quote_ident;
use replica_core::{Config, LocalStore};

use crate::output::{Output, OutputFormat};

/// Show status information
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let store = super::open_store(config).await?;
    let applied = schema::status(&store).await?;
    let counts = row_counts(&store).await?;
    store.close().await;

    match output.format {
        OutputFormat::Json => {
            let tables: serde_json::Map<String, Value> =
                counts.iter().map(|(t, n)| (t.clone(), Value::from(*n))).collect();
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "database": config.database_path(),
                    "api_url": config.api_url,
                    "stream_url": config.stream_url,
                    "migrations": applied,
                    "tables": tables
                })
            );
        }
        OutputFormat::Quiet => {
            if let Some(last) = applied.last() {
                println!("{}", last.name);
            }
        }
        OutputFormat::Human => {
            println!("Replica Status");
            println!("==============");
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Database: {}", config.database_path().display());
            println!();
            println!("Server:");
            println!("  API:    {}", config.api_url.as_deref().unwrap_or("(not set)"));
            println!("  Stream: {}", config.stream_url.as_deref().unwrap_or("(not set)"));
            println!();
            println!("Migrations:");
            if applied.is_empty() {
                println!("  (none applied, run `replica migrate`)");
            }
            for migration in &applied {
                println!("  {}  {}", migration.applied_at, migration.name);
            }
            println!();
            println!("Tables:");
            for (table, count) in &counts {
                println!("  {:<24} {}", table, count);
            }
        }
    }

    Ok(())
}

/// Row count of every replicated table, by name
async fn row_counts(store: &LocalStore) -> Result<Vec<(String, i64)>> {
    let tables = store
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != ?1 ORDER BY name",
            vec![Value::from(TRACKING_TABLE)],
        )
        .await?;

    let mut counts = Vec::with_capacity(tables.len());
    for row in tables {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            continue;
        };
        let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_ident(name));
        let count = store
            .query_one(sql, Vec::new())
            .await?
            .and_then(|r| r.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        counts.push((name.to_string(), count));
    }
    Ok(counts)
}
