//! Query command handler

use anyhow::{Context, Result};
use serde_json::Value;

use replica_core::schema::ensure_table;
use replica_core::store::table::quote_ident;
use replica_core::Config;

use crate::output::Output;

/// Print rows of a local table
pub async fn run(config: &Config, table: &str, filter: Option<&str>, limit: usize, output: &Output) -> Result<()> {
    let store = super::open_store(config).await?;
    // Only known tables reach the SQL text
    ensure_table(&store, table)
        .await
        .with_context(|| format!("Cannot query '{}'", table))?;

    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    sql.push_str(" LIMIT ?1");

    let rows = store
        .query(sql, vec![Value::from(limit as u64)])
        .await
        .context("Query failed")?;
    store.close().await;

    output.print_rows(table, &rows);
    Ok(())
}
