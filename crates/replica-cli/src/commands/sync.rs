//! Sync command handler

use anyhow::{bail, Result};

use replica_core::sync::{ShapeOptions, SyncCallbacks};
use replica_core::{Config, Replica};

use crate::output::{cell_text, Output};

/// Follow change feeds for the given tables until Ctrl-C
pub async fn follow(config: Config, tables: Vec<String>, output: Output) -> Result<()> {
    if config.stream_url.is_none() {
        bail!(
            "Stream URL not configured. Set it with:\n  \
             replica config set stream_url ws://your-server:3000/api/shape"
        );
    }

    let tables = if tables.is_empty() { config.tables.clone() } else { tables };
    if tables.is_empty() {
        bail!("No tables to follow. Pass --table or set `tables` in the config.");
    }

    let replica = Replica::new(config);
    let shapes = tables
        .iter()
        .map(|table| ShapeOptions::new(table.as_str()).callbacks(printer(table, output)))
        .collect();
    let subscriptions = replica.registry().subscribe_many(shapes).await;

    if subscriptions.is_empty() {
        if let Some(e) = replica.registry().last_error() {
            bail!("Could not subscribe to any table: {}", e);
        }
        bail!("Could not subscribe to any table");
    }
    output.message(&format!(
        "Following {} table(s): {}. Press Ctrl-C to stop.",
        subscriptions.len(),
        replica.registry().subscribed_tables().join(", ")
    ));

    tokio::signal::ctrl_c().await?;

    drop(subscriptions);
    replica.shutdown();
    output.success("Stopped following change feeds");
    Ok(())
}

/// Callbacks that print every applied change
fn printer(table: &str, output: Output) -> SyncCallbacks {
    let id = |row: &replica_core::Row| row.get("id").map(cell_text).unwrap_or_default();
    let (t1, t2, t3, t4, t5) = (
        table.to_string(),
        table.to_string(),
        table.to_string(),
        table.to_string(),
        table.to_string(),
    );

    SyncCallbacks::new()
        .on_insert(move |row| output.print_event(&t1, "insert", &id(row)))
        .on_update(move |row, _| output.print_event(&t2, "update", &id(row)))
        .on_delete(move |key| output.print_event(&t3, "delete", &key.to_string()))
        .on_up_to_date(move || output.success(&format!("{} is up to date", t4)))
        .on_error(move |e| output.warn(&format!("{}: {}", t5, e)))
}
