//! Replica CLI
//!
//! Command-line interface for the replica engine: materialize the local
//! schema, inspect and query the local store, and follow change feeds.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use replica_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "replica")]
#[command(about = "Replica - local-first table replication")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the local store and apply pending migrations
    Migrate {
        /// Fetch the migration manifest from the API server
        #[arg(long)]
        remote: bool,
        /// Drop every local table first
        #[arg(long)]
        reset: bool,
    },
    /// Show data location, applied migrations and row counts
    Status,
    /// Read rows from a local table
    Query {
        /// Table name
        table: String,
        /// SQL filter, e.g. "space_id = 's1'"
        #[arg(short, long = "where")]
        filter: Option<String>,
        /// Maximum number of rows
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Follow change feeds and replay them locally until interrupted
    Sync {
        /// Tables to follow (defaults to the configured tables)
        #[arg(short, long = "table")]
        tables: Vec<String>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_url, stream_url, user_id, log_file, tables, echo.*, reconnect.*, upstream.timeout_ms)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands must work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, config_path, &output),
        };
    }

    let config = Config::load_with_override(config_path).context("Failed to load configuration")?;
    let following = matches!(cli.command, Commands::Sync { .. });
    init_logging(&config, if following { "info" } else { "warn" });

    match cli.command {
        Commands::Migrate { remote, reset } => commands::migrate::run(&config, remote, reset, &output).await,
        Commands::Status => commands::status::show(&config, &output).await,
        Commands::Query { table, filter, limit } => {
            commands::query::run(&config, &table, filter.as_deref(), limit, &output).await
        }
        Commands::Sync { tables } => commands::sync::follow(config, tables, output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Install the tracing subscriber
///
/// The level comes from REPLICA_LOG, falling back to `default_level`. Logs go
/// to `log_file` when configured, otherwise to stderr.
fn init_logging(config: &Config, default_level: &str) {
    let level = std::env::var("REPLICA_LOG").unwrap_or_else(|_| default_level.to_string());
    let env_filter = EnvFilter::new(format!("replica_core={},replica_cli={}", level, level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match config.log_file.as_deref().map(open_log_file) {
        Some(Ok(file)) => {
            let _ = builder.with_ansi(false).with_writer(file).try_init();
        }
        Some(Err(e)) => {
            eprintln!("Warning: {:#}", e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create log directory {:?}", parent))?;
    }
    File::create(path).with_context(|| format!("Could not create log file {:?}", path))
}
