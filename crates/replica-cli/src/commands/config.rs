//! Config command handlers

use std::path::Path;

use anyhow::{Context, Result};

use replica_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = Config::load_with_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::config_file_path);
            let unset = |v: Option<&str>| v.unwrap_or("(not set)").to_string();

            println!("Configuration:");
            println!("  data_dir:   {}", config.data_dir.display());
            println!("  api_url:    {}", unset(config.api_url.as_deref()));
            println!("  stream_url: {}", unset(config.stream_url.as_deref()));
            println!("  user_id:    {}", unset(config.user_id.as_deref()));
            println!(
                "  log_file:   {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  tables:     {}", config.tables.join(", "));
            println!();
            println!("Echo windows (ms):");
            println!(
                "  create {}  update {}  delete {}  reorder {}",
                config.echo.create_window_ms,
                config.echo.update_window_ms,
                config.echo.delete_window_ms,
                config.echo.reorder_window_ms
            );
            println!(
                "Reconnect backoff (ms): {} .. {}",
                config.reconnect.initial_delay_ms, config.reconnect.max_delay_ms
            );
            println!("Upstream timeout (ms): {}", config.upstream.timeout_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config = Config::load_with_override(config_path).context("Failed to load configuration")?;
    config.set_value(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_writes_to_override_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set("stream_url".into(), "ws://localhost:3000/shape".into(), Some(&path), &output).unwrap();
        set("tables".into(), "spaces,space_items".into(), Some(&path), &output).unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.stream_url.as_deref(), Some("ws://localhost:3000/shape"));
        assert_eq!(config.tables, vec!["spaces", "space_items"]);
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        assert!(set("colour".into(), "blue".into(), Some(&path), &output).is_err());
        assert!(!path.exists());
    }
}
