mod server;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use orrery_common::config::OrreryConfig;

use crate::server::Server;

#[derive(Parser, Debug)]
#[command(name = "orrery", about = "Orrery transaction core: journal, audit log and sync channels")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "orrery.toml")]
    config: String,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml_str = toml::to_string_pretty(&OrreryConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    orrery_observability::init_tracing();
    tracing::info!("Starting Orrery...");

    let mut config = load_config(&cli.config);
    if let Some(ref dir) = cli.data_dir {
        config.server.data_dir = dir.clone();
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.server.metrics_listen_addr = addr.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow!("invalid config {}: {}", cli.config, e))?;
    tracing::info!("Config: {:?}", config);

    if !config.server.metrics_listen_addr.is_empty() {
        if let Err(e) = orrery_observability::init_metrics(&config.server.metrics_listen_addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let server = Arc::new(tokio::task::spawn_blocking(move || Server::open(&config)).await??);
    server.start_dispatch();
    tracing::info!(
        "Orrery ready: {} sync channel(s), last transaction {}",
        server.pipeline().runners().len(),
        server.journal().last_transaction_number()
    );

    let reason = wait_for_shutdown_signal().await;
    tracing::info!("{}, shutting down", reason);

    // Joining scheduler workers blocks until running programs are killed.
    let stopping = server.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;
    tracing::info!("Orrery stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT (Ctrl+C) received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

fn load_config(path: &str) -> OrreryConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                OrreryConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            OrreryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_parse() {
        let cli = Cli::parse_from(["orrery", "--config", "x.toml", "--data-dir", "/tmp/o"]);
        assert_eq!(cli.config, "x.toml");
        assert_eq!(cli.data_dir.as_deref(), Some("/tmp/o"));
        assert!(!cli.print_default_config);
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_config("/nonexistent/orrery.toml");
        assert!(config.validate().is_ok());
        assert!(config.sync.is_empty());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&OrreryConfig::default()).unwrap();
        let parsed: OrreryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.journal.file, "orrery.journal");
    }
}
