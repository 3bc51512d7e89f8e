//! loadpub - Telemetry receiver daemon
//!
//! Accepts event streams from load-testing agents and persists them into one
//! SQLite result-set database per test run.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use loadpub_common::config::{ConfigSource, DaemonConfig, LoadedConfig};
use loadpub_common::logging::{LogConfig, init_logging};
use loadpub_store::SqliteProvider;
use loadpubd::Daemon;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "loadpubd")]
#[command(author, version, about = "loadpub daemon - receives load-test telemetry")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port agents publish to
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind the listener on
    #[arg(long)]
    bind: Option<String>,

    /// Directory holding the result-set databases
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Release sessions idle for this long (e.g. "30m", "1h")
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, loaded: &mut LoadedConfig) {
        if let Some(port) = self.port {
            loaded.config.listener.port = port;
            loaded.record("listener.port", port, ConfigSource::Cli);
        }
        if let Some(bind) = &self.bind {
            loaded.config.listener.bind = bind.clone();
            loaded.record("listener.bind", bind, ConfigSource::Cli);
        }
        if let Some(dir) = &self.data_dir {
            loaded.config.store.data_dir = dir.clone();
            loaded.record("store.data_dir", dir.display(), ConfigSource::Cli);
        }
        if let Some(idle) = self.idle_timeout {
            loaded.config.sessions.idle_timeout = idle;
            loaded.record(
                "sessions.idle_timeout",
                humantime::format_duration(idle),
                ConfigSource::Cli,
            );
        }
        if self.verbose {
            loaded.config.logging.level = "debug".to_string();
            loaded.record("logging.level", "debug", ConfigSource::Cli);
        }
        if self.json_logs {
            loaded.config.logging.json = true;
            loaded.record("logging.json", true, ConfigSource::Cli);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loaded = DaemonConfig::load(cli.config.as_deref())?;
    cli.apply(&mut loaded);
    let config = loaded.config.clone();
    config.validate()?;

    let log_config = LogConfig::from_env(&config.logging.level)
        .with_stderr()
        .with_json(config.logging.json)
        .with_file(config.logging.file.clone());
    // RUST_LOG wins over the file, --verbose wins over RUST_LOG.
    let log_config = if cli.verbose {
        log_config.with_level("debug")
    } else {
        log_config
    };
    let _guards = init_logging(&log_config)?;

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Starting loadpub daemon...");
    for entry in &loaded.sources {
        debug!(key = entry.key, value = %entry.value, source = %entry.source, "Config");
    }

    let provider = Arc::new(SqliteProvider::new(config.store.data_dir.clone()));
    info!(data_dir = %provider.data_dir().display(), "Result sets stored locally");

    let daemon = Daemon::start(&config, provider).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    daemon.shutdown().await;
    Ok(())
}
