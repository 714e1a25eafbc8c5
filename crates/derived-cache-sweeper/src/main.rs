//! Derived Cache Sweeper - keeps a derived file cache directory tidy
//!
//! Opens the configured cache backend and removes expired entries, either
//! once or on a fixed interval. Can also request an entry by name, which
//! is handy when inspecting a cache by hand.

mod commands;
mod error;
mod types;

use crate::error::Result;
use crate::types::SweeperConfig;
use clap::{Parser, Subcommand};
use derived_file_cache::open_backend;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "derived-cache-sweeper", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single expiry sweep and print the report
    Sweep,
    /// Sweep on an interval until interrupted
    Watch {
        /// Seconds between sweeps (overrides SWEEP_INTERVAL_SECS)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Request an entry and print its id, path and expiry
    Request {
        name: String,
        /// Minimum validity in seconds; 0 uses CACHE_TTL_SECS
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("derived_cache_sweeper=info".parse()?)
        .add_directive("derived_file_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    // Load configuration from environment
    let config = SweeperConfig::from_lookup(|key| std::env::var(key).ok())?;
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!("Backend: {}", config.cache.backend);
    info!("Default TTL: {} seconds", config.cache.default_ttl_secs);

    let backend = open_backend(&config.cache).await?;

    match cli.command {
        Command::Sweep => {
            let backend_name = config.cache.backend.to_string();
            let response = commands::sweep_once(backend.as_ref(), &backend_name).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Watch { interval_secs } => {
            let interval_secs = interval_secs.unwrap_or(config.sweep_interval_secs);
            info!("Sweeping every {} seconds", interval_secs);

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            commands::watch(backend.as_ref(), interval_secs, shutdown).await;
        }
        Command::Request { name, ttl } => {
            let response = commands::request(backend.as_ref(), &name, ttl).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
