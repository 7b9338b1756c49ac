//! newspool server binary.
//!
//! Loads configuration, initializes tracing, builds the runtime, starts
//! the NNTP acceptor and the periodic ingest loop, and shuts everything
//! down in order on SIGINT.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use newspool::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use newspool::progress::SledProgress;
use newspool::runtime::Runtime;
use newspool::store::MemGroupStore;

/// Seconds between ingest cycles.
const INGEST_CYCLE_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "newspool", version, about = "NNTP aggregation and serving engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    init_tracing(&config.logging.format);

    tracing::info!(
        config = %cli.config.display(),
        hostname = %config.server.hostname,
        providers = config.provider.len(),
        peers = config.peer.len(),
        "Starting newspool"
    );

    let progress = Arc::new(SledProgress::open(&config.history.dir.join("progress"))?);
    let store = Arc::new(MemGroupStore::new());
    let runtime = Runtime::build(config, store, progress.clone())?;

    // Inbound NNTP server.
    let server = runtime.server();
    let listener = server.bind().await?;
    let server_shutdown = runtime.shutdown_signal();
    let server_task = tokio::spawn(async move {
        server.run(listener, server_shutdown).await;
    });

    // Periodic ingest cycles.
    let ingest_runtime = runtime.clone();
    let ingest_shutdown = runtime.shutdown_signal();
    let ingest_task = tokio::spawn(async move {
        loop {
            ingest_runtime.run_ingest_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(INGEST_CYCLE_SECS)) => {}
                _ = ingest_shutdown.recv() => return,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received");

    runtime.shutdown().await;
    let _ = server_task.await;
    let _ = ingest_task.await;
    progress.flush()?;

    Ok(())
}
