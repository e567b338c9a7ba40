//! pingwarden - IP reachability monitor
//!
//! Polls a set of IP targets, records latency and loss, detects outages
//! and recoveries, and serves windowed insight reports.

mod config;
mod db;
mod insights;
mod monitor;
mod probe;
mod web;

use config::ServerConfig;
use db::Store;
use monitor::{Monitor, RollupPipeline};
use probe::IcmpProbe;
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pingwarden=info".parse()?),
        )
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting pingwarden on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let probe = Arc::new(IcmpProbe::new(Duration::from_millis(cfg.ping_timeout_ms)));
    let monitor = Arc::new(Monitor::new(store.clone(), probe));

    // Restore loops for every target that was active before the restart.
    monitor.load_existing()?;

    RollupPipeline::new(store.clone(), cfg.rollup_interval_secs).start();

    let server = Server::new(cfg, store, monitor.clone());
    server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    monitor.shutdown_all();
    Ok(())
}
