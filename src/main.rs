//! Uptrail - uptime monitoring service
//!
//! Probes HTTP, TCP and TLS endpoints on per-monitor schedules, records every
//! check, and turns the raw results into a debounced incident timeline.

mod config;
mod db;
mod monitor;
mod notify;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use monitor::ResultProcessor;
use notify::NotificationDispatcher;
use probe::NetworkProber;
use scheduler::{RetentionManager, RolloverManager, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let prober = Arc::new(NetworkProber::new(cfg.probe_timeouts)?);
    let dispatcher = NotificationDispatcher::new(cfg.webhook_timeout)?;
    let processor = Arc::new(ResultProcessor::new(
        store.clone(),
        dispatcher,
        cfg.confirmation_window_chrono(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        prober,
        processor,
        cfg.restart_settle,
    ));

    let started = scheduler.start_all().await?;
    tracing::info!("Started {} monitors", started);

    let rollover = RolloverManager::new(store.clone(), cfg.daily_uptime_retention_days);
    let retention = RetentionManager::new(store.clone(), cfg.check_log_retention_days);
    rollover.start();
    retention.start();

    let server = Server::new(cfg, store, scheduler.clone());
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    rollover.stop().await;
    retention.stop().await;
    scheduler.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
