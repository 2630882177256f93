//! powerwatch - power availability monitor
//!
//! Infers whether a location has electrical power by probing a device there
//! that is only reachable while powered, debouncing flapping into confirmed
//! transitions and notifying subscribers.

mod config;
mod db;
mod monitor;
mod notify;
mod probe;
mod scheduler;
mod web;

use config::{ServerConfig, SharedSettings};
use db::Store;
use monitor::{Monitor, MonitorOptions};
use notify::{LogNotifier, Notifier, WebhookNotifier};
use probe::NetworkProber;
use scheduler::Scheduler;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("powerwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting powerwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::with_connections(&cfg.db_path, cfg.db_connections)?);
    tracing::info!("Database initialized successfully");

    let settings = match store.load_settings() {
        Ok(Some(s)) => s,
        Ok(None) => Default::default(),
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Default::default()
        }
    };
    tracing::info!("Monitor settings: {:?}", settings);
    let settings = SharedSettings::new(settings);

    let prober = Arc::new(NetworkProber::new(cfg.probe_mode, cfg.probe_timeout)?);
    tracing::info!("Probing with {} (timeout {:?})", cfg.probe_mode, cfg.probe_timeout);

    let notifier: Arc<dyn Notifier> = match &cfg.webhook_url {
        Some(url) => {
            tracing::info!("Delivering notifications to webhook {}", url);
            Arc::new(WebhookNotifier::new(url.clone(), cfg.probe_timeout * 2)?)
        }
        None => Arc::new(LogNotifier),
    };

    let monitor = Arc::new(Monitor::new(
        prober,
        store.clone(),
        notifier,
        settings.clone(),
        MonitorOptions {
            concurrency: cfg.concurrency,
            freshness_window: cfg.freshness_window,
        },
    ));

    match store.prune_orphaned_states() {
        Ok(0) => {}
        Ok(n) => tracing::info!("Pruned {} states without a monitored endpoint", n),
        Err(e) => tracing::warn!("Failed to prune orphaned states: {}", e),
    }

    if let Err(e) = monitor.restore().await {
        tracing::error!("State restore failed, starting from unknown: {}", e);
    }

    let flush_stop = monitor.start_periodic_flush(cfg.save_interval);

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(monitor.clone(), store.clone(), settings.clone()));
    scheduler.start().await?;

    // Start web server; returns once a shutdown signal arrives
    let server = Server::new(AppState {
        config: cfg.clone(),
        store,
        monitor: monitor.clone(),
        scheduler: scheduler.clone(),
        settings,
    });
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    if tokio::time::timeout(cfg.shutdown_timeout, scheduler.stop()).await.is_err() {
        tracing::warn!("Running tick did not finish within {:?}", cfg.shutdown_timeout);
    }
    let _ = flush_stop.send(());
    monitor.flush_with_timeout(cfg.shutdown_timeout).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
