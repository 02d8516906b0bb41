//! Delivery gateway - derives truck deliveries from gate presence events
//!
//! Ingests Truck/NoTruck detection events over HTTP, runs them through the
//! per-gate derivation engine, and serves the resulting delivery history to
//! dashboards.
//!
//! Module structure:
//! - `domain/` - Core business types (Delivery, PresenceEvent)
//! - `io/` - External interfaces (HTTP API, recording/sync clients, assets)
//! - `services/` - Business logic (engine, ledger, locks, workers, dispatcher)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use delivery_gateway::infra::{Config, Metrics};
use delivery_gateway::io::{
    start_api_server, ApiContext, HttpNotifier, RecordingClient, SyncClient,
};
use delivery_gateway::services::dispatcher::EffectDispatcher;
use delivery_gateway::services::{
    create_effect_channel, create_ingest_workers, DeliveryLedger, DerivationEngine, GateLocks,
    RetryPolicy, TaskStatusStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Delivery gateway - presence-event to delivery derivation service
#[derive(Parser, Debug)]
#[command(name = "delivery-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("delivery-gateway starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        http_port = %config.http_port(),
        gates = %config.gates().len(),
        workers = %config.workers(),
        lock_ttl_ms = %config.lock_ttl_ms(),
        image_rate_secs = %config.image_rate_secs(),
        recording_url = %config.recording_base_url(),
        sync_url = %config.sync_base_url(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());
    let ledger = Arc::new(DeliveryLedger::new());
    let locks = GateLocks::new(Duration::from_millis(config.lock_ttl_ms()));

    // Side-effect channel and dispatcher
    let (effects, effect_rx) = create_effect_channel(config.effect_queue_capacity(), metrics.clone());
    let notifier = Arc::new(HttpNotifier::new(
        RecordingClient::new(&config, metrics.clone()),
        SyncClient::new(&config, metrics.clone()),
    ));
    let dispatcher = EffectDispatcher::new(
        effect_rx,
        notifier,
        ledger.clone(),
        metrics.clone(),
        Duration::from_secs(config.image_rate_secs()),
    );
    let dispatcher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        dispatcher.run(dispatcher_shutdown).await;
    });

    // Derivation engine and ingest worker shards
    let engine = Arc::new(DerivationEngine::new(
        config.clone(),
        ledger.clone(),
        locks,
        effects,
        metrics.clone(),
    ));
    let retry = RetryPolicy {
        max_retries: config.max_retries(),
        backoff: Duration::from_millis(config.retry_backoff_ms()),
        backoff_cap: Duration::from_millis(config.retry_backoff_cap_ms()),
    };
    let (ingest, workers) = create_ingest_workers(
        config.workers(),
        config.queue_capacity(),
        engine,
        TaskStatusStore::new(),
        retry,
        metrics.clone(),
    );
    for worker in workers {
        let worker_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            worker.run(worker_shutdown).await;
        });
    }

    // Periodic metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run the API server until shutdown
    let ctx = Arc::new(ApiContext { config, ledger, ingest, metrics });
    start_api_server(ctx, shutdown_rx).await?;

    info!("delivery-gateway shutdown complete");
    Ok(())
}
