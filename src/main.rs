//! Fleet engine - bus operational state and incident notifications
//!
//! Runs the incident notification pipeline against an MQTT broker and the
//! geometry oracle, with fleet records served from the in-process store.
//!
//! Module structure:
//! - `domain/` - Core types (Bus, Shift, Route, IncidentEvent) and errors
//! - `store/` - Repository traits and the in-process store
//! - `io/` - External interfaces (MQTT, geometry oracle, Prometheus)
//! - `services/` - Business logic (ShiftManager, BusStateMachine, IncidentPipeline)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use fleet_engine::infra::{Config, Metrics};
use fleet_engine::io::prometheus::MetricScope;
use fleet_engine::io::{HttpGeometryOracle, MessagingClient};
use fleet_engine::services::{IncidentPipeline, PipelineSettings};
use fleet_engine::store::InMemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Fleet engine - incident notification service
#[derive(Parser, Debug)]
#[command(name = "fleet-engine", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-route decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "fleet-engine starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        service_id = %config.service_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        incidents_topic = %config.incidents_topic(),
        notifications_topic = %config.notifications_topic(),
        dead_letter_topic = ?config.dead_letter_topic(),
        oracle = %config.oracle_base_url(),
        fanout_policy = %config.fanout_policy().as_str(),
        oracle_retries = %config.oracle_retries(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    if config.broker_embedded() {
        fleet_engine::infra::broker::start_embedded_broker(&config)?;
    }

    let store = Arc::new(match config.fleet_snapshot() {
        Some(path) => InMemoryStore::load_snapshot(path)?,
        None => {
            warn!("no fleet snapshot configured, starting with an empty route directory");
            InMemoryStore::new()
        }
    });

    let oracle = Arc::new(HttpGeometryOracle::new(&config).context("Failed to build geometry oracle client")?);
    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Messaging client: one connection for incidents in and notifications out
    let (messaging, listener) = MessagingClient::connect(&config);
    // Unbounded so the event loop never stalls and no valid incident is dropped
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let listener_task = {
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { listener.run(event_tx, metrics, shutdown).await })
    };

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let service_id = config.service_id().to_string();
        tokio::spawn(async move {
            // This binary drives no shift or bus operations
            if let Err(e) = fleet_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                service_id,
                MetricScope::Pipeline,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let pipeline = IncidentPipeline::new(
        store,
        oracle,
        Arc::new(messaging.clone()),
        metrics.clone(),
        PipelineSettings::from_config(&config),
    );

    // Runs until shutdown; the incident in flight finishes its fan-out
    pipeline.run(event_rx, shutdown_rx).await;

    messaging.close().await;
    if tokio::time::timeout(Duration::from_secs(5), listener_task).await.is_err() {
        warn!("incident_listener_shutdown_timeout");
    }

    metrics.report().log();
    info!("fleet-engine shutdown complete");
    Ok(())
}
