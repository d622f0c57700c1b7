//! Embedded MQTT broker using rumqttd
//!
//! Only started when `[broker] embedded = true`, so a developer machine can
//! run the engine and `incident-inject` without an external broker.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Parse the broker listen address from config
fn listen_addr(app_config: &AppConfig) -> anyhow::Result<SocketAddr> {
    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    addr_str.parse().with_context(|| format!("Invalid broker bind address {addr_str}"))
}

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 1000,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 64 * 1024,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on a dedicated thread
pub fn start_embedded_broker(app_config: &AppConfig) -> anyhow::Result<()> {
    let listen = listen_addr(app_config)?;
    let config = broker_config(listen);

    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            // start() blocks for the lifetime of the broker
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("Failed to spawn broker thread")?;

    // Give the listener time to bind before clients connect
    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    Ok(())
}
