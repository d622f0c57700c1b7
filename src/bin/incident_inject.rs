//! Incident injector
//!
//! Publishes one incident event to the incidents topic and optionally prints
//! the rider notifications the engine emits in response.
//!
//! Usage:
//!   cargo run --bin incident-inject -- --lat 55.751 --lon 37.618 --watch 5
//!   cargo run --bin incident-inject -- --raw 'not json'

use chrono::Utc;
use clap::Parser;
use fleet_engine::domain::types::{IncidentEvent, NotificationMessage};
use fleet_engine::infra::Config;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "incident-inject", about = "Publish a test incident to the fleet engine")]
struct Args {
    /// Path to TOML configuration file (broker address and topics)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Incident id
    #[arg(long, default_value_t = 1)]
    id: u64,

    /// Incident description
    #[arg(long, default_value = "Road accident")]
    name: String,

    #[arg(long, default_value_t = 55.751)]
    lat: f64,

    #[arg(long, default_value_t = 37.618)]
    lon: f64,

    /// Publish this payload verbatim instead of an incident event
    #[arg(long)]
    raw: Option<String>,

    /// Seconds to wait for notifications after publishing (0 = don't wait)
    #[arg(short, long, default_value_t = 0)]
    watch: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let payload = match args.raw {
        Some(raw) => raw.into_bytes(),
        None => serde_json::to_vec(&IncidentEvent {
            id: args.id,
            name: args.name,
            lat: args.lat,
            lon: args.lon,
            start_date: Utc::now(),
            end_date: None,
        })?,
    };

    let client_id = format!("incident-inject-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqtt_options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
    let watching = args.watch > 0;
    if watching {
        client.subscribe(config.notifications_topic(), QoS::AtLeastOnce).await?;
    }
    client.publish(config.incidents_topic(), QoS::AtLeastOnce, false, payload).await?;

    let deadline = Instant::now() + Duration::from_secs(args.watch.max(5));
    let mut published = false;
    let mut received = 0usize;

    loop {
        let event = match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Ok(event) => event,
            Err(_) => break,
        };
        match event {
            Ok(Event::Incoming(Packet::PubAck(_))) if !published => {
                published = true;
                info!(topic = %config.incidents_topic(), "incident_published");
                if !watching {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match serde_json::from_slice::<NotificationMessage>(&publish.payload) {
                    Ok(notification) => {
                        received += 1;
                        info!(topic = %publish.topic, message = %notification.message, "notification");
                    }
                    Err(e) => warn!(topic = %publish.topic, error = %e, "unexpected_payload"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt_error");
                anyhow::bail!("broker connection failed: {e}");
            }
        }
    }

    if !published {
        anyhow::bail!("incident was not acknowledged by the broker");
    }
    if watching {
        info!(notifications = received, "watch_finished");
    }

    let _ = client.disconnect().await;
    Ok(())
}
