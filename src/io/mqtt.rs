//! MQTT messaging client
//!
//! One connection per process, shared by the inbound incident listener and
//! the outbound notification publisher:
//! - `MessagingClient` - publish handle with an explicit `close()`
//! - `IncidentListener` - owns the rumqttc event loop, forwards incident
//!   payloads to the pipeline channel
//!
//! The event loop must keep being polled for outbound publishes to flow, so
//! the listener never waits on the pipeline: incidents go into an unbounded
//! queue and are never dropped once received.

use crate::domain::PublishError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{matches, AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Delivery intent for an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire-and-forget (QoS 0)
    BestEffort,
    /// Persisted by the broker until acknowledged (QoS 1)
    Durable,
}

impl Delivery {
    fn qos(self) -> QoS {
        match self {
            Delivery::BestEffort => QoS::AtMostOnce,
            Delivery::Durable => QoS::AtLeastOnce,
        }
    }
}

/// Outbound side of the messaging transport
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hand a payload to the transport. Returns once it is queued; does not
    /// wait for a broker acknowledgement.
    async fn publish(&self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), PublishError>;
}

/// Raw message received on the incidents topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// Process-wide MQTT connection handle
#[derive(Clone)]
pub struct MessagingClient {
    client: AsyncClient,
}

impl MessagingClient {
    /// Create the connection. Nothing goes over the wire until the returned
    /// listener starts polling the event loop.
    pub fn connect(config: &Config) -> (Self, IncidentListener) {
        let mut mqttoptions =
            MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));
        // Non-durable subscription: the broker keeps no session for us
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        let listener = IncidentListener {
            client: client.clone(),
            eventloop,
            topic: config.incidents_topic().to_string(),
        };
        (Self { client }, listener)
    }

    /// Graceful disconnect. The listener exits once the disconnect is sent.
    pub async fn close(&self) {
        match self.client.disconnect().await {
            Ok(()) => info!("mqtt_disconnect_requested"),
            Err(e) => warn!(error = %e, "mqtt_disconnect_failed"),
        }
    }
}

#[async_trait]
impl Publisher for MessagingClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), PublishError> {
        self.client
            .publish(topic, delivery.qos(), false, payload)
            .await
            .map_err(|e| PublishError::Closed(e.to_string()))
    }
}

/// Drives the MQTT event loop and forwards incident payloads
pub struct IncidentListener {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl IncidentListener {
    /// Whether a received topic belongs to the incidents subscription.
    /// The configured topic may be a filter such as `accident/#`.
    fn accepts(&self, topic: &str) -> bool {
        matches(topic, &self.topic)
    }

    /// Run until the client disconnects.
    ///
    /// After the shutdown signal no more messages are forwarded, but the
    /// event loop keeps running so in-flight publishes and the final
    /// disconnect still reach the broker.
    pub async fn run(
        mut self,
        event_tx: mpsc::UnboundedSender<InboundMessage>,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut forwarding = true;
        let mut shutdown_seen = false;

        info!(topic = %self.topic, "incident_listener_started");

        loop {
            tokio::select! {
                changed = shutdown.changed(), if !shutdown_seen => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("incident_listener_stop_forwarding");
                        forwarding = false;
                        shutdown_seen = true;
                    }
                }
                result = self.eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("mqtt_connected");
                            // Clean sessions drop subscriptions on reconnect
                            if let Err(e) = self.client.try_subscribe(self.topic.as_str(), QoS::AtMostOnce) {
                                error!(error = %e, topic = %self.topic, "mqtt_subscribe_failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            info!(topic = %self.topic, "mqtt_subscribed");
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if !forwarding || !self.accepts(&publish.topic) {
                                continue;
                            }
                            metrics.record_incident_received();
                            let message = InboundMessage {
                                topic: publish.topic,
                                payload: publish.payload,
                                received_at: Instant::now(),
                            };
                            if event_tx.send(message).is_err() {
                                debug!("incident_channel_closed");
                                forwarding = false;
                            }
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            info!("incident_listener_stopped");
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if shutdown_seen {
                                info!(error = %e, "incident_listener_stopped");
                                return;
                            }
                            error!(error = %e, "mqtt_error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}
