//! Incident notification pipeline
//!
//! Consumes incident events from the listener channel, one at a time in
//! arrival order. For each event every registered route is checked against
//! the incident location through the geometry oracle, and a rider
//! notification is published for every route found nearby.
//!
//! Each route gets an explicit outcome. What happens after an oracle failure
//! is set by `FanoutPolicy`: `FailFast` stops the fan-out (remaining routes
//! are `Skipped`), `Continue` moves on to the next route.

#[cfg(test)]
mod tests;

use crate::domain::types::{GeoPoint, IncidentEvent, NotificationMessage, Route, RouteId};
use crate::domain::{OracleError, PublishError, StoreError};
use crate::infra::config::{Config, FanoutPolicy};
use crate::infra::metrics::Metrics;
use crate::io::mqtt::{Delivery, InboundMessage, Publisher};
use crate::io::oracle::GeometryOracle;
use crate::store::RouteDirectory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Upper bound for a single retry delay
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Pipeline settings derived from `[topics]` and `[pipeline]`
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub notifications_topic: String,
    pub dead_letter_topic: Option<String>,
    pub fanout_policy: FanoutPolicy,
    pub oracle_retries: u32,
    pub retry_backoff: Duration,
    pub notification_template: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            notifications_topic: config.notifications_topic().to_string(),
            dead_letter_topic: config.dead_letter_topic().map(str::to_string),
            fanout_policy: config.fanout_policy(),
            oracle_retries: config.oracle_retries(),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms()),
            notification_template: config.notification_template().to_string(),
        }
    }
}

/// Result of checking one route against an incident
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Impacted,
    NotImpacted,
    /// The oracle could not answer, retries included
    Failed(OracleError),
    /// Not evaluated because the fan-out was abandoned
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEvaluation {
    pub route_id: RouteId,
    pub route_number: String,
    pub outcome: RouteOutcome,
}

/// Everything the pipeline decided for one incident
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentReport {
    pub incident_id: u64,
    pub evaluations: Vec<RouteEvaluation>,
    pub notifications_published: usize,
    pub abandoned: bool,
}

impl IncidentReport {
    pub fn impacted_routes(&self) -> impl Iterator<Item = &str> {
        self.evaluations
            .iter()
            .filter(|e| e.outcome == RouteOutcome::Impacted)
            .map(|e| e.route_number.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Processed(IncidentReport),
    /// Payload did not decode as an incident and was dropped
    Malformed,
    /// Route directory could not be listed; the incident was dropped
    DirectoryUnavailable(StoreError),
}

/// Delay before retry number `attempt` (0-based): base * 2^attempt, capped
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MAX_RETRY_BACKOFF)
}

pub struct IncidentPipeline {
    routes: Arc<dyn RouteDirectory>,
    oracle: Arc<dyn GeometryOracle>,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
}

impl IncidentPipeline {
    pub fn new(
        routes: Arc<dyn RouteDirectory>,
        oracle: Arc<dyn GeometryOracle>,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self { routes, oracle, publisher, metrics, settings }
    }

    /// Consume incidents until shutdown is signalled or the channel closes.
    ///
    /// An incident already being processed finishes its fan-out before the
    /// loop observes the shutdown signal.
    pub async fn run(
        &self,
        mut event_rx: mpsc::UnboundedReceiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            policy = self.settings.fanout_policy.as_str(),
            retries = self.settings.oracle_retries,
            "incident_pipeline_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = event_rx.recv() => {
                    match message {
                        Some(m) => {
                            let queued_ms = m.received_at.elapsed().as_millis() as u64;
                            debug!(topic = %m.topic, queued_ms = %queued_ms, "incident_dequeued");
                            self.handle_payload(&m.payload).await;
                        }
                        None => break, // Listener gone
                    }
                }
            }
        }

        info!("incident_pipeline_stopped");
    }

    /// Decode and process one raw inbound payload
    pub async fn handle_payload(&self, payload: &[u8]) -> HandleOutcome {
        let incident: IncidentEvent = match serde_json::from_slice(payload) {
            Ok(incident) => incident,
            Err(e) => {
                self.metrics.record_incident_malformed();
                warn!(error = %e, bytes = payload.len(), "incident_malformed");
                self.dead_letter(payload).await;
                return HandleOutcome::Malformed;
            }
        };

        info!(
            incident_id = incident.id,
            name = %incident.name,
            lat = incident.lat,
            lon = incident.lon,
            "incident_received"
        );

        let start = Instant::now();
        match self.evaluate(&incident).await {
            Ok(report) => {
                self.metrics.record_fanout_latency(start.elapsed().as_millis() as u64);
                info!(
                    incident_id = report.incident_id,
                    routes = report.evaluations.len(),
                    notified = report.notifications_published,
                    abandoned = report.abandoned,
                    "incident_handled"
                );
                HandleOutcome::Processed(report)
            }
            Err(e) => {
                self.metrics.record_directory_failure();
                warn!(incident_id = incident.id, error = %e, "route_directory_unavailable");
                HandleOutcome::DirectoryUnavailable(e)
            }
        }
    }

    /// Fan an incident out over the current route directory
    pub async fn evaluate(&self, incident: &IncidentEvent) -> Result<IncidentReport, StoreError> {
        let (routes, count) = self.routes.list_routes().await?;
        debug!(incident_id = incident.id, routes = count, "fanout_started");

        let point = incident.location();
        let mut report = IncidentReport {
            incident_id: incident.id,
            evaluations: Vec::with_capacity(routes.len()),
            notifications_published: 0,
            abandoned: false,
        };

        for route in routes {
            let outcome = if report.abandoned {
                RouteOutcome::Skipped
            } else {
                self.evaluate_route(incident, &route, point, &mut report).await
            };
            report.evaluations.push(RouteEvaluation {
                route_id: route.id,
                route_number: route.number,
                outcome,
            });
        }

        let skipped = report.evaluations.iter().filter(|e| e.outcome == RouteOutcome::Skipped).count();
        if skipped > 0 {
            self.metrics.record_routes_skipped(skipped as u64);
        }
        Ok(report)
    }

    async fn evaluate_route(
        &self,
        incident: &IncidentEvent,
        route: &Route,
        point: GeoPoint,
        report: &mut IncidentReport,
    ) -> RouteOutcome {
        match self.check_with_retry(route, point).await {
            Ok(true) => {
                self.metrics.record_route_evaluated(true);
                info!(incident_id = incident.id, route = %route.number, "route_impacted");
                if self.notify(route).await.is_ok() {
                    report.notifications_published += 1;
                }
                RouteOutcome::Impacted
            }
            Ok(false) => {
                self.metrics.record_route_evaluated(false);
                RouteOutcome::NotImpacted
            }
            Err(e) => {
                self.metrics.record_oracle_failure();
                warn!(
                    incident_id = incident.id,
                    route = %route.number,
                    error = %e,
                    policy = self.settings.fanout_policy.as_str(),
                    "route_check_failed"
                );
                if self.settings.fanout_policy == FanoutPolicy::FailFast {
                    self.metrics.record_fanout_abandoned();
                    report.abandoned = true;
                }
                RouteOutcome::Failed(e)
            }
        }
    }

    async fn check_with_retry(&self, route: &Route, point: GeoPoint) -> Result<bool, OracleError> {
        let mut attempt = 0;
        loop {
            match self.oracle.check_proximity(&route.path, point).await {
                Ok(near) => return Ok(near),
                Err(e) if attempt < self.settings.oracle_retries => {
                    let delay = backoff_delay(self.settings.retry_backoff, attempt);
                    debug!(
                        route = %route.number,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "oracle_retry"
                    );
                    self.metrics.record_oracle_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify(&self, route: &Route) -> Result<(), PublishError> {
        let message = NotificationMessage::for_route(&self.settings.notification_template, &route.number);
        let result = match serde_json::to_vec(&message) {
            Ok(payload) => {
                self.publisher
                    .publish(&self.settings.notifications_topic, payload, Delivery::Durable)
                    .await
            }
            Err(e) => Err(PublishError::Encode(e.to_string())),
        };

        match &result {
            Ok(()) => {
                self.metrics.record_notification_published();
                debug!(route = %route.number, topic = %self.settings.notifications_topic, "notification_published");
            }
            Err(e) => {
                self.metrics.record_notification_failed();
                warn!(route = %route.number, error = %e, "notification_publish_failed");
            }
        }
        result
    }

    async fn dead_letter(&self, payload: &[u8]) {
        let Some(topic) = self.settings.dead_letter_topic.as_deref() else {
            return;
        };
        match self.publisher.publish(topic, payload.to_vec(), Delivery::BestEffort).await {
            Ok(()) => self.metrics.record_incident_dead_lettered(),
            Err(e) => warn!(topic = %topic, error = %e, "dead_letter_publish_failed"),
        }
    }
}
