//! Tests for the incident pipeline

use super::*;
use crate::domain::types::{NotificationMessage, Route};
use crate::store::InMemoryStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Oracle with a scripted answer queue per path shape.
/// Shapes without a script (or with an exhausted one) answer "not near".
#[derive(Default)]
struct ScriptedOracle {
    scripts: Mutex<FxHashMap<String, VecDeque<Result<bool, OracleError>>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedOracle {
    fn answer(self, shape: &str, answers: Vec<Result<bool, OracleError>>) -> Self {
        self.scripts.lock().insert(shape.to_string(), answers.into());
        self
    }

    /// Every check takes `delay` to answer
    fn slow(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl GeometryOracle for ScriptedOracle {
    async fn check_proximity(&self, shape: &str, _point: GeoPoint) -> Result<bool, OracleError> {
        self.calls.lock().push(shape.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.scripts.lock().get_mut(shape).and_then(VecDeque::pop_front).unwrap_or(Ok(false))
    }

    async fn compute_path(&self, _points: &[GeoPoint]) -> Result<crate::domain::types::PathPlan, OracleError> {
        Err(OracleError::Status(501))
    }
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>, Delivery)>>,
    fail: bool,
}

impl RecordingPublisher {
    fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    fn on_topic(&self, topic: &str) -> Vec<Vec<u8>> {
        self.sent.lock().iter().filter(|(t, _, _)| t == topic).map(|(_, p, _)| p.clone()).collect()
    }

    fn messages(&self) -> Vec<String> {
        self.on_topic("social")
            .iter()
            .map(|p| serde_json::from_slice::<NotificationMessage>(p).unwrap().message)
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Closed("disconnected".into()));
        }
        self.sent.lock().push((topic.to_string(), payload, delivery));
        Ok(())
    }
}

struct Harness {
    pipeline: IncidentPipeline,
    oracle: Arc<ScriptedOracle>,
    publisher: Arc<RecordingPublisher>,
    metrics: Arc<Metrics>,
}

fn route(number: &str, path: &str) -> Route {
    Route {
        id: RouteId(0),
        number: number.to_string(),
        path: path.to_string(),
        segment_lengths: vec![],
        segment_durations: vec![],
        total_length: 0.0,
        stations: vec![],
    }
}

fn three_routes() -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    store.insert_route(route("R1", "shape-1"));
    store.insert_route(route("R2", "shape-2"));
    store.insert_route(route("R3", "shape-3"));
    Arc::new(store)
}

fn harness(config: Config, store: Arc<InMemoryStore>, oracle: ScriptedOracle, publisher: RecordingPublisher) -> Harness {
    let oracle = Arc::new(oracle);
    let publisher = Arc::new(publisher);
    let metrics = Arc::new(Metrics::new());
    let pipeline = IncidentPipeline::new(
        store,
        oracle.clone(),
        publisher.clone(),
        metrics.clone(),
        PipelineSettings::from_config(&config),
    );
    Harness { pipeline, oracle, publisher, metrics }
}

fn incident_json(id: u64) -> Vec<u8> {
    format!(
        r#"{{"id":{id},"name":"Collision at Main St","lat":55.751,"lon":37.618,"start_date":"2024-05-01T08:30:00Z"}}"#
    )
    .into_bytes()
}

fn inbound(payload: Vec<u8>) -> InboundMessage {
    InboundMessage {
        topic: "accident".to_string(),
        payload: Bytes::from(payload),
        received_at: Instant::now(),
    }
}

fn outcomes(outcome: &HandleOutcome) -> Vec<RouteOutcome> {
    match outcome {
        HandleOutcome::Processed(report) => report.evaluations.iter().map(|e| e.outcome.clone()).collect(),
        other => panic!("expected processed incident, got {other:?}"),
    }
}

#[test]
fn test_backoff_delay_doubles_and_caps() {
    let base = Duration::from_millis(200);
    assert_eq!(backoff_delay(base, 0), Duration::from_millis(200));
    assert_eq!(backoff_delay(base, 1), Duration::from_millis(400));
    assert_eq!(backoff_delay(base, 3), Duration::from_millis(1600));
    assert_eq!(backoff_delay(base, 10), MAX_RETRY_BACKOFF);
}

#[tokio::test]
async fn test_impacted_route_gets_one_notification() {
    let h = harness(
        Config::default(),
        three_routes(),
        ScriptedOracle::default().answer("shape-2", vec![Ok(true)]),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(1)).await;

    assert_eq!(outcomes(&outcome), vec![RouteOutcome::NotImpacted, RouteOutcome::Impacted, RouteOutcome::NotImpacted]);
    assert_eq!(h.publisher.messages(), vec!["Accident reported on route R2. Sorry for the bus delay.".to_string()]);

    let sent = h.publisher.sent.lock();
    assert_eq!(sent[0].2, Delivery::Durable);
    drop(sent);

    let counters = h.metrics.snapshot().counters;
    assert_eq!(counters.routes_evaluated, 3);
    assert_eq!(counters.routes_impacted, 1);
    assert_eq!(counters.notifications_published, 1);
    assert_eq!(h.metrics.snapshot().fanout_count, 1);
}

#[tokio::test]
async fn test_no_route_nearby_publishes_nothing() {
    let h = harness(Config::default(), three_routes(), ScriptedOracle::default(), RecordingPublisher::default());

    let outcome = h.pipeline.handle_payload(&incident_json(2)).await;

    assert_eq!(outcomes(&outcome), vec![RouteOutcome::NotImpacted; 3]);
    assert!(h.publisher.sent.lock().is_empty());
}

#[tokio::test]
async fn test_fail_fast_abandons_remaining_routes() {
    let h = harness(
        Config::default(),
        three_routes(),
        ScriptedOracle::default()
            .answer("shape-1", vec![Ok(true)])
            .answer("shape-2", vec![Err(OracleError::Transport("timeout".into()))])
            .answer("shape-3", vec![Ok(true)]),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(3)).await;

    assert_eq!(
        outcomes(&outcome),
        vec![
            RouteOutcome::Impacted,
            RouteOutcome::Failed(OracleError::Transport("timeout".into())),
            RouteOutcome::Skipped,
        ]
    );
    assert_eq!(h.oracle.calls(), vec!["shape-1", "shape-2"]);
    assert_eq!(h.publisher.messages().len(), 1);
    assert!(h.publisher.messages()[0].contains("R1"));

    let counters = h.metrics.snapshot().counters;
    assert_eq!(counters.fanouts_abandoned, 1);
    assert_eq!(counters.routes_skipped, 1);
    assert_eq!(counters.oracle_failures, 1);
}

#[tokio::test]
async fn test_continue_policy_evaluates_after_failure() {
    let h = harness(
        Config::default().with_fanout_policy(FanoutPolicy::Continue),
        three_routes(),
        ScriptedOracle::default()
            .answer("shape-1", vec![Ok(true)])
            .answer("shape-2", vec![Err(OracleError::Status(500))])
            .answer("shape-3", vec![Ok(true)]),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(4)).await;

    assert_eq!(
        outcomes(&outcome),
        vec![RouteOutcome::Impacted, RouteOutcome::Failed(OracleError::Status(500)), RouteOutcome::Impacted]
    );
    let HandleOutcome::Processed(report) = outcome else { unreachable!() };
    assert!(!report.abandoned);
    assert_eq!(report.impacted_routes().collect::<Vec<_>>(), vec!["R1", "R3"]);
    assert_eq!(h.publisher.messages().len(), 2);
}

#[tokio::test]
async fn test_retry_recovers_transient_failure() {
    let h = harness(
        Config::default().with_oracle_retries(2, 1),
        three_routes(),
        ScriptedOracle::default().answer(
            "shape-2",
            vec![Err(OracleError::Transport("reset".into())), Err(OracleError::Status(503)), Ok(true)],
        ),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(5)).await;

    assert_eq!(outcomes(&outcome), vec![RouteOutcome::NotImpacted, RouteOutcome::Impacted, RouteOutcome::NotImpacted]);
    assert_eq!(h.oracle.calls(), vec!["shape-1", "shape-2", "shape-2", "shape-2", "shape-3"]);
    assert_eq!(h.metrics.snapshot().counters.oracle_retries, 2);
    assert_eq!(h.publisher.messages().len(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_counts_as_failure() {
    let h = harness(
        Config::default().with_oracle_retries(1, 1),
        three_routes(),
        ScriptedOracle::default().answer(
            "shape-1",
            vec![Err(OracleError::Status(502)), Err(OracleError::Status(502))],
        ),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(6)).await;

    assert_eq!(
        outcomes(&outcome),
        vec![RouteOutcome::Failed(OracleError::Status(502)), RouteOutcome::Skipped, RouteOutcome::Skipped]
    );
    assert_eq!(h.oracle.calls(), vec!["shape-1", "shape-1"]);
}

#[tokio::test]
async fn test_publish_failure_does_not_stop_fanout() {
    let h = harness(
        Config::default(),
        three_routes(),
        ScriptedOracle::default().answer("shape-1", vec![Ok(true)]).answer("shape-3", vec![Ok(true)]),
        RecordingPublisher::failing(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(7)).await;

    assert_eq!(outcomes(&outcome), vec![RouteOutcome::Impacted, RouteOutcome::NotImpacted, RouteOutcome::Impacted]);
    let HandleOutcome::Processed(report) = outcome else { unreachable!() };
    assert_eq!(report.notifications_published, 0);
    assert_eq!(h.metrics.snapshot().counters.notifications_failed, 2);
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let h = harness(Config::default(), three_routes(), ScriptedOracle::default(), RecordingPublisher::default());

    assert_eq!(h.pipeline.handle_payload(b"not json").await, HandleOutcome::Malformed);
    assert_eq!(h.pipeline.handle_payload(br#"{"id":1}"#).await, HandleOutcome::Malformed);

    assert!(h.oracle.calls().is_empty());
    assert!(h.publisher.sent.lock().is_empty());
    assert_eq!(h.metrics.snapshot().counters.incidents_malformed, 2);
}

#[tokio::test]
async fn test_malformed_payload_goes_to_dead_letter_topic() {
    let h = harness(
        Config::default().with_dead_letter_topic("accident.dlq"),
        three_routes(),
        ScriptedOracle::default(),
        RecordingPublisher::default(),
    );

    h.pipeline.handle_payload(b"{broken").await;

    assert_eq!(h.publisher.on_topic("accident.dlq"), vec![b"{broken".to_vec()]);
    assert_eq!(h.publisher.sent.lock()[0].2, Delivery::BestEffort);
    assert_eq!(h.metrics.snapshot().counters.incidents_dead_lettered, 1);
}

#[tokio::test]
async fn test_empty_directory() {
    let h = harness(
        Config::default(),
        Arc::new(InMemoryStore::new()),
        ScriptedOracle::default(),
        RecordingPublisher::default(),
    );

    let outcome = h.pipeline.handle_payload(&incident_json(8)).await;
    assert!(outcomes(&outcome).is_empty());
}

#[tokio::test]
async fn test_run_processes_valid_event_after_malformed_one() {
    let h = harness(
        Config::default(),
        three_routes(),
        ScriptedOracle::default().answer("shape-3", vec![Ok(true)]),
        RecordingPublisher::default(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for payload in [b"garbage".to_vec(), incident_json(9)] {
        tx.send(inbound(payload)).unwrap();
    }
    drop(tx);

    // Returns once the channel is drained and closed
    h.pipeline.run(rx, shutdown_rx).await;

    assert_eq!(h.publisher.messages(), vec!["Accident reported on route R3. Sorry for the bus delay.".to_string()]);
    assert_eq!(h.metrics.snapshot().counters.incidents_malformed, 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = harness(Config::default(), three_routes(), ScriptedOracle::default(), RecordingPublisher::default());
    let pipeline = Arc::new(h.pipeline);
    let (tx, rx) = mpsc::unbounded_channel::<InboundMessage>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(rx, shutdown_rx).await })
    };

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    // Nothing is consumed after shutdown
    assert!(tx.send(inbound(incident_json(10))).is_err());
    assert!(h.oracle.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_incident_finish() {
    let h = harness(
        Config::default(),
        three_routes(),
        ScriptedOracle::default()
            .answer("shape-3", vec![Ok(true)])
            .slow(Duration::from_millis(50)),
        RecordingPublisher::default(),
    );
    let pipeline = Arc::new(h.pipeline);
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tx.send(inbound(incident_json(11))).unwrap();
    tx.send(inbound(incident_json(12))).unwrap();

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(rx, shutdown_rx).await })
    };

    // Signal shutdown while the first route of incident 11 is being checked
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.oracle.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    // Incident 11 completed its fan-out, incident 12 was never taken
    assert_eq!(h.oracle.calls(), vec!["shape-1", "shape-2", "shape-3"]);
    assert_eq!(h.publisher.messages(), vec!["Accident reported on route R3. Sorry for the bus delay.".to_string()]);
    let summary = h.metrics.snapshot();
    assert_eq!(summary.fanout_count, 1);
    assert_eq!(summary.counters.routes_evaluated, 3);
}
