//! Lock-free metrics collection and periodic reporting
//!
//! Counters are monotonic atomics. The fan-out latency histogram has an
//! interval view (reset by `report()`) next to a lifetime view used by the
//! Prometheus scrape (`snapshot()`).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not be used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Fan-out latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
pub const METRICS_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    // Inbound
    incidents_received: AtomicU64,
    incidents_malformed: AtomicU64,
    incidents_dead_lettered: AtomicU64,
    directory_failures: AtomicU64,
    // Fan-out
    routes_evaluated: AtomicU64,
    routes_impacted: AtomicU64,
    routes_skipped: AtomicU64,
    oracle_failures: AtomicU64,
    oracle_retries: AtomicU64,
    fanouts_abandoned: AtomicU64,
    // Outbound
    notifications_published: AtomicU64,
    notifications_failed: AtomicU64,
    // Fleet state
    shifts_started: AtomicU64,
    shifts_ended: AtomicU64,
    shift_conflicts: AtomicU64,
    bus_transitions: AtomicU64,
    // Fan-out latency: lifetime and since last report
    fanout_buckets_total: [AtomicU64; METRICS_NUM_BUCKETS],
    fanout_sum_ms_total: AtomicU64,
    fanout_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    fanout_sum_ms: AtomicU64,
    fanout_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            incidents_received: AtomicU64::new(0),
            incidents_malformed: AtomicU64::new(0),
            incidents_dead_lettered: AtomicU64::new(0),
            directory_failures: AtomicU64::new(0),
            routes_evaluated: AtomicU64::new(0),
            routes_impacted: AtomicU64::new(0),
            routes_skipped: AtomicU64::new(0),
            oracle_failures: AtomicU64::new(0),
            oracle_retries: AtomicU64::new(0),
            fanouts_abandoned: AtomicU64::new(0),
            notifications_published: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            shifts_started: AtomicU64::new(0),
            shifts_ended: AtomicU64::new(0),
            shift_conflicts: AtomicU64::new(0),
            bus_transitions: AtomicU64::new(0),
            fanout_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            fanout_sum_ms_total: AtomicU64::new(0),
            fanout_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fanout_sum_ms: AtomicU64::new(0),
            fanout_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_incident_received(&self) {
        self.incidents_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_incident_malformed(&self) {
        self.incidents_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_incident_dead_lettered(&self) {
        self.incidents_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_directory_failure(&self) {
        self.directory_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_evaluated(&self, impacted: bool) {
        self.routes_evaluated.fetch_add(1, Ordering::Relaxed);
        if impacted {
            self.routes_impacted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_routes_skipped(&self, count: u64) {
        self.routes_skipped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_oracle_failure(&self) {
        self.oracle_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_oracle_retry(&self) {
        self.oracle_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fanout_abandoned(&self) {
        self.fanouts_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_published(&self) {
        self.notifications_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_shift_started(&self) {
        self.shifts_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_shift_ended(&self) {
        self.shifts_ended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_shift_conflict(&self) {
        self.shift_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_bus_transition(&self) {
        self.bus_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one incident's fan-out took
    #[inline]
    pub fn record_fanout_latency(&self, latency_ms: u64) {
        let idx = bucket_index(latency_ms);
        self.fanout_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.fanout_buckets_total[idx].fetch_add(1, Ordering::Relaxed);
        self.fanout_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.fanout_sum_ms_total.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.fanout_max_ms, latency_ms);
    }

    fn counters(&self) -> Counters {
        Counters {
            incidents_received: self.incidents_received.load(Ordering::Relaxed),
            incidents_malformed: self.incidents_malformed.load(Ordering::Relaxed),
            incidents_dead_lettered: self.incidents_dead_lettered.load(Ordering::Relaxed),
            directory_failures: self.directory_failures.load(Ordering::Relaxed),
            routes_evaluated: self.routes_evaluated.load(Ordering::Relaxed),
            routes_impacted: self.routes_impacted.load(Ordering::Relaxed),
            routes_skipped: self.routes_skipped.load(Ordering::Relaxed),
            oracle_failures: self.oracle_failures.load(Ordering::Relaxed),
            oracle_retries: self.oracle_retries.load(Ordering::Relaxed),
            fanouts_abandoned: self.fanouts_abandoned.load(Ordering::Relaxed),
            notifications_published: self.notifications_published.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            shifts_started: self.shifts_started.load(Ordering::Relaxed),
            shifts_ended: self.shifts_ended.load(Ordering::Relaxed),
            shift_conflicts: self.shift_conflicts.load(Ordering::Relaxed),
            bus_transitions: self.bus_transitions.load(Ordering::Relaxed),
        }
    }

    /// Interval report: resets the interval histogram
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let buckets = swap_buckets(&self.fanout_buckets);
        let sum_ms = self.fanout_sum_ms.swap(0, Ordering::Relaxed);
        let max_ms = self.fanout_max_ms.swap(0, Ordering::Relaxed);
        MetricsSummary::build(self.counters(), buckets, sum_ms, max_ms, elapsed_secs)
    }

    /// Lifetime view for scrapes; does not reset anything
    pub fn snapshot(&self) -> MetricsSummary {
        let buckets = load_buckets(&self.fanout_buckets_total);
        let sum_ms = self.fanout_sum_ms_total.load(Ordering::Relaxed);
        let max_ms = self.fanout_max_ms.load(Ordering::Relaxed);
        MetricsSummary::build(self.counters(), buckets, sum_ms, max_ms, 0.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub incidents_received: u64,
    pub incidents_malformed: u64,
    pub incidents_dead_lettered: u64,
    pub directory_failures: u64,
    pub routes_evaluated: u64,
    pub routes_impacted: u64,
    pub routes_skipped: u64,
    pub oracle_failures: u64,
    pub oracle_retries: u64,
    pub fanouts_abandoned: u64,
    pub notifications_published: u64,
    pub notifications_failed: u64,
    pub shifts_started: u64,
    pub shifts_ended: u64,
    pub shift_conflicts: u64,
    pub bus_transitions: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub counters: Counters,
    pub fanout_buckets: [u64; METRICS_NUM_BUCKETS],
    pub fanout_count: u64,
    pub fanout_sum_ms: u64,
    pub fanout_avg_ms: u64,
    pub fanout_max_ms: u64,
    pub fanout_p50_ms: u64,
    pub fanout_p99_ms: u64,
    pub fanouts_per_sec: f64,
}

impl MetricsSummary {
    fn build(
        counters: Counters,
        buckets: [u64; METRICS_NUM_BUCKETS],
        sum_ms: u64,
        max_ms: u64,
        elapsed_secs: f64,
    ) -> Self {
        let count: u64 = buckets.iter().sum();
        Self {
            counters,
            fanout_buckets: buckets,
            fanout_count: count,
            fanout_sum_ms: sum_ms,
            fanout_avg_ms: if count > 0 { sum_ms / count } else { 0 },
            fanout_max_ms: max_ms,
            fanout_p50_ms: percentile_from_buckets(&buckets, 0.50),
            fanout_p99_ms: percentile_from_buckets(&buckets, 0.99),
            fanouts_per_sec: if elapsed_secs > 0.0 { count as f64 / elapsed_secs } else { 0.0 },
        }
    }

    pub fn log(&self) {
        let c = &self.counters;
        info!(
            incidents = %c.incidents_received,
            malformed = %c.incidents_malformed,
            routes_evaluated = %c.routes_evaluated,
            routes_impacted = %c.routes_impacted,
            oracle_failures = %c.oracle_failures,
            fanouts_abandoned = %c.fanouts_abandoned,
            notifications = %c.notifications_published,
            notifications_failed = %c.notifications_failed,
            shifts_started = %c.shifts_started,
            shifts_ended = %c.shifts_ended,
            fanouts_per_sec = %format!("{:.2}", self.fanouts_per_sec),
            fanout_avg_ms = %self.fanout_avg_ms,
            fanout_p99_ms = %self.fanout_p99_ms,
            fanout_max_ms = %self.fanout_max_ms,
            "metrics"
        );
    }
}
