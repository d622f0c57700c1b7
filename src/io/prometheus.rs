//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics, plus a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Metric families an endpoint exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricScope {
    /// Incident pipeline families only
    Pipeline,
    /// Pipeline plus shift and bus state, for processes that drive them
    WithFleetState,
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, service: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, service_id: &str, scope: MetricScope) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_inbound_metrics(&mut output, service_id, &summary);
    write_fanout_metrics(&mut output, service_id, &summary);
    if scope == MetricScope::WithFleetState {
        write_fleet_metrics(&mut output, service_id, &summary);
    }

    output
}

fn write_inbound_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let c = &summary.counters;
    let rows: [(&str, &str, u64); 4] = [
        ("fleet_incidents_received_total", "Incident messages received", c.incidents_received),
        ("fleet_incidents_malformed_total", "Incident payloads that failed to decode", c.incidents_malformed),
        (
            "fleet_incidents_dead_lettered_total",
            "Malformed payloads forwarded to the dead-letter topic",
            c.incidents_dead_lettered,
        ),
        ("fleet_directory_failures_total", "Route directory listing failures", c.directory_failures),
    ];
    for (name, help, val) in rows {
        write_metric(output, name, help, MetricType::Counter, service, val);
    }
}

fn write_fanout_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let c = &summary.counters;
    let rows: [(&str, &str, u64); 8] = [
        ("fleet_routes_evaluated_total", "Routes checked against an incident", c.routes_evaluated),
        ("fleet_routes_impacted_total", "Routes found near an incident", c.routes_impacted),
        ("fleet_routes_skipped_total", "Routes not evaluated after an abandoned fan-out", c.routes_skipped),
        ("fleet_oracle_failures_total", "Geometry oracle calls that failed", c.oracle_failures),
        ("fleet_oracle_retries_total", "Geometry oracle call retries", c.oracle_retries),
        ("fleet_fanouts_abandoned_total", "Fan-outs stopped on the first failure", c.fanouts_abandoned),
        ("fleet_notifications_published_total", "Notifications handed to the transport", c.notifications_published),
        ("fleet_notifications_failed_total", "Notifications the transport refused", c.notifications_failed),
    ];
    for (name, help, val) in rows {
        write_metric(output, name, help, MetricType::Counter, service, val);
    }

    write_histogram(
        output,
        "fleet_fanout_latency_ms",
        "Incident fan-out latency in milliseconds",
        service,
        &summary.fanout_buckets,
        summary.fanout_sum_ms,
    );
    write_metric(
        output,
        "fleet_fanout_latency_p99_ms",
        "99th percentile fan-out latency",
        MetricType::Gauge,
        service,
        summary.fanout_p99_ms,
    );
}

fn write_fleet_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let c = &summary.counters;
    write_metric(output, "fleet_shifts_started_total", "Shifts opened", MetricType::Counter, service, c.shifts_started);
    write_metric(output, "fleet_shifts_ended_total", "Shifts closed", MetricType::Counter, service, c.shifts_ended);
    write_metric(
        output,
        "fleet_shift_conflicts_total",
        "Shift starts rejected because the driver was already on shift",
        MetricType::Counter,
        service,
        c.shift_conflicts,
    );
    write_metric(
        output,
        "fleet_bus_transitions_total",
        "Bus status transitions",
        MetricType::Counter,
        service,
        c.bus_transitions,
    );
    write_metric(
        output,
        "fleet_open_shifts",
        "Shifts currently open",
        MetricType::Gauge,
        service,
        c.shifts_started.saturating_sub(c.shifts_ended),
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    service_id: Arc<String>,
    scope: MetricScope,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &service_id, scope),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    service_id: String,
    scope: MetricScope,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service_id = Arc::new(service_id);

    info!(port = %port, service = %service_id, scope = ?scope, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let service_id = service_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), service_id.clone(), scope)
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_incident_received();
        metrics.record_route_evaluated(true);
        metrics.record_route_evaluated(false);
        metrics.record_fanout_latency(30);
        metrics.record_shift_started();

        let output = format_prometheus_metrics(&metrics, "depot-1", MetricScope::WithFleetState);

        assert!(output.contains("fleet_incidents_received_total{service=\"depot-1\"} 1"));
        assert!(output.contains("fleet_routes_evaluated_total{service=\"depot-1\"} 2"));
        assert!(output.contains("fleet_routes_impacted_total{service=\"depot-1\"} 1"));
        assert!(output.contains("fleet_fanout_latency_ms_bucket{service=\"depot-1\",le=\"25\"} 0"));
        assert!(output.contains("fleet_fanout_latency_ms_bucket{service=\"depot-1\",le=\"50\"} 1"));
        assert!(output.contains("fleet_fanout_latency_ms_count{service=\"depot-1\"} 1"));
        assert!(output.contains("fleet_open_shifts{service=\"depot-1\"} 1"));
    }

    #[test]
    fn test_scrape_does_not_reset_interval_report() {
        let metrics = Metrics::new();
        metrics.record_fanout_latency(7);
        let _ = format_prometheus_metrics(&metrics, "x", MetricScope::Pipeline);
        assert_eq!(metrics.report().fanout_count, 1);
    }

    #[test]
    fn test_pipeline_scope_omits_fleet_state() {
        let metrics = Metrics::new();
        metrics.record_incident_received();
        metrics.record_shift_started();

        let output = format_prometheus_metrics(&metrics, "depot-1", MetricScope::Pipeline);

        assert!(output.contains("fleet_incidents_received_total{service=\"depot-1\"} 1"));
        assert!(!output.contains("fleet_shifts_started_total"));
        assert!(!output.contains("fleet_open_shifts"));
        assert!(!output.contains("fleet_bus_transitions_total"));
    }
}
