//! Geometry oracle client
//!
//! The oracle is an external service that knows road geometry. Two calls are
//! used: a proximity check of a point against an encoded path, and path
//! computation through an ordered list of waypoints.

use crate::domain::types::{GeoPoint, PathPlan};
use crate::domain::OracleError;
use crate::infra::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[async_trait]
pub trait GeometryOracle: Send + Sync {
    /// Whether `point` lies within the oracle's proximity threshold of `shape`
    async fn check_proximity(&self, shape: &str, point: GeoPoint) -> Result<bool, OracleError>;

    /// Connecting path through `points`, in order
    async fn compute_path(&self, points: &[GeoPoint]) -> Result<PathPlan, OracleError>;
}

#[derive(Debug, Serialize)]
struct CheckPathRequest<'a> {
    shape: &'a str,
    point: GeoPoint,
}

#[derive(Debug, Deserialize)]
struct CheckPathResponse {
    #[serde(default)]
    is_valid: bool,
}

#[derive(Debug, Serialize)]
struct GetPathRequest<'a> {
    points: &'a [GeoPoint],
}

#[derive(Debug, Deserialize)]
struct GetPathResponse {
    shape: String,
    #[serde(default)]
    lengths: Vec<f32>,
    #[serde(default)]
    time: Vec<f32>,
    #[serde(default)]
    length: f32,
}

/// HTTP/JSON oracle client. One `reqwest::Client` is built up front and
/// reused for connection pooling; the timeout applies to every request.
pub struct HttpGeometryOracle {
    client: reqwest::Client,
    check_url: String,
    path_url: String,
}

impl HttpGeometryOracle {
    pub fn new(config: &Config) -> Result<Self, OracleError> {
        Self::with_base_url(config.oracle_base_url(), Duration::from_millis(config.oracle_timeout_ms()))
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            check_url: format!("{base}/v1/check-path"),
            path_url: format!("{base}/v1/path"),
        })
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, OracleError>
    where
        B: Serialize + ?Sized + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let start = Instant::now();
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }
        let parsed = response.json::<R>().await?;
        debug!(url = %url, latency_us = %start.elapsed().as_micros(), "oracle_call");
        Ok(parsed)
    }
}

#[async_trait]
impl GeometryOracle for HttpGeometryOracle {
    async fn check_proximity(&self, shape: &str, point: GeoPoint) -> Result<bool, OracleError> {
        let response: CheckPathResponse =
            self.post_json(&self.check_url, &CheckPathRequest { shape, point }).await?;
        Ok(response.is_valid)
    }

    async fn compute_path(&self, points: &[GeoPoint]) -> Result<PathPlan, OracleError> {
        let response: GetPathResponse =
            self.post_json(&self.path_url, &GetPathRequest { points }).await?;
        Ok(PathPlan {
            shape: response.shape,
            segment_lengths: response.lengths,
            segment_durations: response.time,
            total_length: response.length,
        })
    }
}
