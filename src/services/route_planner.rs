//! Route planning
//!
//! Turns an ordered list of stations into a registered route. The geometry
//! oracle supplies the connecting path; the route directory stores it.

use crate::domain::types::{Route, RouteId, Station};
use crate::domain::{FleetError, FleetResult};
use crate::io::oracle::GeometryOracle;
use crate::store::RouteDirectory;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RoutePlanner {
    oracle: Arc<dyn GeometryOracle>,
    routes: Arc<dyn RouteDirectory>,
}

impl RoutePlanner {
    pub fn new(oracle: Arc<dyn GeometryOracle>, routes: Arc<dyn RouteDirectory>) -> Self {
        Self { oracle, routes }
    }

    /// Plan and register a new route through `stations`, in order
    pub async fn create_route(&self, number: &str, stations: Vec<Station>) -> FleetResult<Route> {
        self.plan_and_store(RouteId(0), number, stations).await
    }

    /// Re-plan an existing route. Path and segment data are recomputed.
    pub async fn update_route(
        &self,
        id: RouteId,
        number: &str,
        stations: Vec<Station>,
    ) -> FleetResult<Route> {
        if id.0 == 0 {
            return Err(FleetError::InvalidRoute("route id must be non-zero".into()));
        }
        self.plan_and_store(id, number, stations).await
    }

    async fn plan_and_store(&self, id: RouteId, number: &str, stations: Vec<Station>) -> FleetResult<Route> {
        if number.trim().is_empty() {
            return Err(FleetError::InvalidRoute("route number is empty".into()));
        }
        if stations.len() < 2 {
            return Err(FleetError::InvalidRoute(format!(
                "route {number} needs at least 2 stations, got {}",
                stations.len()
            )));
        }

        let points: Vec<_> = stations.iter().map(Station::point).collect();
        let plan = self.oracle.compute_path(&points).await.map_err(|e| {
            warn!(route = %number, error = %e, "route_path_failed");
            e
        })?;

        let route = self
            .routes
            .upsert_route(Route {
                id,
                number: number.to_string(),
                path: plan.shape,
                segment_lengths: plan.segment_lengths,
                segment_durations: plan.segment_durations,
                total_length: plan.total_length,
                stations,
            })
            .await?;

        info!(
            route_id = %route.id,
            route = %route.number,
            stations = route.stations.len(),
            length = %route.total_length,
            "route_planned"
        );
        Ok(route)
    }
}
