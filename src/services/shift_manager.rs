//! Driver shift lifecycle
//!
//! Enforces at most one open shift per driver. The lookup gives callers a
//! clean `DriverAlreadyOnShift` in the common case; the store's atomic create
//! closes the race between concurrent starts for the same driver.

use crate::domain::types::{DriverId, Shift};
use crate::domain::{FleetError, FleetResult, StoreError};
use crate::infra::metrics::Metrics;
use crate::store::ShiftRepo;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ShiftManager {
    repo: Arc<dyn ShiftRepo>,
    metrics: Arc<Metrics>,
}

impl ShiftManager {
    pub fn new(repo: Arc<dyn ShiftRepo>, metrics: Arc<Metrics>) -> Self {
        Self { repo, metrics }
    }

    /// Open a new shift for `driver` starting now
    pub async fn start_shift(&self, driver: &DriverId) -> FleetResult<Shift> {
        if self.repo.get_open_by_driver(driver).await?.is_some() {
            return Err(self.conflict(driver));
        }

        match self.repo.create(Shift::open(driver.clone(), Utc::now())).await {
            Ok(shift) => {
                self.metrics.record_shift_started();
                info!(driver = %driver, shift_id = %shift.id, "shift_started");
                Ok(shift)
            }
            // Lost the race against a concurrent start for the same driver
            Err(StoreError::Conflict(_)) => Err(self.conflict(driver)),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the driver's open shift
    pub async fn end_shift(&self, driver: &DriverId) -> FleetResult<Shift> {
        let mut shift = self.require_open(driver).await?;
        shift.end_time = Some(Utc::now());
        self.repo.update(&shift).await?;

        self.metrics.record_shift_ended();
        info!(
            driver = %driver,
            shift_id = %shift.id,
            hours = %format!("{:.2}", shift.elapsed_hours(Utc::now())),
            "shift_ended"
        );
        Ok(shift)
    }

    /// Hours worked so far in the driver's open shift
    pub async fn elapsed_hours(&self, driver: &DriverId) -> FleetResult<f64> {
        let shift = self.require_open(driver).await?;
        Ok(shift.elapsed_hours(Utc::now()))
    }

    pub async fn open_shift(&self, driver: &DriverId) -> FleetResult<Option<Shift>> {
        Ok(self.repo.get_open_by_driver(driver).await?)
    }

    async fn require_open(&self, driver: &DriverId) -> FleetResult<Shift> {
        self.repo
            .get_open_by_driver(driver)
            .await?
            .ok_or_else(|| FleetError::NoOpenShift(driver.clone()))
    }

    fn conflict(&self, driver: &DriverId) -> FleetError {
        self.metrics.record_shift_conflict();
        warn!(driver = %driver, "shift_start_rejected: driver already on shift");
        FleetError::DriverAlreadyOnShift(driver.clone())
    }
}
