//! Bus operational state machine
//!
//! `NotStarted -> InService -> NotStarted` follows the driver's shift;
//! `Charging` is a maintenance state reachable from any state. Every
//! transition re-reads the bus and writes the whole record back.

use crate::domain::types::{Bus, BusId, DriverId};
use crate::domain::{FleetError, FleetResult};
use crate::infra::metrics::Metrics;
use crate::services::shift_manager::ShiftManager;
use crate::store::BusRepo;
use std::sync::Arc;
use tracing::{error, info};

pub struct BusStateMachine {
    buses: Arc<dyn BusRepo>,
    shifts: ShiftManager,
    metrics: Arc<Metrics>,
}

impl BusStateMachine {
    pub fn new(buses: Arc<dyn BusRepo>, shifts: ShiftManager, metrics: Arc<Metrics>) -> Self {
        Self { buses, shifts, metrics }
    }

    pub fn shifts(&self) -> &ShiftManager {
        &self.shifts
    }

    /// Driver takes the bus out: opens the shift, then puts the bus in service
    pub async fn start(&self, bus_id: BusId, driver: &DriverId) -> FleetResult<Bus> {
        // Unknown bus fails before a shift is opened
        self.buses.get_by_id(bus_id).await?;
        let shift = self.shifts.start_shift(driver).await?;

        let result = async {
            let mut bus = self.buses.get_by_id(bus_id).await?;
            bus.put_in_service(driver.clone());
            self.buses.update(&bus).await?;
            Ok::<_, FleetError>(bus)
        }
        .await;

        match result {
            Ok(bus) => {
                self.metrics.record_bus_transition();
                info!(bus_id = %bus.id, driver = %driver, shift_id = %shift.id, "bus_started");
                Ok(bus)
            }
            Err(e) => {
                // Leave no open shift behind for a bus that never went into service
                if let Err(undo) = self.shifts.end_shift(driver).await {
                    error!(bus_id = %bus_id, driver = %driver, error = %undo, "shift_compensation_failed");
                }
                Err(e)
            }
        }
    }

    /// Driver brings the bus back: closes the shift, releases the bus
    pub async fn stop(&self, bus_id: BusId, driver: &DriverId) -> FleetResult<Bus> {
        self.shifts.end_shift(driver).await?;

        let mut bus = self.buses.get_by_id(bus_id).await?;
        bus.take_out_of_service();
        self.buses.update(&bus).await?;

        self.metrics.record_bus_transition();
        info!(bus_id = %bus.id, driver = %driver, "bus_stopped");
        Ok(bus)
    }

    /// Send the bus to charge. The driver stays assigned and on shift.
    pub async fn charge(&self, bus_id: BusId) -> FleetResult<Bus> {
        let mut bus = self.buses.get_by_id(bus_id).await?;
        bus.send_to_charge();
        self.buses.update(&bus).await?;

        self.metrics.record_bus_transition();
        info!(bus_id = %bus.id, driver = ?bus.driver_id.as_ref().map(|d| d.0.as_str()), "bus_charging");
        Ok(bus)
    }
}
