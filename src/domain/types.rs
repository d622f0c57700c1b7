//! Shared types for the fleet engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for bus IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BusId(pub u32);

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for route IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RouteId(pub u32);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShiftId(pub u32);

impl std::fmt::Display for ShiftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StationId(pub u32);

/// Driver identity as issued by the identity provider (opaque subject string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operational status of a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    #[default]
    NotStarted,
    InService,
    Charging,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::NotStarted => "not_started",
            BusStatus::InService => "in_service",
            BusStatus::Charging => "charging",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    #[serde(default)]
    pub route_id: Option<RouteId>,
    #[serde(default)]
    pub driver_id: Option<DriverId>,
    pub number: String,
    #[serde(default)]
    pub status: BusStatus,
}

impl Bus {
    pub fn new(id: BusId, number: impl Into<String>, route_id: Option<RouteId>) -> Self {
        Self { id, route_id, driver_id: None, number: number.into(), status: BusStatus::NotStarted }
    }

    /// Put the bus in service under `driver`. Route and number are kept.
    pub fn put_in_service(&mut self, driver: DriverId) {
        self.status = BusStatus::InService;
        self.driver_id = Some(driver);
    }

    /// Take the bus out of service and release its driver
    pub fn take_out_of_service(&mut self) {
        self.status = BusStatus::NotStarted;
        self.driver_id = None;
    }

    /// Send the bus to charge. The driver assignment is left as is: charging
    /// does not end the driver's shift.
    pub fn send_to_charge(&mut self) {
        self.status = BusStatus::Charging;
    }

    /// `InService` implies an assigned driver
    pub fn is_consistent(&self) -> bool {
        self.status != BusStatus::InService || self.driver_id.is_some()
    }
}

/// A driver's duty period. Open while `end_time` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub driver_id: DriverId,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Shift {
    /// Build a new open shift. The id is assigned by the store on create.
    pub fn open(driver_id: DriverId, start_time: DateTime<Utc>) -> Self {
        Self { id: ShiftId(0), driver_id, start_time, end_time: None }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Hours between start and end, or between start and `now` for an open shift.
    /// Clamped at zero so clock skew never yields a negative duration.
    pub fn elapsed_hours(&self, now: DateTime<Utc>) -> f64 {
        let end = self.end_time.unwrap_or(now);
        let millis = (end - self.start_time).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Station {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub number: String,
    /// Encoded polyline as produced by the geometry oracle
    pub path: String,
    #[serde(default)]
    pub segment_lengths: Vec<f32>,
    #[serde(default)]
    pub segment_durations: Vec<f32>,
    #[serde(default)]
    pub total_length: f32,
    #[serde(default)]
    pub stations: Vec<Station>,
}

/// Connecting path computed by the geometry oracle for a list of waypoints
#[derive(Debug, Clone, PartialEq)]
pub struct PathPlan {
    pub shape: String,
    pub segment_lengths: Vec<f32>,
    pub segment_durations: Vec<f32>,
    pub total_length: f32,
}

/// Incident ("accident") event consumed from the inbound topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: u64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl IncidentEvent {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Rider-facing notification published to the outbound topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub message: String,
}

/// Placeholder substituted with the route number in notification templates
pub const ROUTE_PLACEHOLDER: &str = "{route}";

impl NotificationMessage {
    pub fn for_route(template: &str, route_number: &str) -> Self {
        Self { message: template.replace(ROUTE_PLACEHOLDER, route_number) }
    }
}

/// Seed data for the in-process store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub buses: Vec<Bus>,
}
