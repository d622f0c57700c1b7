//! In-process store backing all three repositories
//!
//! Keeps a unique index of driver -> open shift next to the shift records.
//! Both live under one lock, so the open-shift check and the insert are a
//! single atomic step, like a unique constraint on (driver, end is null).

use super::{BusRepo, RouteDirectory, ShiftRepo, StoreResult};
use crate::domain::types::{Bus, BusId, DriverId, FleetSnapshot, Route, RouteId, Shift, ShiftId};
use crate::domain::StoreError;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Default)]
struct Inner {
    buses: FxHashMap<BusId, Bus>,
    shifts: FxHashMap<ShiftId, Shift>,
    /// Unique index: at most one open shift per driver
    open_by_driver: FxHashMap<DriverId, ShiftId>,
    /// Insertion order is the directory iteration order
    routes: Vec<Route>,
    next_shift_id: u32,
    next_route_id: u32,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: FleetSnapshot) -> Self {
        let store = Self::new();
        for route in snapshot.routes {
            store.insert_route(route);
        }
        for bus in snapshot.buses {
            store.insert_bus(bus);
        }
        store
    }

    /// Load seed data from a JSON snapshot file
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet snapshot {}", path.display()))?;
        let snapshot: FleetSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fleet snapshot {}", path.display()))?;

        info!(
            path = %path.display(),
            routes = snapshot.routes.len(),
            buses = snapshot.buses.len(),
            "fleet_snapshot_loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn insert_bus(&self, bus: Bus) {
        self.inner.lock().buses.insert(bus.id, bus);
    }

    pub fn insert_route(&self, route: Route) -> Route {
        let mut inner = self.inner.lock();
        Self::upsert_route_locked(&mut inner, route)
    }

    /// All shifts recorded for a driver, oldest first
    pub fn shifts_for_driver(&self, driver: &DriverId) -> Vec<Shift> {
        let inner = self.inner.lock();
        let mut shifts: Vec<Shift> =
            inner.shifts.values().filter(|s| &s.driver_id == driver).cloned().collect();
        shifts.sort_by_key(|s| s.id);
        shifts
    }

    pub fn open_shift_count(&self, driver: &DriverId) -> usize {
        let inner = self.inner.lock();
        inner.shifts.values().filter(|s| &s.driver_id == driver && s.is_open()).count()
    }

    fn upsert_route_locked(inner: &mut Inner, mut route: Route) -> Route {
        if route.id.0 == 0 {
            inner.next_route_id = inner
                .next_route_id
                .max(inner.routes.iter().map(|r| r.id.0).max().unwrap_or(0))
                + 1;
            route.id = RouteId(inner.next_route_id);
        }

        match inner.routes.iter_mut().find(|r| r.id == route.id) {
            Some(existing) => *existing = route.clone(),
            None => inner.routes.push(route.clone()),
        }
        route
    }
}

#[async_trait]
impl ShiftRepo for InMemoryStore {
    async fn create(&self, mut shift: Shift) -> StoreResult<Shift> {
        let mut inner = self.inner.lock();

        if shift.is_open() && inner.open_by_driver.contains_key(&shift.driver_id) {
            return Err(StoreError::Conflict(format!(
                "driver {} already has an open shift",
                shift.driver_id
            )));
        }

        inner.next_shift_id += 1;
        shift.id = ShiftId(inner.next_shift_id);
        if shift.is_open() {
            inner.open_by_driver.insert(shift.driver_id.clone(), shift.id);
        }
        inner.shifts.insert(shift.id, shift.clone());
        Ok(shift)
    }

    async fn update(&self, shift: &Shift) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let Inner { shifts, open_by_driver, .. } = &mut *inner;

        let Some(existing) = shifts.get_mut(&shift.id) else {
            return Err(StoreError::not_found("shift", shift.id));
        };

        if shift.is_open() {
            if let Some(other) = open_by_driver.get(&shift.driver_id) {
                if *other != shift.id {
                    return Err(StoreError::Conflict(format!(
                        "driver {} already has an open shift",
                        shift.driver_id
                    )));
                }
            }
        }

        // Keep the unique index in step with the record being replaced
        if existing.is_open() && open_by_driver.get(&existing.driver_id) == Some(&existing.id) {
            open_by_driver.remove(&existing.driver_id);
        }
        if shift.is_open() {
            open_by_driver.insert(shift.driver_id.clone(), shift.id);
        }
        *existing = shift.clone();
        Ok(())
    }

    async fn get_open_by_driver(&self, driver: &DriverId) -> StoreResult<Option<Shift>> {
        let inner = self.inner.lock();
        Ok(inner.open_by_driver.get(driver).and_then(|id| inner.shifts.get(id)).cloned())
    }
}

#[async_trait]
impl BusRepo for InMemoryStore {
    async fn get_by_id(&self, id: BusId) -> StoreResult<Bus> {
        self.inner.lock().buses.get(&id).cloned().ok_or_else(|| StoreError::not_found("bus", id))
    }

    async fn update(&self, bus: &Bus) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        match inner.buses.get_mut(&bus.id) {
            Some(existing) => {
                *existing = bus.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("bus", bus.id)),
        }
    }
}

#[async_trait]
impl RouteDirectory for InMemoryStore {
    async fn list_routes(&self) -> StoreResult<(Vec<Route>, usize)> {
        let routes = self.inner.lock().routes.clone();
        let count = routes.len();
        Ok((routes, count))
    }

    async fn upsert_route(&self, route: Route) -> StoreResult<Route> {
        Ok(self.insert_route(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    fn route(id: u32, number: &str) -> Route {
        Route {
            id: RouteId(id),
            number: number.to_string(),
            path: format!("shape-{number}"),
            segment_lengths: vec![],
            segment_durations: vec![],
            total_length: 0.0,
            stations: vec![],
        }
    }

    #[tokio::test]
    async fn test_second_open_shift_is_rejected() {
        let store = InMemoryStore::new();
        let driver = DriverId::new("drv-1");

        let first = store.create(Shift::open(driver.clone(), Utc::now())).await.unwrap();
        assert_eq!(first.id, ShiftId(1));

        let err = store.create(Shift::open(driver.clone(), Utc::now())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.open_shift_count(&driver), 1);
    }

    #[tokio::test]
    async fn test_closing_shift_frees_the_driver() {
        let store = InMemoryStore::new();
        let driver = DriverId::new("drv-1");

        let mut shift = store.create(Shift::open(driver.clone(), Utc::now())).await.unwrap();
        shift.end_time = Some(Utc::now());
        ShiftRepo::update(&store, &shift).await.unwrap();

        assert_eq!(store.get_open_by_driver(&driver).await.unwrap(), None);
        store.create(Shift::open(driver.clone(), Utc::now())).await.unwrap();
        assert_eq!(store.shifts_for_driver(&driver).len(), 2);
        assert_eq!(store.open_shift_count(&driver), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_shift() {
        let store = InMemoryStore::new();
        let mut shift = Shift::open(DriverId::new("x"), Utc::now());
        shift.id = ShiftId(99);
        let err = ShiftRepo::update(&store, &shift).await.unwrap_err();
        assert_eq!(err, StoreError::not_found("shift", 99));
    }

    #[tokio::test]
    async fn test_bus_round_trip_and_missing_bus() {
        let store = InMemoryStore::new();
        store.insert_bus(Bus::new(BusId(1), "100", Some(RouteId(5))));

        let mut bus = store.get_by_id(BusId(1)).await.unwrap();
        bus.number = "100A".to_string();
        BusRepo::update(&store, &bus).await.unwrap();
        assert_eq!(store.get_by_id(BusId(1)).await.unwrap().number, "100A");

        let err = store.get_by_id(BusId(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "bus", .. }));
        assert!(BusRepo::update(&store, &Bus::new(BusId(2), "2", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_routes_keep_insertion_order() {
        let store = InMemoryStore::new();
        store.insert_route(route(3, "R3"));
        store.insert_route(route(1, "R1"));
        let assigned = store.upsert_route(route(0, "R4")).await.unwrap();
        assert_eq!(assigned.id, RouteId(4));

        // Replacing keeps the position
        store.insert_route(route(3, "R3-bis"));

        let (routes, count) = store.list_routes().await.unwrap();
        assert_eq!(count, 3);
        let numbers: Vec<&str> = routes.iter().map(|r| r.number.as_str()).collect();
        assert_eq!(numbers, vec!["R3-bis", "R1", "R4"]);
    }

    #[test]
    fn test_load_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = r#"{
            "routes": [{"id": 1, "number": "12", "path": "abc"}],
            "buses": [{"id": 4, "route_id": 1, "number": "B-4"}]
        }"#;
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();

        let store = InMemoryStore::load_snapshot(file.path()).unwrap();
        let inner = store.inner.lock();
        assert_eq!(inner.routes.len(), 1);
        assert_eq!(inner.buses[&BusId(4)].route_id, Some(RouteId(1)));
    }

    #[test]
    fn test_load_snapshot_missing_file() {
        assert!(InMemoryStore::load_snapshot("/nonexistent/fleet.json").is_err());
    }
}
