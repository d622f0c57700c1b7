//! Repository interfaces for fleet records
//!
//! Bus and Shift records are owned by the fleet state services and persisted
//! through these traits. Routes are owned by route management and read by the
//! incident pipeline. Updates replace the whole record.

pub mod memory;

use crate::domain::types::{Bus, BusId, DriverId, Route, Shift};
use crate::domain::StoreError;
use async_trait::async_trait;

pub use memory::InMemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ShiftRepo: Send + Sync {
    /// Insert a new shift and return it with its assigned id.
    ///
    /// Must fail with `StoreError::Conflict` if the shift is open and the
    /// driver already has an open shift. The check and the insert are one
    /// atomic operation.
    async fn create(&self, shift: Shift) -> StoreResult<Shift>;

    /// Replace an existing shift record
    async fn update(&self, shift: &Shift) -> StoreResult<()>;

    /// The driver's open shift, if any
    async fn get_open_by_driver(&self, driver: &DriverId) -> StoreResult<Option<Shift>>;
}

#[async_trait]
pub trait BusRepo: Send + Sync {
    async fn get_by_id(&self, id: BusId) -> StoreResult<Bus>;

    /// Replace the bus record (last writer wins)
    async fn update(&self, bus: &Bus) -> StoreResult<()>;
}

#[async_trait]
pub trait RouteDirectory: Send + Sync {
    /// All registered routes and their count
    async fn list_routes(&self) -> StoreResult<(Vec<Route>, usize)>;

    /// Register a route. A zero id asks the store to assign one.
    async fn upsert_route(&self, route: Route) -> StoreResult<Route>;
}
