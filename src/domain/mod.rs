//! Domain models - core fleet types and error taxonomy
//!
//! - `types` - Bus, Shift, Route, Station, incident and notification payloads
//! - `error` - FleetError and the storage/oracle/messaging errors it wraps

pub mod error;
pub mod types;

pub use error::{FleetError, FleetResult, OracleError, PublishError, StoreError};
