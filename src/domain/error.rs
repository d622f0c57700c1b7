//! Error types for fleet state, storage and external collaborators

use crate::domain::types::DriverId;
use thiserror::Error;

/// Errors returned by the repository layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint rejected the write
    #[error("constraint violation: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound { entity, id: id.to_string() }
    }
}

/// Errors from the geometry oracle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle returned status {0}")]
    Status(u16),

    #[error("oracle response decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OracleError::Decode(err.to_string())
        } else {
            OracleError::Transport(err.to_string())
        }
    }
}

/// Errors from the outbound messaging transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("messaging client closed: {0}")]
    Closed(String),

    #[error("payload encode error: {0}")]
    Encode(String),
}

/// Errors surfaced to callers of the shift manager, bus state machine and route planner
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("driver {0} already has an open shift")]
    DriverAlreadyOnShift(DriverId),

    #[error("driver {0} has no open shift")]
    NoOpenShift(DriverId),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
