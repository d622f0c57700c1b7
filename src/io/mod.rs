//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT connection: incident listener and notification publisher
//! - `oracle` - HTTP client for the geometry oracle
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod mqtt;
pub mod oracle;
pub mod prometheus;

// Re-export commonly used types
pub use mqtt::{Delivery, IncidentListener, InboundMessage, MessagingClient, Publisher};
pub use oracle::{GeometryOracle, HttpGeometryOracle};
