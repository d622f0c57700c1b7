//! Services - business logic and state management
//!
//! - `shift_manager` - Driver shift lifecycle (one open shift per driver)
//! - `bus_state` - Bus operational state machine
//! - `pipeline` - Incident notification fan-out
//! - `route_planner` - Route creation through the geometry oracle

pub mod bus_state;
pub mod pipeline;
pub mod route_planner;
pub mod shift_manager;

// Re-export commonly used types
pub use bus_state::BusStateMachine;
pub use pipeline::{HandleOutcome, IncidentPipeline, IncidentReport, PipelineSettings, RouteOutcome};
pub use route_planner::RoutePlanner;
pub use shift_manager::ShiftManager;
