//! Fleet operational state and incident notification engine
//!
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
pub mod store;
