//! Runtime glue that wires configuration, telemetry, and pipeline
//! orchestration.

pub mod config;
pub mod runner;
pub mod telemetry;
