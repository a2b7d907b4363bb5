//! Review, audit, and notification core for health-card permit applications.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
