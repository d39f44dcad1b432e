//! Rolling updater: patch a virtualization cluster one node at a time
//!
//! Each node is put into maintenance mode, drained of its guests, upgraded,
//! optionally rebooted, and released before the next node is touched. Runs
//! can be started by hand or by a per-cluster maintenance-window schedule.

pub mod cluster;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod update;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
pub use crate::orchestrator::Orchestrator;
