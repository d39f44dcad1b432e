//! Unattended rolling updates in a weekly or daily maintenance window.

pub mod core;
pub mod schedule;

pub use core::{ClusterMap, UpdateScheduler};
pub use schedule::{Due, Schedule, ScheduleDay, ScheduleType};
