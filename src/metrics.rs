//! Prometheus metrics for the rolling updater
//!
//! # Exported metrics
//! - `rolling_update_jobs_started_total` (counter): jobs started, labeled by cluster and trigger.
//! - `rolling_update_jobs_finished_total` (counter): jobs reaching a terminal status, labeled by cluster and status.
//! - `rolling_update_node_outcomes_total` (counter): per-node results, labeled by cluster and outcome.
//! - `rolling_update_evacuation_duration_seconds` (histogram): time spent draining a node, labeled by cluster.
//! - `rolling_update_api_errors_total` (counter): REST errors, labeled by kind.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::update::{JobStatus, Trigger};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobStartLabels {
    pub cluster: String,
    /// "manual" or "scheduled"
    pub trigger: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobFinishLabels {
    pub cluster: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeOutcomeLabels {
    pub cluster: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
}

pub static JOBS_STARTED_TOTAL: Lazy<Family<JobStartLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static JOBS_FINISHED_TOTAL: Lazy<Family<JobFinishLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static NODE_OUTCOMES_TOTAL: Lazy<Family<NodeOutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static API_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Evacuations range from an empty node to the 30 minute default timeout
pub static EVACUATION_DURATION_SECONDS: Lazy<Family<ClusterLabels, Histogram>> =
    Lazy::new(|| {
        fn evacuation_histogram() -> Histogram {
            // 0.5s .. ~68min across 14 buckets.
            Histogram::new(exponential_buckets(0.5, 2.0, 14))
        }

        Family::new_with_constructor(evacuation_histogram)
    });

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "rolling_update_jobs_started",
        "Rolling update jobs started",
        JOBS_STARTED_TOTAL.clone(),
    );
    registry.register(
        "rolling_update_jobs_finished",
        "Rolling update jobs that reached a terminal status",
        JOBS_FINISHED_TOTAL.clone(),
    );
    registry.register(
        "rolling_update_node_outcomes",
        "Per-node results of rolling updates",
        NODE_OUTCOMES_TOTAL.clone(),
    );
    registry.register(
        "rolling_update_evacuation_duration_seconds",
        "Time spent evacuating guests off a node",
        EVACUATION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "rolling_update_api_errors",
        "REST API requests that ended in an error",
        API_ERRORS_TOTAL.clone(),
    );

    registry
});

pub fn record_job_started(cluster: &str, trigger: Trigger) {
    let labels = JobStartLabels {
        cluster: cluster.to_string(),
        trigger: match trigger {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
        .to_string(),
    };
    JOBS_STARTED_TOTAL.get_or_create(&labels).inc();
}

pub fn record_job_finished(cluster: &str, status: JobStatus) {
    let labels = JobFinishLabels {
        cluster: cluster.to_string(),
        status: status.to_string(),
    };
    JOBS_FINISHED_TOTAL.get_or_create(&labels).inc();
}

pub fn record_node_outcome(cluster: &str, outcome: &str) {
    let labels = NodeOutcomeLabels {
        cluster: cluster.to_string(),
        outcome: outcome.to_string(),
    };
    NODE_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

/// Observe how long draining one node took
pub fn observe_evacuation_duration(cluster: &str, seconds: f64) {
    let labels = ClusterLabels {
        cluster: cluster.to_string(),
    };
    EVACUATION_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_api_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    API_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Text exposition of [`REGISTRY`]
pub fn encode_text() -> String {
    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        record_job_started("metrics-test", Trigger::Scheduled);
        record_job_finished("metrics-test", JobStatus::Completed);
        record_node_outcome("metrics-test", "up_to_date");
        observe_evacuation_duration("metrics-test", 3.0);

        let text = encode_text();
        assert!(text.contains("rolling_update_jobs_started_total"));
        assert!(text.contains(r#"trigger="scheduled""#));
        assert!(text.contains(r#"status="completed""#));
        assert!(text.contains(r#"outcome="up_to_date""#));
        assert!(text.contains("rolling_update_evacuation_duration_seconds_bucket"));
    }
}
