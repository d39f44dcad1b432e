//! Request and response bodies of the REST API

use serde::{Deserialize, Serialize};

use crate::orchestrator::ClusterSummary;
use crate::update::{JobSnapshot, JobStatus, UpdateOptions};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

/// Body of `POST .../updates/rolling`: the update options, flat, plus an
/// optional node subset
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartRollingRequest {
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
    #[serde(flatten)]
    pub options: UpdateOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Long-poll for up to this many seconds
    pub wait: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub cluster: String,
    /// `idle` when the cluster has no job
    pub status: JobStatus,
    pub job: Option<JobSnapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleNodeRequest {
    pub reboot: bool,
    /// Update even though the node is not in maintenance mode
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SingleNodeResponse {
    pub success: bool,
    pub node: String,
    pub exit_code: i32,
    pub output: String,
    pub rebooting: bool,
}
