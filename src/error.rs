//! Error types for the rolling updater

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request to the hypervisor API failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to parse config file: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Node {node} not found in cluster {cluster}")]
    NodeNotFound { cluster: String, node: String },

    /// A non-terminal rolling update already exists for the cluster
    #[error("A rolling update is already {status} on cluster {cluster}")]
    JobActive { cluster: String, status: String },

    /// The requested transition is not valid from the job's current state
    #[error("Invalid job state: {0}")]
    InvalidJobState(String),

    #[error("Node {0} must be in maintenance mode (use force to override)")]
    MaintenanceRequired(String),

    /// The external cluster manager rejected or failed a call
    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Command on {node} exited with status {code}: {output}")]
    CommandFailed {
        node: String,
        code: i32,
        output: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid schedule: {0}")]
    ScheduleError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-readable kind, used in API responses and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::ConfigError(_) | Error::TomlError(_) => "config",
            Error::ClusterNotFound(_) => "cluster_not_found",
            Error::NodeNotFound { .. } => "node_not_found",
            Error::JobActive { .. } => "job_active",
            Error::InvalidJobState(_) => "invalid_state",
            Error::MaintenanceRequired(_) => "maintenance_required",
            Error::BackendError(_) => "backend",
            Error::CommandFailed { .. } => "command_failed",
            Error::Timeout(_) => "timeout",
            Error::ScheduleError(_) => "invalid_schedule",
        }
    }
}
