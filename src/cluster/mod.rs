//! Cluster abstraction consumed by the rolling updater
//!
//! The orchestrator never talks to a hypervisor directly. Everything it needs
//! from the outside world (node inventory, package status, workload placement,
//! maintenance flags, reboots) goes through [`ClusterBackend`].

pub mod proxmox;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use proxmox::{ProxmoxBackend, ProxmoxConfig};
pub use simulated::{SimulatedCluster, SimulatedConfig};

/// Last-known state of a hypervisor host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub online: bool,
    /// Whether the external cluster manager has the node in maintenance mode
    #[serde(default)]
    pub maintenance: bool,
}

/// A pending package upgrade as reported by the node's package manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdate {
    #[serde(rename = "Package")]
    pub package: String,
    #[serde(rename = "OldVersion", default)]
    pub old_version: String,
    #[serde(rename = "Version", default)]
    pub new_version: String,
    #[serde(rename = "Origin", default)]
    pub origin: String,
    #[serde(rename = "Section", default)]
    pub section: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Full virtual machine, live-migrated
    Qemu,
    /// Container, restart-migrated
    Lxc,
}

/// A running guest on a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: u32,
    pub name: String,
    pub kind: WorkloadKind,
}

/// Result of a command run on a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the orchestrator needs from the external cluster manager
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// All nodes of the cluster with their liveness and maintenance flag
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Refresh the node's package index
    async fn refresh_packages(&self, node: &str) -> Result<()>;

    /// Packages with a pending upgrade on the node
    async fn pending_updates(&self, node: &str) -> Result<Vec<PackageUpdate>>;

    /// Mark the node unavailable for new workload placement
    async fn enter_maintenance(&self, node: &str) -> Result<()>;

    async fn exit_maintenance(&self, node: &str) -> Result<()>;

    /// Running guests on the node
    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>>;

    /// Move one guest to `target`. Returns once the migration has finished.
    async fn migrate(&self, workload: &Workload, source: &str, target: &str) -> Result<()>;

    /// Run the distribution upgrade on the node
    async fn run_update(&self, node: &str) -> Result<CommandOutput>;

    /// Issue a reboot; returns as soon as the request is accepted
    async fn reboot(&self, node: &str) -> Result<()>;
}
