//! In-memory cluster backend
//!
//! Used for dry runs (`backend = "simulated"` in the config file) and as the
//! test double for the orchestrator. Faults can be injected per node or per
//! workload, and every call is recorded so tests can assert on ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClusterBackend, CommandOutput, NodeInfo, PackageUpdate, Workload, WorkloadKind};
use crate::error::{Error, Result};

/// Simulated cluster definition as read from the config file
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SimulatedConfig {
    #[serde(default)]
    pub nodes: Vec<SimulatedNodeConfig>,
    /// Delay applied to every migration
    #[serde(default)]
    pub migration_delay_ms: u64,
    /// Delay applied to every update command
    #[serde(default)]
    pub update_delay_ms: u64,
    /// How long a rebooting node stays offline
    #[serde(default = "default_reboot_delay_ms")]
    pub reboot_delay_ms: u64,
}

fn default_reboot_delay_ms() -> u64 {
    2_000
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SimulatedNodeConfig {
    pub name: String,
    /// Names of packages with a pending upgrade
    #[serde(default)]
    pub pending: Vec<String>,
    /// VM ids running on the node
    #[serde(default)]
    pub vms: Vec<u32>,
}

/// Observable state of one simulated node
#[derive(Clone, Debug, Default)]
pub struct SimulatedNode {
    pub online: bool,
    pub maintenance: bool,
    pub packages: Vec<PackageUpdate>,
    pub workloads: Vec<Workload>,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, SimulatedNode>,
    stuck_workloads: HashMap<u32, String>,
    ghost_migrations: HashSet<u32>,
    inventory_delays: HashMap<String, Duration>,
    refresh_delays: HashMap<String, Duration>,
    node_listing_error: Option<String>,
    node_listing_delay: Duration,
    failing_updates: HashMap<String, String>,
    failing_probes: HashSet<String>,
    never_return: HashSet<String>,
    calls: Vec<String>,
    migration_delay: Duration,
    update_delay: Duration,
    reboot_delay: Duration,
}

/// Cloneable handle to an in-memory cluster
#[derive(Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCluster {
    /// Cluster with the given nodes, all online, up to date and empty
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::default();
        {
            let mut state = cluster.lock();
            state.reboot_delay = Duration::from_millis(50);
            for name in nodes {
                state.nodes.insert(
                    name.into(),
                    SimulatedNode {
                        online: true,
                        ..Default::default()
                    },
                );
            }
        }
        cluster
    }

    pub fn from_config(config: &SimulatedConfig) -> Self {
        let cluster = Self::new(config.nodes.iter().map(|n| n.name.clone()));
        {
            let mut state = cluster.lock();
            state.migration_delay = Duration::from_millis(config.migration_delay_ms);
            state.update_delay = Duration::from_millis(config.update_delay_ms);
            state.reboot_delay = Duration::from_millis(config.reboot_delay_ms);
        }
        for node in &config.nodes {
            for package in &node.pending {
                cluster.add_package(&node.name, package);
            }
            for vmid in &node.vms {
                cluster.add_vm(&node.name, *vmid, &format!("vm-{}", vmid));
            }
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned lock only means a test panicked while holding it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a pending upgrade on a node. Origin and section are derived from
    /// the name so `*security*` packages classify as security updates.
    pub fn add_package(&self, node: &str, package: &str) {
        let origin = if package.contains("security") {
            "Debian-Security"
        } else {
            "Debian"
        };
        self.add_package_update(
            node,
            PackageUpdate {
                package: package.to_string(),
                old_version: "1.0".to_string(),
                new_version: "1.1".to_string(),
                origin: origin.to_string(),
                section: "admin".to_string(),
            },
        );
    }

    pub fn add_package_update(&self, node: &str, update: PackageUpdate) {
        if let Some(n) = self.lock().nodes.get_mut(node) {
            n.packages.push(update);
        }
    }

    pub fn add_vm(&self, node: &str, id: u32, name: &str) {
        self.add_workload(node, id, name, WorkloadKind::Qemu);
    }

    pub fn add_container(&self, node: &str, id: u32, name: &str) {
        self.add_workload(node, id, name, WorkloadKind::Lxc);
    }

    fn add_workload(&self, node: &str, id: u32, name: &str, kind: WorkloadKind) {
        if let Some(n) = self.lock().nodes.get_mut(node) {
            n.workloads.push(Workload {
                id,
                name: name.to_string(),
                kind,
            });
        }
    }

    /// Make every migration of `id` fail with `reason`
    pub fn stick_workload(&self, id: u32, reason: &str) {
        self.lock().stuck_workloads.insert(id, reason.to_string());
    }

    pub fn release_workload(&self, id: u32) {
        self.lock().stuck_workloads.remove(&id);
    }

    /// Migrations of `id` report success but leave the guest where it is,
    /// like an HA-managed guest whose relocation is still queued
    pub fn ghost_migration(&self, id: u32) {
        self.lock().ghost_migrations.insert(id);
    }

    /// Listing guests on `node` takes `delay`
    pub fn set_inventory_delay(&self, node: &str, delay: Duration) {
        self.lock()
            .inventory_delays
            .insert(node.to_string(), delay);
    }

    /// Make the package index refresh on `node` hang for `delay`
    pub fn set_refresh_delay(&self, node: &str, delay: Duration) {
        self.lock().refresh_delays.insert(node.to_string(), delay);
    }

    /// Make every `list_nodes` call take `delay`
    pub fn set_node_listing_delay(&self, delay: Duration) {
        self.lock().node_listing_delay = delay;
    }

    /// Make `list_nodes` fail with `reason`
    pub fn fail_node_listing(&self, reason: &str) {
        self.lock().node_listing_error = Some(reason.to_string());
    }

    /// Make the update command on `node` exit non-zero with `output`
    pub fn fail_update(&self, node: &str, output: &str) {
        self.lock()
            .failing_updates
            .insert(node.to_string(), output.to_string());
    }

    pub fn fail_probe(&self, node: &str) {
        self.lock().failing_probes.insert(node.to_string());
    }

    /// A rebooted `node` never comes back online
    pub fn never_return(&self, node: &str) {
        self.lock().never_return.insert(node.to_string());
    }

    pub fn set_online(&self, node: &str, online: bool) {
        if let Some(n) = self.lock().nodes.get_mut(node) {
            n.online = online;
        }
    }

    pub fn set_maintenance(&self, node: &str, maintenance: bool) {
        if let Some(n) = self.lock().nodes.get_mut(node) {
            n.maintenance = maintenance;
        }
    }

    pub fn set_migration_delay(&self, delay: Duration) {
        self.lock().migration_delay = delay;
    }

    pub fn set_update_delay(&self, delay: Duration) {
        self.lock().update_delay = delay;
    }

    pub fn set_reboot_delay(&self, delay: Duration) {
        self.lock().reboot_delay = delay;
    }

    pub fn node(&self, node: &str) -> Option<SimulatedNode> {
        self.lock().nodes.get(node).cloned()
    }

    /// Every backend call so far, e.g. `enter_maintenance:b`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls whose operation matches `op`, e.g. `"update"`
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    fn record(&self, call: String) {
        debug!(call = %call, "simulated backend call");
        self.lock().calls.push(call);
    }

    fn with_node<T>(&self, node: &str, f: impl FnOnce(&mut SimulatedNode) -> T) -> Result<T> {
        let mut state = self.lock();
        let n = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::BackendError(format!("unknown node {}", node)))?;
        Ok(f(n))
    }

    fn require_online(&self, node: &str) -> Result<()> {
        if self.with_node(node, |n| n.online)? {
            Ok(())
        } else {
            Err(Error::BackendError(format!("node {} is offline", node)))
        }
    }
}

#[async_trait]
impl ClusterBackend for SimulatedCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let delay = self.lock().node_listing_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        if let Some(reason) = &state.node_listing_error {
            return Err(Error::BackendError(reason.clone()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|(name, n)| NodeInfo {
                name: name.clone(),
                online: n.online,
                maintenance: n.maintenance,
            })
            .collect())
    }

    async fn refresh_packages(&self, node: &str) -> Result<()> {
        self.record(format!("refresh:{}", node));
        let delay = self.lock().refresh_delays.get(node).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.require_online(node)
    }

    async fn pending_updates(&self, node: &str) -> Result<Vec<PackageUpdate>> {
        self.record(format!("pending:{}", node));
        if self.lock().failing_probes.contains(node) {
            return Err(Error::BackendError(format!("{}: connection refused", node)));
        }
        self.require_online(node)?;
        self.with_node(node, |n| n.packages.clone())
    }

    async fn enter_maintenance(&self, node: &str) -> Result<()> {
        self.record(format!("enter_maintenance:{}", node));
        self.with_node(node, |n| n.maintenance = true)
    }

    async fn exit_maintenance(&self, node: &str) -> Result<()> {
        self.record(format!("exit_maintenance:{}", node));
        self.with_node(node, |n| n.maintenance = false)
    }

    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>> {
        let delay = self.lock().inventory_delays.get(node).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_node(node, |n| n.workloads.clone())
    }

    async fn migrate(&self, workload: &Workload, source: &str, target: &str) -> Result<()> {
        self.record(format!("migrate:{}:{}->{}", workload.id, source, target));
        let delay = self.lock().migration_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(reason) = state.stuck_workloads.get(&workload.id) {
            return Err(Error::BackendError(reason.clone()));
        }
        if state.ghost_migrations.contains(&workload.id) {
            return Ok(());
        }
        let moved = {
            let src = state
                .nodes
                .get_mut(source)
                .ok_or_else(|| Error::BackendError(format!("unknown node {}", source)))?;
            let pos = src
                .workloads
                .iter()
                .position(|w| w.id == workload.id)
                .ok_or_else(|| {
                    Error::BackendError(format!("guest {} not on {}", workload.id, source))
                })?;
            src.workloads.remove(pos)
        };
        state
            .nodes
            .get_mut(target)
            .ok_or_else(|| Error::BackendError(format!("unknown node {}", target)))?
            .workloads
            .push(moved);
        Ok(())
    }

    async fn run_update(&self, node: &str) -> Result<CommandOutput> {
        self.record(format!("update:{}", node));
        self.require_online(node)?;
        let delay = self.lock().update_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.lock().failing_updates.get(node).cloned();
        if let Some(output) = failure {
            return Ok(CommandOutput {
                exit_code: 100,
                output,
            });
        }
        let upgraded = self.with_node(node, |n| std::mem::take(&mut n.packages).len())?;
        Ok(CommandOutput {
            exit_code: 0,
            output: format!("{} upgraded, 0 newly installed", upgraded),
        })
    }

    async fn reboot(&self, node: &str) -> Result<()> {
        self.record(format!("reboot:{}", node));
        self.require_online(node)?;
        self.with_node(node, |n| n.online = false)?;

        let (delay, stays_down) = {
            let state = self.lock();
            (state.reboot_delay, state.never_return.contains(node))
        };
        if !stays_down {
            let cluster = self.clone();
            let node = node.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                cluster.set_online(&node, true);
            });
        }
        Ok(())
    }
}
