//! Evacuation coordinator
//!
//! Drains every running guest off a node ahead of patching. The timeout is a
//! hard deadline: every external call is bounded by it and whatever is still
//! resident when it passes is reported back, never raised.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::types::FailedVm;
use crate::cluster::{ClusterBackend, NodeInfo, Workload};

const DEADLINE_MESSAGE: &str = "evacuation timeout reached";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvacuationResult {
    pub success: bool,
    pub migrated: usize,
    pub failed_vms: Vec<FailedVm>,
    /// Set when the drain could not even be attempted (inventory unavailable)
    pub error: Option<String>,
}

impl EvacuationResult {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    /// Failure where every guest in `residents` is reported as blocked by `error`
    fn stranded(error: String, residents: &[Workload], migrated: usize) -> Self {
        Self {
            success: false,
            migrated,
            failed_vms: residents
                .iter()
                .map(|w| FailedVm {
                    vmid: w.id,
                    name: w.name.clone(),
                    error: error.clone(),
                })
                .collect(),
            error: Some(error),
        }
    }

    /// One-line description for logs and pause messages
    pub fn summary(&self) -> String {
        if let Some(e) = &self.error {
            return e.clone();
        }
        format!(
            "{} migrated, {} failed",
            self.migrated,
            self.failed_vms.len()
        )
    }
}

/// Nodes eligible to receive guests from `source`, with their current load
async fn candidate_targets(
    backend: &dyn ClusterBackend,
    source: &str,
    nodes: Vec<NodeInfo>,
    deadline: Instant,
) -> Vec<(String, usize)> {
    let mut targets = Vec::new();
    for node in nodes {
        if node.name == source || !node.online || node.maintenance {
            continue;
        }
        match timeout_at(deadline, backend.list_workloads(&node.name)).await {
            Ok(Ok(w)) => targets.push((node.name, w.len())),
            Ok(Err(e)) => warn!("Skipping {} as migration target: {}", node.name, e),
            Err(_) => {
                warn!("Skipping {} as migration target: {}", node.name, DEADLINE_MESSAGE);
                break;
            }
        }
    }
    targets
}

/// Least-loaded target; ties go to the first node in name order
fn pick_target(targets: &mut [(String, usize)]) -> Option<&mut (String, usize)> {
    targets.iter_mut().min_by_key(|(_, load)| *load)
}

/// Move every running guest off `node` before `timeout` elapses.
pub async fn evacuate_node(
    backend: &dyn ClusterBackend,
    node: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> EvacuationResult {
    let deadline = Instant::now() + timeout;

    let workloads: Vec<Workload> = match timeout_at(deadline, backend.list_workloads(node)).await {
        Ok(Ok(w)) => w,
        Ok(Err(e)) => return EvacuationResult::failed(format!("listing guests failed: {}", e)),
        Err(_) => return EvacuationResult::failed(DEADLINE_MESSAGE.to_string()),
    };
    if workloads.is_empty() {
        debug!("{} has no running guests", node);
        return EvacuationResult {
            success: true,
            ..Default::default()
        };
    }

    info!("Evacuating {} guests from {}", workloads.len(), node);

    let mut targets = match timeout_at(deadline, backend.list_nodes()).await {
        Ok(Ok(nodes)) => candidate_targets(backend, node, nodes, deadline).await,
        Ok(Err(e)) => {
            return EvacuationResult::stranded(
                format!("listing nodes failed: {}", e),
                &workloads,
                0,
            )
        }
        Err(_) => {
            return EvacuationResult::stranded(DEADLINE_MESSAGE.to_string(), &workloads, 0)
        }
    };

    let mut errors: HashMap<u32, String> = HashMap::new();
    let mut migrated = 0;

    for (i, workload) in workloads.iter().enumerate() {
        let Some(target) = pick_target(&mut targets) else {
            errors.insert(workload.id, "no eligible target node".to_string());
            continue;
        };

        debug!("Migrating {} ({}) {} -> {}", workload.id, workload.name, node, target.0);
        match timeout_at(deadline, backend.migrate(workload, node, &target.0)).await {
            Ok(Ok(())) => {
                target.1 += 1;
                migrated += 1;
            }
            Ok(Err(e)) => {
                warn!("Migration of {} off {} failed: {}", workload.id, node, e);
                errors.insert(workload.id, e.to_string());
            }
            Err(_) => {
                // This guest and every one not yet attempted stay behind.
                for w in &workloads[i..] {
                    errors.insert(w.id, DEADLINE_MESSAGE.to_string());
                }
                break;
            }
        }
    }

    // Confirm the node is actually empty; a guest may still be finishing.
    // Without a fresh inventory the last one seen is reported, or the
    // original list if none was read.
    let mut last_seen: Option<Vec<Workload>> = None;
    let residents = loop {
        match timeout_at(deadline, backend.list_workloads(node)).await {
            Ok(Ok(residents)) => {
                let settled = residents.iter().all(|w| errors.contains_key(&w.id));
                let now = Instant::now();
                if residents.is_empty() || settled || now >= deadline {
                    break residents;
                }
                last_seen = Some(residents);
                tokio::time::sleep(poll_interval.min(deadline - now)).await;
            }
            Ok(Err(e)) => {
                let residents = last_seen.take().unwrap_or_else(|| workloads.clone());
                return EvacuationResult::stranded(
                    format!("verifying evacuation failed: {}", e),
                    &residents,
                    migrated,
                );
            }
            Err(_) => break last_seen.take().unwrap_or_else(|| workloads.clone()),
        }
    };

    if residents.is_empty() {
        info!("{} evacuated ({} guests moved)", node, migrated);
        return EvacuationResult {
            success: true,
            migrated,
            ..Default::default()
        };
    }

    let failed_vms = residents
        .into_iter()
        .map(|w| FailedVm {
            error: errors
                .remove(&w.id)
                .unwrap_or_else(|| "still on node after evacuation timeout".to_string()),
            vmid: w.id,
            name: w.name,
        })
        .collect();

    EvacuationResult {
        success: false,
        migrated,
        failed_vms,
        error: None,
    }
}
