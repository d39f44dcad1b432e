//! Node update probe
//!
//! Asks a node for its pending packages and flags the ones that touch the
//! kernel (reboot needed) or come from a security origin.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::types::{ClassifiedUpdate, ClusterUpdateSummary, NodeUpdateCheck};
use crate::cluster::{ClusterBackend, PackageUpdate};

const KERNEL_PATTERNS: [&str; 4] = ["linux-image", "pve-kernel", "proxmox-kernel", "kernel"];

pub fn is_kernel_package(update: &PackageUpdate) -> bool {
    KERNEL_PATTERNS.iter().any(|p| update.package.contains(p))
}

pub fn is_security_package(update: &PackageUpdate) -> bool {
    update.origin.to_lowercase().contains("security")
        || update.section.to_lowercase().contains("security")
}

pub fn classify(updates: Vec<PackageUpdate>) -> Vec<ClassifiedUpdate> {
    updates
        .into_iter()
        .map(|package| ClassifiedUpdate {
            kernel: is_kernel_package(&package),
            security: is_security_package(&package),
            package,
        })
        .collect()
}

/// Probe one node. Never fails: errors and a `limit` overrun land in the result.
pub async fn probe_node(
    backend: &dyn ClusterBackend,
    node: &str,
    refresh: bool,
    limit: Duration,
) -> NodeUpdateCheck {
    match timeout(limit, query_node(backend, node, refresh)).await {
        Ok(check) => check,
        Err(_) => {
            warn!("Update check on {} timed out after {:?}", node, limit);
            NodeUpdateCheck {
                node: node.to_string(),
                success: false,
                error: Some(format!("update check timed out after {:?}", limit)),
                ..Default::default()
            }
        }
    }
}

async fn query_node(backend: &dyn ClusterBackend, node: &str, refresh: bool) -> NodeUpdateCheck {
    if refresh {
        if let Err(e) = backend.refresh_packages(node).await {
            warn!("Package index refresh on {} failed: {}", node, e);
        }
    }

    match backend.pending_updates(node).await {
        Ok(updates) => {
            let updates = classify(updates);
            let kernel_updates = updates.iter().filter(|u| u.kernel).count();
            let security_updates = updates.iter().filter(|u| u.security).count();
            debug!(
                "{} has {} pending updates ({} kernel, {} security)",
                node,
                updates.len(),
                kernel_updates,
                security_updates
            );
            NodeUpdateCheck {
                node: node.to_string(),
                success: true,
                count: updates.len(),
                kernel_updates,
                security_updates,
                reboot_required: kernel_updates > 0,
                updates,
                error: None,
            }
        }
        Err(e) => {
            warn!("Update check on {} failed: {}", node, e);
            NodeUpdateCheck {
                node: node.to_string(),
                success: false,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}

/// Probe every node concurrently. One unreachable node does not affect the others.
pub async fn check_nodes(
    backend: &dyn ClusterBackend,
    nodes: &[String],
    refresh: bool,
    limit: Duration,
) -> ClusterUpdateSummary {
    let per_node: Vec<NodeUpdateCheck> =
        join_all(nodes.iter().map(|n| probe_node(backend, n, refresh, limit))).await;
    summarize(per_node)
}

pub fn summarize(per_node: Vec<NodeUpdateCheck>) -> ClusterUpdateSummary {
    let succeeded = per_node.iter().filter(|c| c.success);
    ClusterUpdateSummary {
        total_nodes: per_node.len(),
        total_updates: succeeded.clone().map(|c| c.count).sum(),
        nodes_with_updates: succeeded.filter(|c| c.count > 0).count(),
        nodes_failed: per_node.iter().filter(|c| !c.success).count(),
        per_node,
    }
}
