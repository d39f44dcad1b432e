//! Per-node update workflow
//!
//! checking -> maintenance -> evacuating -> updating -> rebooting ->
//! waiting_online -> exiting_maintenance. The executor never returns an
//! error: every failure becomes a [`NodeOutcome`] for the state machine.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use super::evacuation::evacuate_node;
use super::probe::probe_node;
use super::recorder::JobRecorder;
use super::types::{
    EvacuationFailurePolicy, FailureKind, PausedDetails, PausedReason, Step, UpdateOptions,
};
use crate::cluster::ClusterBackend;

/// Polling and deadline knobs shared by every node of a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    pub poll_interval: Duration,
    /// How long to wait for a rebooting node to drop off
    pub reboot_offline_grace: Duration,
    /// How long to wait for a rebooted node to come back
    pub reboot_timeout: Duration,
    pub update_timeout: Duration,
    /// Upper bound on one node's package refresh and query
    pub check_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reboot_offline_grace: Duration::from_secs(120),
            reboot_timeout: Duration::from_secs(600),
            update_timeout: Duration::from_secs(900),
            check_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeOutcome {
    Completed,
    /// Nothing to install; maintenance was never entered
    UpToDate,
    Paused {
        reason: PausedReason,
        details: PausedDetails,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
    /// The job was cancelled between two steps
    Cancelled,
}

impl NodeOutcome {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Completed => "completed",
            NodeOutcome::UpToDate => "up_to_date",
            NodeOutcome::Paused { .. } => "paused",
            NodeOutcome::Failed { .. } => "failed",
            NodeOutcome::Cancelled => "cancelled",
        }
    }
}

pub struct NodeUpdateExecutor<'a> {
    backend: &'a dyn ClusterBackend,
    recorder: &'a JobRecorder,
    timings: &'a Timings,
}

impl<'a> NodeUpdateExecutor<'a> {
    pub fn new(
        backend: &'a dyn ClusterBackend,
        recorder: &'a JobRecorder,
        timings: &'a Timings,
    ) -> Self {
        Self {
            backend,
            recorder,
            timings,
        }
    }

    /// Run the workflow for `node`. With `resume_at = Some(Evacuating)` the
    /// node is assumed to still be in maintenance from the paused attempt.
    pub async fn run(
        &self,
        node: &str,
        options: &UpdateOptions,
        policy: EvacuationFailurePolicy,
        resume_at: Option<Step>,
    ) -> NodeOutcome {
        if resume_at == Some(Step::Evacuating) {
            self.recorder.step(
                node,
                Step::Evacuating,
                &format!("Resuming {}: re-attempting evacuation", node),
            );
        } else {
            self.recorder
                .step(node, Step::Checking, &format!("Checking {} for updates", node));
            let check = probe_node(self.backend, node, true, self.timings.check_timeout).await;
            if check.success {
                self.recorder.log(&format!(
                    "{}: {} pending updates ({} kernel, {} security)",
                    node, check.count, check.kernel_updates, check.security_updates
                ));
                if options.skip_up_to_date && check.count == 0 {
                    self.recorder
                        .log(&format!("{} is up to date, skipping", node));
                    return NodeOutcome::UpToDate;
                }
            } else {
                self.recorder.log(&format!(
                    "Warning: update check on {} failed ({}), updating anyway",
                    node,
                    check.error.unwrap_or_default()
                ));
            }

            if self.recorder.should_stop() {
                self.recorder
                    .log(&format!("Cancelled before {} entered maintenance", node));
                return NodeOutcome::Cancelled;
            }

            self.recorder
                .log(&format!("Entering maintenance mode on {}", node));
            if let Err(e) = self.backend.enter_maintenance(node).await {
                let error = format!("entering maintenance failed: {}", e);
                self.recorder.log(&format!("ERROR: {}: {}", node, error));
                return NodeOutcome::Failed {
                    kind: FailureKind::Maintenance,
                    error,
                };
            }
        }

        if self.recorder.should_stop() {
            return self.abandon(node).await;
        }

        if options.skip_evacuation {
            self.recorder.log(&format!(
                "Warning: skipping evacuation of {} (guests stay on the node)",
                node
            ));
        } else if let Some(outcome) = self.evacuate(node, options, policy).await {
            return outcome;
        }

        if self.recorder.should_stop() {
            return self.abandon(node).await;
        }

        if let Some(outcome) = self.update_packages(node).await {
            return outcome;
        }

        if options.include_reboot {
            if self.recorder.should_stop() {
                return self.abandon(node).await;
            }
            if let Some(outcome) = self.reboot(node, options.wait_for_reboot).await {
                return outcome;
            }
        }

        self.recorder.step(
            node,
            Step::ExitingMaintenance,
            &format!("Exiting maintenance mode on {}", node),
        );
        if let Err(e) = self.backend.exit_maintenance(node).await {
            let error = format!("exiting maintenance failed: {}", e);
            self.recorder.log(&format!("ERROR: {}: {}", node, error));
            return NodeOutcome::Failed {
                kind: FailureKind::Maintenance,
                error,
            };
        }

        self.recorder
            .log(&format!("{} updated successfully", node));
        NodeOutcome::Completed
    }

    async fn evacuate(
        &self,
        node: &str,
        options: &UpdateOptions,
        policy: EvacuationFailurePolicy,
    ) -> Option<NodeOutcome> {
        self.recorder.step(
            node,
            Step::Evacuating,
            &format!(
                "Evacuating {} (timeout {}s)",
                node, options.evacuation_timeout
            ),
        );
        let started = Instant::now();
        let result = evacuate_node(
            self.backend,
            node,
            options.evacuation_timeout(),
            self.timings.poll_interval,
        )
        .await;

        #[cfg(feature = "metrics")]
        crate::metrics::observe_evacuation_duration(
            self.recorder.cluster(),
            started.elapsed().as_secs_f64(),
        );
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        if result.success {
            self.recorder.log(&format!(
                "{} evacuated ({} guests moved)",
                node, result.migrated
            ));
            return None;
        }

        self.recorder.log(&format!(
            "Evacuation of {} incomplete: {}",
            node,
            result.summary()
        ));
        for vm in &result.failed_vms {
            self.recorder.log(&format!(
                "  VM {} ({}) failed: {}",
                vm.vmid, vm.name, vm.error
            ));
        }

        match policy {
            EvacuationFailurePolicy::Pause => {
                self.recorder.log(&format!(
                    "PAUSED: {} stays in maintenance until the job is resumed or cancelled",
                    node
                ));
                Some(NodeOutcome::Paused {
                    reason: PausedReason::EvacuationFailures,
                    details: PausedDetails {
                        message: format!(
                            "Evacuation of {} failed: {}. Resolve the blocking guests, then resume or cancel.",
                            node,
                            result.summary()
                        ),
                        failed_vms: result.failed_vms,
                    },
                })
            }
            EvacuationFailurePolicy::Proceed => {
                self.recorder.log(&format!(
                    "Warning: updating {} with {} guest(s) still on it",
                    node,
                    result.failed_vms.len()
                ));
                None
            }
            EvacuationFailurePolicy::SkipNode => {
                if let Err(e) = self.backend.exit_maintenance(node).await {
                    warn!("Exiting maintenance on {} failed: {}", node, e);
                    self.recorder.log(&format!(
                        "Warning: {} could not leave maintenance: {}",
                        node, e
                    ));
                }
                let error = format!("Evacuation failed: {}", result.summary());
                self.recorder
                    .log(&format!("Failed: {} skipped, {}", node, error));
                Some(NodeOutcome::Failed {
                    kind: FailureKind::Evacuation,
                    error,
                })
            }
        }
    }

    async fn update_packages(&self, node: &str) -> Option<NodeOutcome> {
        self.recorder.step(
            node,
            Step::Updating,
            &format!("Updating packages on {}", node),
        );
        let error = match tokio::time::timeout(
            self.timings.update_timeout,
            self.backend.run_update(node),
        )
        .await
        {
            Ok(Ok(out)) if out.success() => {
                self.recorder
                    .log(&format!("Packages updated on {}", node));
                return None;
            }
            Ok(Ok(out)) => format!(
                "update command exited with status {}: {}",
                out.exit_code,
                out.output.lines().last().unwrap_or_default()
            ),
            Ok(Err(e)) => format!("update command failed: {}", e),
            Err(_) => format!(
                "update command timed out after {}s",
                self.timings.update_timeout.as_secs()
            ),
        };
        let error = format!("{}; node left in maintenance mode", error);
        self.recorder
            .log(&format!("ERROR: {}: {}", node, error));
        Some(NodeOutcome::Failed {
            kind: FailureKind::Update,
            error,
        })
    }

    async fn reboot(&self, node: &str, wait: bool) -> Option<NodeOutcome> {
        self.recorder
            .step(node, Step::Rebooting, &format!("Rebooting {}", node));
        if let Err(e) = self.backend.reboot(node).await {
            let error = format!("reboot request failed: {}; node left in maintenance mode", e);
            self.recorder.log(&format!("ERROR: {}: {}", node, error));
            return Some(NodeOutcome::Failed {
                kind: FailureKind::Reboot,
                error,
            });
        }

        if !wait {
            self.recorder
                .log(&format!("{} rebooting (not waiting for it)", node));
            return None;
        }

        self.recorder.step(
            node,
            Step::WaitingOnline,
            &format!("Waiting for {} to come back online", node),
        );
        match self.wait_for_reboot(node).await {
            Ok(()) => {
                self.recorder.log(&format!("{} back online", node));
                None
            }
            Err(error) => {
                let error = format!("{}; node left in maintenance mode", error);
                self.recorder.log(&format!("ERROR: {}: {}", node, error));
                Some(NodeOutcome::Failed {
                    kind: FailureKind::RebootTimeout,
                    error,
                })
            }
        }
    }

    async fn node_online(&self, node: &str) -> Option<bool> {
        let nodes = self.backend.list_nodes().await.ok()?;
        nodes.into_iter().find(|n| n.name == node).map(|n| n.online)
    }

    /// Wait for the node to drop off (bounded by the grace period, it may
    /// reboot faster than we poll), then for it to report online again.
    async fn wait_for_reboot(&self, node: &str) -> Result<(), String> {
        let poll = self.timings.poll_interval;

        let grace = Instant::now() + self.timings.reboot_offline_grace;
        while self.node_online(node).await == Some(true) && Instant::now() < grace {
            tokio::time::sleep(poll).await;
        }

        let deadline = Instant::now() + self.timings.reboot_timeout;
        loop {
            if self.node_online(node).await == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "{} did not come back online within {}s",
                    node,
                    self.timings.reboot_timeout.as_secs()
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop after a cancellation, releasing the node if we took it
    async fn abandon(&self, node: &str) -> NodeOutcome {
        self.recorder.log(&format!(
            "Cancelled: stopping on {}, leaving maintenance",
            node
        ));
        if let Err(e) = self.backend.exit_maintenance(node).await {
            self.recorder.log(&format!(
                "Warning: {} could not leave maintenance: {}",
                node, e
            ));
        }
        NodeOutcome::Cancelled
    }
}
