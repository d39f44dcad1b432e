//! Job, options and result types for rolling updates

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::cluster::PackageUpdate;

/// Lifecycle of a rolling update job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Running or paused: the job holds the cluster's single-flight slot
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-node workflow step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Checking,
    Evacuating,
    Updating,
    Rebooting,
    WaitingOnline,
    ExitingMaintenance,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Checking => "checking",
            Step::Evacuating => "evacuating",
            Step::Updating => "updating",
            Step::Rebooting => "rebooting",
            Step::WaitingOnline => "waiting_online",
            Step::ExitingMaintenance => "exiting_maintenance",
        };
        f.write_str(s)
    }
}

/// What created the job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Scheduled,
}

/// Knobs for one rolling update run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    pub include_reboot: bool,
    pub skip_up_to_date: bool,
    pub skip_evacuation: bool,
    pub wait_for_reboot: bool,
    pub pause_on_evacuation_error: bool,
    /// Keep going with the next node after an update or maintenance failure
    pub continue_on_failure: bool,
    /// Seconds
    pub evacuation_timeout: u64,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            include_reboot: false,
            skip_up_to_date: true,
            skip_evacuation: false,
            wait_for_reboot: true,
            pause_on_evacuation_error: true,
            continue_on_failure: false,
            evacuation_timeout: 1800,
        }
    }
}

impl UpdateOptions {
    pub fn evacuation_timeout(&self) -> Duration {
        Duration::from_secs(self.evacuation_timeout)
    }

    /// Unattended runs never wait for an operator
    pub fn unattended(mut self) -> Self {
        self.pause_on_evacuation_error = false;
        self.continue_on_failure = true;
        self
    }
}

/// How the executor reacts when workloads cannot be moved off a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvacuationFailurePolicy {
    /// Stop the job, keep the node in maintenance, wait for resume or cancel
    Pause,
    /// Patch the node anyway with the residents still on it
    Proceed,
    /// Leave maintenance, record the node as failed, move on
    SkipNode,
}

impl EvacuationFailurePolicy {
    pub fn for_job(trigger: Trigger, options: &UpdateOptions) -> Self {
        match trigger {
            Trigger::Scheduled => EvacuationFailurePolicy::SkipNode,
            Trigger::Manual if options.pause_on_evacuation_error => EvacuationFailurePolicy::Pause,
            Trigger::Manual => EvacuationFailurePolicy::Proceed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausedReason {
    EvacuationFailures,
    RebootTimeout,
    Manual,
}

/// A guest that could not be moved off the node being drained
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedVm {
    pub vmid: u32,
    pub name: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedDetails {
    pub message: String,
    #[serde(default)]
    pub failed_vms: Vec<FailedVm>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Update,
    Maintenance,
    Evacuation,
    /// The reboot request itself was rejected
    Reboot,
    RebootTimeout,
}

impl FailureKind {
    /// Whether this failure stops the job unless `continue_on_failure` is set
    pub fn halts_job(self) -> bool {
        matches!(self, FailureKind::Update | FailureKind::Maintenance)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedNode {
    pub node: String,
    pub kind: FailureKind,
    pub error: String,
}

/// One rolling update run across a fixed snapshot of nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub cluster: String,
    pub status: JobStatus,
    #[serde(default)]
    pub trigger: Trigger,
    pub nodes: Vec<String>,
    pub current_index: usize,
    pub current_node: Option<String>,
    pub current_step: Option<Step>,
    pub completed_nodes: Vec<String>,
    /// Subset of `completed_nodes` that needed no work
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    pub failed_nodes: Vec<FailedNode>,
    pub options: UpdateOptions,
    pub paused_reason: Option<PausedReason>,
    pub paused_details: Option<PausedDetails>,
    /// Operator asked to pause once the current node is done
    #[serde(default)]
    pub pause_requested: bool,
    pub logs: VecDeque<String>,
    pub started_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(cluster: &str, nodes: Vec<String>, options: UpdateOptions, trigger: Trigger) -> Self {
        let started_at = Local::now();
        Self {
            id: format!("{}-{}", cluster, started_at.format("%Y%m%d%H%M%S%3f")),
            cluster: cluster.to_string(),
            status: JobStatus::Running,
            trigger,
            current_node: nodes.first().cloned(),
            current_step: Some(Step::Checking),
            nodes,
            current_index: 0,
            completed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            options,
            paused_reason: None,
            paused_details: None,
            pause_requested: false,
            logs: VecDeque::new(),
            started_at,
            completed_at: None,
            error: None,
        }
    }

    /// Whether `node` already has an outcome
    pub fn is_settled(&self, node: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node)
            || self.failed_nodes.iter().any(|f| f.node == node)
    }

    /// Nodes with neither a success nor a failure recorded, in job order
    pub fn remaining_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !self.is_settled(n))
            .cloned()
            .collect()
    }

    pub fn evacuation_policy(&self) -> EvacuationFailurePolicy {
        EvacuationFailurePolicy::for_job(self.trigger, &self.options)
    }

    /// Enter a terminal state
    pub fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.current_step = None;
        self.completed_at = Some(Local::now());
    }
}

/// Probe result for one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateCheck {
    pub node: String,
    pub success: bool,
    pub count: usize,
    pub kernel_updates: usize,
    pub security_updates: usize,
    pub reboot_required: bool,
    pub updates: Vec<ClassifiedUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedUpdate {
    #[serde(flatten)]
    pub package: PackageUpdate,
    pub kernel: bool,
    pub security: bool,
}

/// Cluster-wide probe summary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUpdateSummary {
    pub total_nodes: usize,
    pub total_updates: usize,
    pub nodes_with_updates: usize,
    pub nodes_failed: usize,
    pub per_node: Vec<NodeUpdateCheck>,
}

/// Read-only view handed to pollers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub trigger: Trigger,
    pub nodes: Vec<String>,
    pub current_index: usize,
    pub current_node: Option<String>,
    pub current_step: Option<Step>,
    pub completed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub failed_nodes: Vec<FailedNode>,
    pub remaining_nodes: Vec<String>,
    pub progress: String,
    pub options: UpdateOptions,
    pub paused_reason: Option<PausedReason>,
    pub paused_details: Option<PausedDetails>,
    pub logs: Vec<String>,
    pub log_count: usize,
    pub started_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "lab",
            vec!["a".into(), "b".into(), "c".into()],
            UpdateOptions::default(),
            Trigger::Manual,
        )
    }

    #[test]
    fn test_remaining_excludes_settled_nodes() {
        let mut job = job();
        job.completed_nodes.push("a".into());
        job.failed_nodes.push(FailedNode {
            node: "b".into(),
            kind: FailureKind::Update,
            error: "dpkg".into(),
        });
        assert_eq!(job.remaining_nodes(), vec!["c".to_string()]);
    }

    #[test]
    fn test_status_classification() {
        assert!(JobStatus::Paused.is_active());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Idle.is_active());
    }

    #[test]
    fn test_evacuation_policy_by_trigger() {
        let mut opts = UpdateOptions::default();
        assert_eq!(
            EvacuationFailurePolicy::for_job(Trigger::Manual, &opts),
            EvacuationFailurePolicy::Pause
        );
        opts.pause_on_evacuation_error = false;
        assert_eq!(
            EvacuationFailurePolicy::for_job(Trigger::Manual, &opts),
            EvacuationFailurePolicy::Proceed
        );
        opts.pause_on_evacuation_error = true;
        assert_eq!(
            EvacuationFailurePolicy::for_job(Trigger::Scheduled, &opts),
            EvacuationFailurePolicy::SkipNode
        );
    }

    #[test]
    fn test_unattended_options() {
        let opts = UpdateOptions::default().unattended();
        assert!(!opts.pause_on_evacuation_error);
        assert!(opts.continue_on_failure);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: UpdateOptions = serde_json::from_str(r#"{"include_reboot": true}"#).unwrap();
        assert!(opts.include_reboot);
        assert!(opts.skip_up_to_date);
        assert_eq!(opts.evacuation_timeout, 1800);
    }
}
