//! Rolling update state machine
//!
//! One [`ClusterRuntime`] per configured cluster owns the cluster's job slot
//! and at most one background worker. The worker walks the job's node list
//! strictly in order, handing each node to the [`NodeUpdateExecutor`], and
//! is the only code that advances the cursor. Control operations (cancel,
//! pause, resume, clear) only flip status fields; the worker observes them
//! between steps.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::executor::{NodeOutcome, NodeUpdateExecutor, Timings};
use super::probe::check_nodes;
use super::recorder::{push_log, snapshot, JobRecorder, JobSlot};
use super::types::{
    ClusterUpdateSummary, FailedNode, Job, JobSnapshot, JobStatus, PausedDetails, PausedReason,
    Step, Trigger, UpdateOptions,
};
use crate::cluster::{ClusterBackend, CommandOutput};
use crate::error::{Error, Result};
#[cfg(feature = "metrics")]
use crate::metrics;
use crate::store::StateStore;

const RESTART_ERROR: &str = "orchestrator restarted while job was running";

/// Per-runtime knobs taken from the config file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub timings: Timings,
    /// Oldest job log lines are dropped beyond this
    pub log_capacity: usize,
    /// Log lines included in a status snapshot
    pub status_log_tail: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            log_capacity: 500,
            status_log_tail: 100,
        }
    }
}

pub struct ClusterRuntime {
    id: String,
    backend: Arc<dyn ClusterBackend>,
    slot: JobSlot,
    worker: Mutex<Option<JoinHandle<()>>>,
    store: Arc<StateStore>,
    settings: RuntimeSettings,
}

impl ClusterRuntime {
    pub fn new(
        id: &str,
        backend: Arc<dyn ClusterBackend>,
        store: Arc<StateStore>,
        settings: RuntimeSettings,
    ) -> Self {
        let (slot, _) = tokio::sync::watch::channel(None);
        Self {
            id: id.to_string(),
            backend,
            slot: Arc::new(slot),
            worker: Mutex::new(None),
            store,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &dyn ClusterBackend {
        self.backend.as_ref()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    fn worker_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A worker (or a post-cancel cleanup task) is still running
    pub fn worker_busy(&self) -> bool {
        self.worker_handle()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the current worker, if any, to exit
    pub async fn wait_for_worker(&self) {
        let handle = self.worker_handle().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Worker for {} ended abnormally: {}", self.id, e);
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        *self.worker_handle() = Some(tokio::spawn(task));
    }

    fn recorder(&self, job_id: &str) -> JobRecorder {
        JobRecorder::new(
            &self.id,
            job_id,
            Arc::clone(&self.slot),
            self.settings.log_capacity,
        )
    }

    /// Write the latest job state to disk
    async fn persist(&self) {
        self.store
            .persist_job_with(&self.id, || self.slot.borrow().as_ref().cloned())
            .await;
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.slot.borrow().as_ref().map(|job| job.status)
    }

    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.slot
            .borrow()
            .as_ref()
            .map(|job| snapshot(job, self.settings.status_log_tail))
    }

    fn current_snapshot(&self) -> Result<JobSnapshot> {
        self.snapshot().ok_or_else(|| {
            Error::InvalidJobState(format!("no rolling update on cluster {}", self.id))
        })
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<Job>> {
        self.slot.subscribe()
    }

    /// Current snapshot, returned early as soon as the job changes. Waits at
    /// most `wait`; a zero wait returns immediately.
    pub async fn wait_for_change(&self, wait: Duration) -> Option<JobSnapshot> {
        if !wait.is_zero() {
            let mut rx = self.slot.subscribe();
            let _ = timeout(wait, rx.changed()).await;
        }
        self.snapshot()
    }

    /// Probe every node of the cluster for pending packages
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn check_updates(&self) -> Result<ClusterUpdateSummary> {
        let nodes = self.node_names().await?;
        Ok(check_nodes(
            self.backend.as_ref(),
            &nodes,
            true,
            self.settings.timings.check_timeout,
        )
        .await)
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .backend
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Start a rolling update over `nodes` (all nodes in name order when
    /// `None` or empty). Fails while another job holds the cluster.
    #[instrument(skip(self, options), fields(cluster = %self.id))]
    pub async fn start(
        self: &Arc<Self>,
        nodes: Option<Vec<String>>,
        options: UpdateOptions,
        trigger: Trigger,
    ) -> Result<JobSnapshot> {
        if let Some(status) = self.status().filter(|s| s.is_active()) {
            return Err(Error::JobActive {
                cluster: self.id.clone(),
                status: status.to_string(),
            });
        }
        if self.worker_busy() {
            return Err(Error::JobActive {
                cluster: self.id.clone(),
                status: "finishing".to_string(),
            });
        }

        let known = self.node_names().await?;
        let nodes = match nodes {
            Some(requested) if !requested.is_empty() => {
                let mut selected: Vec<String> = Vec::with_capacity(requested.len());
                for node in requested {
                    if !known.contains(&node) {
                        return Err(Error::NodeNotFound {
                            cluster: self.id.clone(),
                            node,
                        });
                    }
                    if !selected.contains(&node) {
                        selected.push(node);
                    }
                }
                selected
            }
            _ => known,
        };
        if nodes.is_empty() {
            return Err(Error::InvalidJobState(format!(
                "cluster {} has no nodes",
                self.id
            )));
        }

        let mut job = Job::new(&self.id, nodes, options, trigger);
        let job_id = job.id.clone();
        let message = format!(
            "Rolling update started ({}) on {} node(s): {}",
            match trigger {
                Trigger::Manual => "manual",
                Trigger::Scheduled => "scheduled",
            },
            job.nodes.len(),
            job.nodes.join(", ")
        );
        push_log(&mut job, self.settings.log_capacity, &message);

        // Reserve the slot atomically; a concurrent start loses here.
        let mut conflict = None;
        self.slot.send_if_modified(|slot| {
            if let Some(status) = slot.as_ref().map(|j| j.status).filter(|s| s.is_active()) {
                conflict = Some(status);
                return false;
            }
            *slot = Some(job);
            true
        });
        if let Some(status) = conflict {
            return Err(Error::JobActive {
                cluster: self.id.clone(),
                status: status.to_string(),
            });
        }

        info!("Started rolling update {} on {}", job_id, self.id);
        #[cfg(feature = "metrics")]
        metrics::record_job_started(&self.id, trigger);

        self.persist().await;
        let runtime = Arc::clone(self);
        let recorder = self.recorder(&job_id);
        self.spawn(async move { runtime.run_job(recorder, None, true).await });

        self.current_snapshot()
    }

    /// Resume a paused job. A job paused on evacuation failures re-attempts
    /// evacuation of the same node (still in maintenance); a manually
    /// paused job continues with the next unprocessed node.
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn resume(self: &Arc<Self>) -> Result<JobSnapshot> {
        if self.worker_busy() {
            return Err(Error::InvalidJobState(
                "the previous worker is still finishing, retry shortly".to_string(),
            ));
        }

        let capacity = self.settings.log_capacity;
        let mut outcome = Err(Error::InvalidJobState(format!(
            "no rolling update on cluster {}",
            self.id
        )));
        self.slot.send_if_modified(|slot| {
            let Some(job) = slot.as_mut() else {
                return false;
            };
            if job.status != JobStatus::Paused {
                outcome = Err(Error::InvalidJobState(format!(
                    "job is {}, only a paused job can be resumed",
                    job.status
                )));
                return false;
            }
            let resume_at = match job.paused_reason {
                Some(PausedReason::EvacuationFailures) => Some(Step::Evacuating),
                _ => None,
            };
            job.status = JobStatus::Running;
            job.paused_reason = None;
            job.paused_details = None;
            job.pause_requested = false;
            push_log(job, capacity, "Resumed by operator");
            outcome = Ok((job.id.clone(), resume_at));
            true
        });
        let (job_id, resume_at) = outcome?;

        info!("Resumed rolling update {} on {}", job_id, self.id);
        self.persist().await;
        let runtime = Arc::clone(self);
        let recorder = self.recorder(&job_id);
        self.spawn(async move { runtime.run_job(recorder, resume_at, false).await });

        self.current_snapshot()
    }

    /// Ask a running job to pause once the node in flight is done
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn pause(&self) -> Result<JobSnapshot> {
        let capacity = self.settings.log_capacity;
        let mut outcome = Err(Error::InvalidJobState(format!(
            "no rolling update on cluster {}",
            self.id
        )));
        self.slot.send_if_modified(|slot| {
            let Some(job) = slot.as_mut() else {
                return false;
            };
            if job.status != JobStatus::Running {
                outcome = Err(Error::InvalidJobState(format!(
                    "job is {}, only a running job can be paused",
                    job.status
                )));
                return false;
            }
            outcome = Ok(());
            if job.pause_requested {
                return false;
            }
            job.pause_requested = true;
            let message = match &job.current_node {
                Some(node) => format!("Pause requested, pausing once {} is done", node),
                None => "Pause requested".to_string(),
            };
            push_log(job, capacity, &message);
            true
        });
        outcome?;

        info!("Pause requested for {}", self.id);
        self.persist().await;
        self.current_snapshot()
    }

    /// Cancel a running or paused job. The status flips at once; a running
    /// worker notices between steps. A node left in maintenance by an
    /// evacuation pause is released in the background.
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn cancel(self: &Arc<Self>) -> Result<JobSnapshot> {
        let capacity = self.settings.log_capacity;
        let mut outcome = Err(Error::InvalidJobState(format!(
            "no rolling update on cluster {}",
            self.id
        )));
        self.slot.send_if_modified(|slot| {
            let Some(job) = slot.as_mut() else {
                return false;
            };
            if !job.status.is_active() {
                outcome = Err(Error::InvalidJobState(format!(
                    "job is already {}",
                    job.status
                )));
                return false;
            }
            let release = if job.paused_reason == Some(PausedReason::EvacuationFailures) {
                job.current_node.clone()
            } else {
                None
            };
            job.pause_requested = false;
            job.finish(JobStatus::Cancelled);
            push_log(job, capacity, "Cancelled by operator");
            outcome = Ok((job.id.clone(), release));
            true
        });
        let (job_id, release) = outcome?;

        info!("Cancelled rolling update {} on {}", job_id, self.id);
        #[cfg(feature = "metrics")]
        metrics::record_job_finished(&self.id, JobStatus::Cancelled);
        self.persist().await;

        if let Some(node) = release {
            let runtime = Arc::clone(self);
            let recorder = self.recorder(&job_id);
            self.spawn(async move {
                runtime.release_node(&recorder, &node).await;
                runtime.persist().await;
            });
        }

        self.current_snapshot()
    }

    /// Forget a finished job. Clearing an empty slot is a no-op.
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn clear(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.slot.send_if_modified(|slot| {
            match slot.as_ref().map(|j| j.status) {
                Some(status) if status.is_terminal() => {
                    *slot = None;
                    true
                }
                Some(status) => {
                    outcome = Err(Error::InvalidJobState(format!(
                        "cannot clear a {} job, cancel it first",
                        status
                    )));
                    false
                }
                None => false,
            }
        });
        outcome?;
        self.store
            .save_job_with(&self.id, || self.slot.borrow().as_ref().cloned())
            .await
    }

    /// Patch one node outside of any job
    #[instrument(skip(self), fields(cluster = %self.id))]
    pub async fn update_single_node(
        &self,
        node: &str,
        reboot: bool,
        force: bool,
    ) -> Result<CommandOutput> {
        if let Some(status) = self.status().filter(|s| s.is_active()) {
            return Err(Error::JobActive {
                cluster: self.id.clone(),
                status: status.to_string(),
            });
        }

        let info = self
            .backend
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.name == node)
            .ok_or_else(|| Error::NodeNotFound {
                cluster: self.id.clone(),
                node: node.to_string(),
            })?;
        if !info.maintenance {
            if !force {
                return Err(Error::MaintenanceRequired(node.to_string()));
            }
            warn!("Forcing update of {} outside maintenance mode", node);
        }

        info!("Updating single node {} on {}", node, self.id);
        let update_timeout = self.settings.timings.update_timeout;
        let output = timeout(update_timeout, self.backend.run_update(node))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "update on {} did not finish within {}s",
                    node,
                    update_timeout.as_secs()
                ))
            })??;
        if !output.success() {
            return Err(Error::CommandFailed {
                node: node.to_string(),
                code: output.exit_code,
                output: output.output,
            });
        }

        if reboot {
            info!("Rebooting {} after single-node update", node);
            self.backend.reboot(node).await?;
        }
        Ok(output)
    }

    /// Load the persisted job after a process restart. A job that was running
    /// had its worker killed with the process, so it is marked failed. Paused
    /// jobs had no worker and stay resumable.
    pub async fn recover(&self) -> Result<()> {
        let Some(mut job) = self.store.load_job(&self.id).await? else {
            return Ok(());
        };

        match job.status {
            JobStatus::Running => {
                warn!("Job {} on {} was interrupted by a restart", job.id, self.id);
                let mut message = "Orchestrator restarted while the job was running".to_string();
                if let Some(node) = &job.current_node {
                    message.push_str(&format!(", {} may still be in maintenance mode", node));
                }
                push_log(&mut job, self.settings.log_capacity, &message);
                job.pause_requested = false;
                job.error = Some(RESTART_ERROR.to_string());
                job.finish(JobStatus::Failed);
            }
            JobStatus::Paused => {
                info!("Restored paused job {} on {}", job.id, self.id);
            }
            _ => debug!("Restored {} job {} on {}", job.status, job.id, self.id),
        }

        self.slot.send_replace(Some(job));
        self.persist().await;
        Ok(())
    }

    async fn release_node(&self, recorder: &JobRecorder, node: &str) {
        recorder.log(&format!("Exiting maintenance mode on {}", node));
        if let Err(e) = self.backend.exit_maintenance(node).await {
            warn!("Releasing {} failed: {}", node, e);
            recorder.log(&format!(
                "Warning: {} could not leave maintenance: {}",
                node, e
            ));
        }
    }

    /// Record nodes with nothing to install as done before the walk starts
    async fn filter_up_to_date(&self, recorder: &JobRecorder, nodes: &[String]) {
        recorder.log(&format!("Checking {} node(s) for pending updates", nodes.len()));
        let summary = check_nodes(
            self.backend.as_ref(),
            nodes,
            true,
            self.settings.timings.check_timeout,
        )
        .await;
        for check in summary.per_node {
            if !check.success {
                recorder.log(&format!(
                    "Warning: update check on {} failed ({}), it will be re-checked",
                    check.node,
                    check.error.unwrap_or_default()
                ));
            } else if check.count == 0 {
                recorder.log(&format!("{} is up to date, skipping", check.node));
                recorder.update(|job| {
                    job.completed_nodes.push(check.node.clone());
                    job.skipped_nodes.push(check.node.clone());
                });
            }
        }
    }

    /// Worker body; runs until the job pauses, halts, finishes, or is
    /// cancelled or cleared.
    async fn run_job(self: Arc<Self>, recorder: JobRecorder, mut resume_at: Option<Step>, capture: bool) {
        let Some(job) = recorder.current() else {
            return;
        };
        let options = job.options.clone();
        let policy = job.evacuation_policy();

        if capture && options.skip_up_to_date {
            self.filter_up_to_date(&recorder, &job.nodes).await;
            self.persist().await;
        }

        let executor =
            NodeUpdateExecutor::new(self.backend.as_ref(), &recorder, &self.settings.timings);

        loop {
            let Some(job) = recorder.current() else {
                debug!("Job {} was cleared, worker exiting", recorder.job_id());
                return;
            };
            if job.status != JobStatus::Running {
                recorder.log(&format!(
                    "Stopped ({}), not processed: {}",
                    job.status,
                    describe(&job.remaining_nodes())
                ));
                self.persist().await;
                return;
            }
            if job.pause_requested {
                self.pause_between_nodes(&recorder, &job);
                self.persist().await;
                return;
            }

            let Some(index) = (0..job.nodes.len()).find(|&i| !job.is_settled(&job.nodes[i])) else {
                self.complete(&recorder);
                self.persist().await;
                return;
            };
            let node = job.nodes[index].clone();
            recorder.update(|job| {
                job.current_index = index;
                job.current_node = Some(node.clone());
            });
            recorder.log(&format!(
                "Processing {} ({}/{})",
                node,
                index + 1,
                job.nodes.len()
            ));
            self.persist().await;

            let outcome = executor
                .run(&node, &options, policy, resume_at.take())
                .await;
            #[cfg(feature = "metrics")]
            metrics::record_node_outcome(&self.id, outcome.label());

            match outcome {
                NodeOutcome::Completed => {
                    recorder.update(|job| job.completed_nodes.push(node.clone()));
                }
                NodeOutcome::UpToDate => {
                    recorder.update(|job| {
                        job.completed_nodes.push(node.clone());
                        job.skipped_nodes.push(node.clone());
                    });
                }
                NodeOutcome::Paused { reason, details } => {
                    let message = details.message.clone();
                    let mut paused = false;
                    recorder.update(|job| {
                        if job.status == JobStatus::Running {
                            job.status = JobStatus::Paused;
                            job.paused_reason = Some(reason);
                            job.paused_details = Some(details);
                            paused = true;
                        }
                    });
                    if paused {
                        recorder.log(&format!("Rolling update paused: {}", message));
                        self.persist().await;
                        return;
                    }
                    // Cancelled while draining: nobody will resume this node.
                    self.release_node(&recorder, &node).await;
                }
                NodeOutcome::Failed { kind, error } => {
                    let halt = kind.halts_job() && !options.continue_on_failure;
                    let mut halted = false;
                    recorder.update(|job| {
                        job.failed_nodes.push(FailedNode {
                            node: node.clone(),
                            kind,
                            error: error.clone(),
                        });
                        if halt && job.status == JobStatus::Running {
                            job.error = Some(format!("Update failed on {}: {}", node, error));
                            job.finish(JobStatus::Failed);
                            halted = true;
                        }
                    });
                    if halted {
                        let remaining = recorder
                            .current()
                            .map(|job| job.remaining_nodes())
                            .unwrap_or_default();
                        recorder.log(&format!(
                            "Rolling update aborted after failure on {}, not processed: {}",
                            node,
                            describe(&remaining)
                        ));
                        #[cfg(feature = "metrics")]
                        metrics::record_job_finished(&self.id, JobStatus::Failed);
                        self.persist().await;
                        return;
                    }
                }
                NodeOutcome::Cancelled => {}
            }
            self.persist().await;
        }
    }

    fn pause_between_nodes(&self, recorder: &JobRecorder, job: &Job) {
        let next = job.remaining_nodes().into_iter().next();
        let message = match &next {
            Some(node) => format!("Paused by operator, resume continues with {}", node),
            None => "Paused by operator".to_string(),
        };
        recorder.update(|job| {
            job.status = JobStatus::Paused;
            job.pause_requested = false;
            job.current_step = None;
            job.current_node = next;
            job.paused_reason = Some(PausedReason::Manual);
            job.paused_details = Some(PausedDetails {
                message: message.clone(),
                failed_vms: Vec::new(),
            });
        });
        recorder.log(&message);
    }

    /// Every node has an outcome: completed when none failed
    fn complete(&self, recorder: &JobRecorder) {
        let mut finished = None;
        recorder.update(|job| {
            if job.status != JobStatus::Running {
                return;
            }
            let status = if job.failed_nodes.is_empty() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            if status == JobStatus::Failed && job.error.is_none() {
                let names: Vec<String> = job.failed_nodes.iter().map(|f| f.node.clone()).collect();
                job.error = Some(format!(
                    "{} node(s) failed: {}",
                    names.len(),
                    names.join(", ")
                ));
            }
            job.current_node = None;
            job.finish(status);
            finished = Some((
                status,
                job.completed_nodes.len() - job.skipped_nodes.len(),
                job.skipped_nodes.len(),
                job.failed_nodes.len(),
            ));
        });

        if let Some((status, updated, skipped, failed)) = finished {
            recorder.log(&format!(
                "Rolling update {}: {} updated, {} already up to date, {} failed",
                status, updated, skipped, failed
            ));
            #[cfg(feature = "metrics")]
            metrics::record_job_finished(&self.id, status);
        }
    }
}

fn describe(nodes: &[String]) -> String {
    if nodes.is_empty() {
        "none".to_string()
    } else {
        nodes.join(", ")
    }
}
