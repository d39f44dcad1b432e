//! Job event log and status snapshots
//!
//! Each cluster keeps its job in a `watch` channel. The worker is the only
//! writer; pollers clone a snapshot out of it or wait for the next change.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::watch;
use tracing::info;

use super::types::{Job, JobSnapshot, JobStatus, Step};

pub type JobSlot = Arc<watch::Sender<Option<Job>>>;

/// Append a timestamped line, dropping the oldest beyond `capacity`
pub fn push_log(job: &mut Job, capacity: usize, message: &str) {
    job.logs
        .push_back(format!("[{}] {}", Local::now().format("%H:%M:%S"), message));
    while job.logs.len() > capacity.max(1) {
        job.logs.pop_front();
    }
}

/// Read-only view with the last `tail` log lines
pub fn snapshot(job: &Job, tail: usize) -> JobSnapshot {
    let skip = job.logs.len().saturating_sub(tail);
    let processed = job.completed_nodes.len() + job.failed_nodes.len();
    JobSnapshot {
        id: job.id.clone(),
        status: job.status,
        trigger: job.trigger,
        nodes: job.nodes.clone(),
        current_index: job.current_index,
        current_node: job.current_node.clone(),
        current_step: job.current_step,
        completed_nodes: job.completed_nodes.clone(),
        skipped_nodes: job.skipped_nodes.clone(),
        failed_nodes: job.failed_nodes.clone(),
        remaining_nodes: job.remaining_nodes(),
        progress: format!("{}/{}", processed, job.nodes.len()),
        options: job.options.clone(),
        paused_reason: job.paused_reason,
        paused_details: job.paused_details.clone(),
        logs: job.logs.iter().skip(skip).cloned().collect(),
        log_count: job.logs.len(),
        started_at: job.started_at,
        completed_at: job.completed_at,
        error: job.error.clone(),
    }
}

/// Write handle bound to one job. Writes are dropped once the slot holds a
/// different job, so a straggling worker cannot touch its successor.
#[derive(Clone)]
pub struct JobRecorder {
    cluster: String,
    job_id: String,
    slot: JobSlot,
    capacity: usize,
}

impl JobRecorder {
    pub fn new(cluster: &str, job_id: &str, slot: JobSlot, capacity: usize) -> Self {
        Self {
            cluster: cluster.to_string(),
            job_id: job_id.to_string(),
            slot,
            capacity,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Mutate the job in place; returns false when the job is gone
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let job_id = &self.job_id;
        self.slot.send_if_modified(|slot| match slot {
            Some(job) if &job.id == job_id => {
                f(job);
                true
            }
            _ => false,
        })
    }

    pub fn log(&self, message: &str) {
        info!(cluster = %self.cluster, job = %self.job_id, "{}", message);
        let capacity = self.capacity;
        self.update(|job| push_log(job, capacity, message));
    }

    /// Record a step transition for a node together with its log line
    pub fn step(&self, node: &str, step: Step, message: &str) {
        info!(cluster = %self.cluster, node = %node, step = %step, "{}", message);
        let capacity = self.capacity;
        self.update(|job| {
            job.current_step = Some(step);
            push_log(job, capacity, message);
        });
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.slot
            .borrow()
            .as_ref()
            .filter(|job| job.id == self.job_id)
            .map(|job| job.status)
    }

    /// Cancelled, replaced, or otherwise no longer running
    pub fn should_stop(&self) -> bool {
        self.status() != Some(JobStatus::Running)
    }

    pub fn current(&self) -> Option<Job> {
        self.slot
            .borrow()
            .as_ref()
            .filter(|job| job.id == self.job_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::types::{Trigger, UpdateOptions};

    fn slot_with_job() -> (JobSlot, String) {
        let job = Job::new("lab", vec!["a".into()], UpdateOptions::default(), Trigger::Manual);
        let id = job.id.clone();
        let (tx, _rx) = watch::channel(Some(job));
        (Arc::new(tx), id)
    }

    #[test]
    fn test_log_capacity_drops_oldest() {
        let (slot, id) = slot_with_job();
        let recorder = JobRecorder::new("lab", &id, slot.clone(), 3);
        for i in 0..5 {
            recorder.log(&format!("line {}", i));
        }
        let job = recorder.current().unwrap();
        assert_eq!(job.logs.len(), 3);
        assert!(job.logs[0].ends_with("line 2"));
        assert!(job.logs[2].ends_with("line 4"));
    }

    #[test]
    fn test_snapshot_tail() {
        let (slot, id) = slot_with_job();
        let recorder = JobRecorder::new("lab", &id, slot, 100);
        for i in 0..10 {
            recorder.log(&format!("line {}", i));
        }
        let snap = snapshot(&recorder.current().unwrap(), 4);
        assert_eq!(snap.logs.len(), 4);
        assert_eq!(snap.log_count, 10);
        assert!(snap.logs[3].ends_with("line 9"));
        assert_eq!(snap.remaining_nodes, vec!["a".to_string()]);
        assert_eq!(snap.progress, "0/1");
    }

    #[test]
    fn test_writes_ignored_after_job_replaced() {
        let (slot, id) = slot_with_job();
        let recorder = JobRecorder::new("lab", &id, slot.clone(), 100);

        let mut other = Job::new("lab", vec!["b".into()], UpdateOptions::default(), Trigger::Manual);
        other.id = "replacement".to_string();
        slot.send_replace(Some(other));

        assert!(!recorder.update(|job| job.current_index = 7));
        assert!(recorder.should_stop());
        assert_eq!(slot.borrow().as_ref().unwrap().current_index, 0);
    }

    #[tokio::test]
    async fn test_pollers_see_step_changes() {
        let (slot, id) = slot_with_job();
        let mut rx = slot.subscribe();
        let recorder = JobRecorder::new("lab", &id, slot, 100);

        recorder.step("a", Step::Evacuating, "Evacuating a");

        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().as_ref().unwrap().current_step,
            Some(Step::Evacuating)
        );
    }
}
