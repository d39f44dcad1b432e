//! End-to-end rolling update scenarios against the simulated backend

use std::sync::Arc;
use std::time::Duration;

use rolling_updater::cluster::{ClusterBackend, SimulatedCluster};
use rolling_updater::scheduler::{Schedule, ScheduleType};
use rolling_updater::store::StateStore;
use rolling_updater::update::{
    FailureKind, Job, JobSnapshot, JobStatus, PausedReason, RuntimeSettings, Step, Timings,
    Trigger, UpdateOptions,
};
use rolling_updater::{Error, Orchestrator};
use tempfile::TempDir;

fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        timings: Timings {
            poll_interval: Duration::from_millis(5),
            reboot_offline_grace: Duration::from_millis(200),
            reboot_timeout: Duration::from_secs(2),
            update_timeout: Duration::from_secs(5),
            check_timeout: Duration::from_secs(1),
        },
        log_capacity: 500,
        status_log_tail: 100,
    }
}

async fn orchestrator(sim: &SimulatedCluster, dir: &TempDir) -> Orchestrator {
    Orchestrator::new(
        Arc::new(StateStore::new(dir.path())),
        vec![(
            "lab".to_string(),
            Arc::new(sim.clone()) as Arc<dyn ClusterBackend>,
        )],
        fast_settings(),
    )
    .await
    .unwrap()
}

async fn finished(orch: &Orchestrator) -> JobSnapshot {
    let runtime = orch.cluster("lab").unwrap();
    tokio::time::timeout(Duration::from_secs(10), runtime.wait_for_worker())
        .await
        .expect("worker did not finish");
    runtime.snapshot().unwrap()
}

fn three_nodes_with_updates() -> SimulatedCluster {
    let sim = SimulatedCluster::new(["a", "b", "c"]);
    for node in ["a", "b", "c"] {
        sim.add_package(node, "openssl");
    }
    sim
}

#[tokio::test]
async fn test_manual_update_with_reboot_walks_nodes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.add_vm("a", 100, "web");
    let orch = orchestrator(&sim, &dir).await;

    let options = UpdateOptions {
        include_reboot: true,
        ..Default::default()
    };
    let started = orch.start_rolling_update("lab", None, options).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert_eq!(started.trigger, Trigger::Manual);

    let snap = finished(&orch).await;
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.completed_nodes, vec!["a", "b", "c"]);
    assert!(snap.failed_nodes.is_empty());
    assert!(snap.completed_at.is_some());

    assert_eq!(
        sim.calls_of("reboot"),
        vec!["reboot:a", "reboot:b", "reboot:c"]
    );
    for node in ["a", "b", "c"] {
        let state = sim.node(node).unwrap();
        assert!(state.online);
        assert!(!state.maintenance);
        assert!(state.packages.is_empty());
    }
    assert_eq!(sim.calls_of("migrate").len(), 2);
}

#[tokio::test]
async fn test_scheduled_run_continues_past_failed_node() {
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.fail_update("b", "E: Sub-process /usr/bin/dpkg returned an error code (1)");
    let orch = orchestrator(&sim, &dir).await;

    let schedule = Schedule {
        enabled: true,
        schedule_type: ScheduleType::Recurring,
        time: "03:00".to_string(),
        ..Default::default()
    };
    let saved = orch.set_schedule("lab", schedule).await.unwrap();
    let window = saved.next_run.unwrap();

    let started = orch.run_scheduler_tick(window).await;
    assert_eq!(started, vec!["lab".to_string()]);

    let snap = finished(&orch).await;
    assert_eq!(snap.trigger, Trigger::Scheduled);
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.completed_nodes, vec!["a", "c"]);
    assert_eq!(snap.failed_nodes.len(), 1);
    assert_eq!(snap.failed_nodes[0].node, "b");
    assert_eq!(snap.failed_nodes[0].kind, FailureKind::Update);
    assert!(snap.error.unwrap().contains("b"));

    // b stays in maintenance for an operator to look at.
    assert!(sim.node("b").unwrap().maintenance);
    assert!(!sim.node("c").unwrap().maintenance);

    let after = orch.get_schedule("lab").await.unwrap();
    assert!(after.enabled);
    assert_eq!(after.last_run, Some(window));
    assert!(after.next_run.unwrap() > window);
}

#[tokio::test]
async fn test_scheduled_run_skips_node_that_cannot_be_drained() {
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.add_vm("b", 150, "pinned");
    sim.stick_workload(150, "uses local storage");
    let orch = orchestrator(&sim, &dir).await;

    let schedule = Schedule {
        enabled: true,
        schedule_type: ScheduleType::Recurring,
        time: "03:00".to_string(),
        ..Default::default()
    };
    let window = orch
        .set_schedule("lab", schedule)
        .await
        .unwrap()
        .next_run
        .unwrap();
    assert_eq!(orch.run_scheduler_tick(window).await.len(), 1);

    let snap = finished(&orch).await;
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.paused_reason, None);
    assert_eq!(snap.completed_nodes, vec!["a", "c"]);
    assert_eq!(snap.failed_nodes.len(), 1);
    assert_eq!(snap.failed_nodes[0].node, "b");
    assert_eq!(snap.failed_nodes[0].kind, FailureKind::Evacuation);
    assert_nodes_partitioned(&snap);

    // b was released untouched and c was still patched.
    assert!(!sim.node("b").unwrap().maintenance);
    assert!(sim.calls_of("update").iter().all(|c| c != "update:b"));
    assert!(sim.calls_of("update").contains(&"update:c".to_string()));
    assert_eq!(sim.node("b").unwrap().workloads.len(), 1);
}

/// Completed, failed and remaining nodes never overlap and together make up
/// the job's node list; skipped nodes are a subset of the completed ones.
fn assert_nodes_partitioned(snap: &JobSnapshot) {
    let failed: Vec<String> = snap.failed_nodes.iter().map(|f| f.node.clone()).collect();
    let mut seen: Vec<String> = snap
        .completed_nodes
        .iter()
        .chain(&failed)
        .chain(&snap.remaining_nodes)
        .cloned()
        .collect();
    seen.sort();
    let mut expected = snap.nodes.clone();
    expected.sort();
    assert_eq!(seen, expected, "node lists of job {} overlap or miss nodes", snap.id);
    assert!(snap
        .skipped_nodes
        .iter()
        .all(|n| snap.completed_nodes.contains(n)));
}

#[tokio::test]
async fn test_node_lists_partition_job_across_pause_cancel_and_halt() {
    // Paused on b's evacuation.
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.add_vm("b", 150, "pinned");
    sim.stick_workload(150, "uses local storage");
    let orch = orchestrator(&sim, &dir).await;
    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    let paused = finished(&orch).await;
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.remaining_nodes, vec!["b", "c"]);
    assert_nodes_partitioned(&paused);

    // Cancelled while a is being patched.
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.set_update_delay(Duration::from_millis(150));
    let orch = orchestrator(&sim, &dir).await;
    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    let runtime = orch.cluster("lab").unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.snapshot().and_then(|s| s.current_step) != Some(Step::Updating) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never reached the update step");
    assert_nodes_partitioned(&runtime.snapshot().unwrap());
    orch.cancel_rolling_update("lab").await.unwrap();
    let cancelled = finished(&orch).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_nodes_partitioned(&cancelled);

    // Halted by b's failed update.
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.fail_update("b", "E: dpkg was interrupted");
    let orch = orchestrator(&sim, &dir).await;
    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    let halted = finished(&orch).await;
    assert_eq!(halted.status, JobStatus::Failed);
    assert_eq!(halted.remaining_nodes, vec!["c"]);
    assert_nodes_partitioned(&halted);
}

#[tokio::test]
async fn test_hung_package_refresh_does_not_stall_job() {
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.set_refresh_delay("b", Duration::from_secs(3600));
    let orch = orchestrator(&sim, &dir).await;

    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    let snap = finished(&orch).await;

    // b could not be checked within the limit and was updated anyway.
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.completed_nodes, vec!["a", "b", "c"]);
    assert!(snap
        .logs
        .iter()
        .any(|l| l.contains("update check on b failed (update check timed out")));
    assert!(sim.calls_of("update").contains(&"update:b".to_string()));
}

#[tokio::test]
async fn test_once_schedule_disables_itself() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedCluster::new(["a"]);
    sim.add_package("a", "curl");
    let orch = orchestrator(&sim, &dir).await;

    let schedule = Schedule {
        enabled: true,
        schedule_type: ScheduleType::Once,
        ..Default::default()
    };
    let window = orch
        .set_schedule("lab", schedule)
        .await
        .unwrap()
        .next_run
        .unwrap();

    assert_eq!(orch.run_scheduler_tick(window).await.len(), 1);
    assert_eq!(finished(&orch).await.status, JobStatus::Completed);

    let after = orch.get_schedule("lab").await.unwrap();
    assert!(!after.enabled);
    assert!(after.next_run.is_none());

    // A later tick does nothing.
    let later = window + chrono::Duration::days(7);
    assert!(orch.run_scheduler_tick(later).await.is_empty());
}

#[tokio::test]
async fn test_single_job_per_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let sim = three_nodes_with_updates();
    sim.set_update_delay(Duration::from_millis(100));
    let orch = orchestrator(&sim, &dir).await;

    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    let err = orch
        .start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobActive { .. }));

    // Clearing an active job is refused as well.
    assert!(matches!(
        orch.clear_rolling_update("lab").await,
        Err(Error::InvalidJobState(_))
    ));

    assert_eq!(finished(&orch).await.status, JobStatus::Completed);
    orch.clear_rolling_update("lab").await.unwrap();
    assert!(orch.get_rolling_status("lab", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_restart_marks_running_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let job = Job::new(
        "lab",
        vec!["a".into(), "b".into()],
        UpdateOptions::default(),
        Trigger::Manual,
    );
    store.save_job("lab", Some(&job)).await.unwrap();

    let sim = SimulatedCluster::new(["a", "b"]);
    let orch = orchestrator(&sim, &dir).await;

    let snap = orch.get_rolling_status("lab", None).await.unwrap().unwrap();
    assert_eq!(snap.id, job.id);
    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.error.unwrap().contains("restarted"));

    let persisted = store.load_job("lab").await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Failed);

    // The failed job no longer blocks a new one.
    orch.start_rolling_update("lab", None, UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(finished(&orch).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_paused_job_survives_restart_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedCluster::new(["a", "b"]);
    sim.add_package("a", "curl");
    sim.add_vm("a", 200, "pinned");
    sim.stick_workload(200, "local disk");

    {
        let orch = orchestrator(&sim, &dir).await;
        orch.start_rolling_update("lab", None, UpdateOptions::default())
            .await
            .unwrap();
        let snap = finished(&orch).await;
        assert_eq!(snap.status, JobStatus::Paused);
        assert_eq!(snap.paused_reason, Some(PausedReason::EvacuationFailures));
        let details = snap.paused_details.unwrap();
        assert_eq!(details.failed_vms.len(), 1);
        assert_eq!(details.failed_vms[0].vmid, 200);
    }

    let orch = orchestrator(&sim, &dir).await;
    assert_eq!(
        orch.cluster("lab").unwrap().status(),
        Some(JobStatus::Paused)
    );

    sim.release_workload(200);
    let resumed = orch.resume_rolling_update("lab").await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);

    let snap = finished(&orch).await;
    assert_eq!(snap.status, JobStatus::Completed);
    // b is up to date and recorded at capture, ahead of a.
    let mut completed = snap.completed_nodes.clone();
    completed.sort();
    assert_eq!(completed, vec!["a", "b"]);
    assert_eq!(snap.skipped_nodes, vec!["b"]);
    assert_eq!(sim.node("b").unwrap().workloads.len(), 1);
    assert!(!sim.node("a").unwrap().maintenance);
}

#[tokio::test]
async fn test_single_node_update_outside_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedCluster::new(["a"]);
    sim.add_package("a", "curl");
    let orch = orchestrator(&sim, &dir).await;

    assert!(matches!(
        orch.update_single_node("lab", "a", false, false).await,
        Err(Error::MaintenanceRequired(_))
    ));

    let output = orch.update_single_node("lab", "a", false, true).await.unwrap();
    assert!(output.success());
    assert!(sim.node("a").unwrap().packages.is_empty());
}
