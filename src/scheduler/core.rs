use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use super::schedule::{Due, Schedule, ScheduleType};
use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::update::{ClusterRuntime, Trigger};

/// Clusters the scheduler may start jobs on, keyed by id
pub type ClusterMap = BTreeMap<String, Arc<ClusterRuntime>>;

/// Fires unattended rolling updates when a cluster's window opens
pub struct UpdateScheduler {
    store: Arc<StateStore>,
    schedules: Mutex<BTreeMap<String, Schedule>>,
    misfire_grace: chrono::Duration,
}

impl UpdateScheduler {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            schedules: Mutex::new(BTreeMap::new()),
            misfire_grace: chrono::Duration::minutes(15),
        }
    }

    pub fn with_misfire_grace(mut self, grace: chrono::Duration) -> Self {
        self.misfire_grace = grace;
        self
    }

    /// Load persisted schedules for `clusters`
    pub async fn load<'a, I>(&self, clusters: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut schedules = self.schedules.lock().await;
        for cluster in clusters {
            if let Some(mut schedule) = self.store.load_schedule(cluster).await? {
                if schedule.enabled && schedule.next_run.is_none() {
                    schedule.refresh_next_run(Local::now())?;
                }
                info!(
                    "Loaded schedule for {} (enabled: {}, next run: {:?})",
                    cluster, schedule.enabled, schedule.next_run
                );
                schedules.insert(cluster.clone(), schedule);
            }
        }
        Ok(())
    }

    /// The cluster's schedule, or the disabled default
    pub async fn get(&self, cluster: &str) -> Schedule {
        self.schedules
            .lock()
            .await
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set(&self, cluster: &str, mut schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;
        let mut schedules = self.schedules.lock().await;
        // Bookkeeping is ours; keep the previous last_run.
        schedule.last_run = schedules.get(cluster).and_then(|s| s.last_run);
        schedule.refresh_next_run(Local::now())?;

        self.store.save_schedule(cluster, &schedule).await?;
        info!(
            "Schedule for {} saved: {} {} {} (next run: {:?})",
            cluster,
            if schedule.enabled { "enabled" } else { "disabled" },
            schedule.day,
            schedule.time,
            schedule.next_run
        );
        schedules.insert(cluster.to_string(), schedule.clone());
        Ok(schedule)
    }

    pub async fn delete(&self, cluster: &str) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        self.store.delete_schedule(cluster).await?;
        if schedules.remove(cluster).is_some() {
            info!("Schedule for {} deleted", cluster);
        }
        Ok(())
    }

    /// Handle every schedule whose window opened by `now`. Returns the
    /// clusters a job was started on.
    ///
    /// Jobs are started without holding the schedule lock, so a slow backend
    /// never blocks reads or edits of other schedules.
    pub async fn tick(&self, clusters: &ClusterMap, now: DateTime<Local>) -> Vec<String> {
        let due: Vec<(String, Due, Schedule)> = {
            let schedules = self.schedules.lock().await;
            schedules
                .iter()
                .filter_map(|(cluster, schedule)| {
                    let due = schedule.due(now, self.misfire_grace);
                    (due != Due::NotDue).then(|| (cluster.clone(), due, schedule.clone()))
                })
                .collect()
        };

        let mut started = Vec::new();
        for (cluster, due, seen) in due {
            let fired = match (due, clusters.get(&cluster)) {
                (Due::Missed, _) => {
                    warn!(
                        "Missed update window for {} ({:?}), waiting for the next one",
                        cluster, seen.next_run
                    );
                    false
                }
                (_, None) => {
                    warn!("Schedule for unknown cluster {}, ignoring", cluster);
                    false
                }
                (_, Some(runtime)) => match self.fire(runtime, &seen).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Scheduled update on {} skipped: {}", cluster, e);
                        false
                    }
                },
            };
            if fired {
                started.push(cluster.clone());
            }
            self.settle(&cluster, &seen, fired, now).await;
        }

        started
    }

    /// Record a handled window. A schedule replaced or deleted while its job
    /// was starting keeps the operator's version.
    async fn settle(&self, cluster: &str, seen: &Schedule, fired: bool, now: DateTime<Local>) {
        let mut schedules = self.schedules.lock().await;
        let Some(schedule) = schedules.get_mut(cluster) else {
            return;
        };
        let replaced = *schedule != *seen;
        if fired {
            schedule.last_run = Some(now);
        }
        if !replaced {
            if let Err(e) = schedule.advance(now) {
                error!("Cannot compute next run for {}: {}", cluster, e);
                schedule.enabled = false;
                schedule.next_run = None;
            }
            if schedule.schedule_type == ScheduleType::Once {
                info!("One-time schedule for {} disabled", cluster);
            }
        }
        if let Err(e) = self.store.save_schedule(cluster, schedule).await {
            warn!("Failed to persist schedule for {}: {}", cluster, e);
        }
    }

    async fn fire(&self, runtime: &Arc<ClusterRuntime>, schedule: &Schedule) -> Result<()> {
        if let Some(status) = runtime.status().filter(|s| s.is_active()) {
            return Err(Error::JobActive {
                cluster: runtime.id().to_string(),
                status: status.to_string(),
            });
        }
        info!("Starting scheduled rolling update on {}", runtime.id());
        let options = schedule.options.clone().unattended();
        runtime.start(None, options, Trigger::Scheduled).await?;
        Ok(())
    }

    /// Tick forever
    pub async fn run(self: Arc<Self>, clusters: Arc<ClusterMap>, interval: Duration) {
        info!(
            "Starting update scheduler (checking every {}s)",
            interval.as_secs()
        );
        loop {
            let started = self.tick(&clusters, Local::now()).await;
            if !started.is_empty() {
                info!("Scheduled updates started on: {}", started.join(", "));
            }
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SimulatedCluster;
    use crate::update::{JobStatus, RuntimeSettings};

    struct Fixture {
        _dir: tempfile::TempDir,
        sim: SimulatedCluster,
        clusters: ClusterMap,
        scheduler: UpdateScheduler,
        store: Arc<StateStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let sim = SimulatedCluster::new(["a", "b"]);
        let runtime = Arc::new(ClusterRuntime::new(
            "lab",
            Arc::new(sim.clone()),
            Arc::clone(&store),
            RuntimeSettings::default(),
        ));
        let mut clusters = ClusterMap::new();
        clusters.insert("lab".to_string(), runtime);
        Fixture {
            _dir: dir,
            sim,
            clusters,
            scheduler: UpdateScheduler::new(Arc::clone(&store)),
            store,
        }
    }

    async fn enable(f: &Fixture, schedule_type: ScheduleType) -> Schedule {
        let schedule = Schedule {
            enabled: true,
            schedule_type,
            options: crate::update::UpdateOptions::default(),
            ..Default::default()
        };
        f.scheduler.set("lab", schedule).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_computes_next_run_and_persists() {
        let f = fixture();
        let saved = enable(&f, ScheduleType::Recurring).await;
        assert!(saved.next_run.is_some());
        assert_eq!(f.store.load_schedule("lab").await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_not_due_does_nothing() {
        let f = fixture();
        let saved = enable(&f, ScheduleType::Recurring).await;
        let before = saved.next_run.unwrap() - chrono::Duration::minutes(1);

        assert!(f.scheduler.tick(&f.clusters, before).await.is_empty());
        assert!(f.clusters["lab"].snapshot().is_none());
    }

    #[tokio::test]
    async fn test_once_schedule_fires_then_disables() {
        let f = fixture();
        f.sim.add_package("a", "curl");
        let saved = enable(&f, ScheduleType::Once).await;
        let window = saved.next_run.unwrap();

        let started = f.scheduler.tick(&f.clusters, window).await;
        assert_eq!(started, vec!["lab".to_string()]);

        let runtime = &f.clusters["lab"];
        runtime.wait_for_worker().await;
        let snap = runtime.snapshot().unwrap();
        assert_eq!(snap.trigger, Trigger::Scheduled);
        assert_eq!(snap.status, JobStatus::Completed);
        assert!(!snap.options.pause_on_evacuation_error);

        let after = f.scheduler.get("lab").await;
        assert!(!after.enabled);
        assert!(after.next_run.is_none());
        assert_eq!(after.last_run, Some(window));
    }

    #[tokio::test]
    async fn test_recurring_skips_while_job_active_and_advances() {
        let f = fixture();
        f.sim.add_package("a", "curl");
        f.sim.add_vm("a", 101, "pinned");
        f.sim.stick_workload(101, "local resources");
        let runtime = Arc::clone(&f.clusters["lab"]);
        // Manual job pauses on the stuck guest and keeps the cluster busy.
        runtime
            .start(None, crate::update::UpdateOptions::default(), Trigger::Manual)
            .await
            .unwrap();
        runtime.wait_for_worker().await;
        assert_eq!(runtime.status(), Some(JobStatus::Paused));

        let saved = enable(&f, ScheduleType::Recurring).await;
        let window = saved.next_run.unwrap();
        assert!(f.scheduler.tick(&f.clusters, window).await.is_empty());

        let after = f.scheduler.get("lab").await;
        assert!(after.enabled);
        assert!(after.next_run.unwrap() > window);
        assert_eq!(after.last_run, None);
        assert_eq!(runtime.snapshot().unwrap().trigger, Trigger::Manual);
    }

    #[tokio::test]
    async fn test_schedule_readable_while_job_is_starting() {
        let f = fixture();
        f.sim.add_package("a", "curl");
        let saved = enable(&f, ScheduleType::Recurring).await;
        let window = saved.next_run.unwrap();
        f.sim.set_node_listing_delay(Duration::from_millis(500));

        let read = async {
            sleep(Duration::from_millis(50)).await;
            let asked = tokio::time::Instant::now();
            let schedule = f.scheduler.get("lab").await;
            (schedule, asked.elapsed())
        };
        let (started, (during, waited)) = tokio::join!(f.scheduler.tick(&f.clusters, window), read);

        assert_eq!(started, vec!["lab".to_string()]);
        assert!(waited < Duration::from_millis(250), "read waited {:?}", waited);
        assert_eq!(during.last_run, None);

        let after = f.scheduler.get("lab").await;
        assert_eq!(after.last_run, Some(window));
        assert!(after.next_run.unwrap() > window);
        f.clusters["lab"].wait_for_worker().await;
    }

    #[tokio::test]
    async fn test_schedule_edited_during_start_is_kept() {
        let f = fixture();
        f.sim.add_package("a", "curl");
        let saved = enable(&f, ScheduleType::Recurring).await;
        let window = saved.next_run.unwrap();
        f.sim.set_node_listing_delay(Duration::from_millis(300));

        let edit = async {
            sleep(Duration::from_millis(50)).await;
            let schedule = Schedule {
                enabled: false,
                ..Default::default()
            };
            f.scheduler.set("lab", schedule).await.unwrap()
        };
        let (started, edited) = tokio::join!(f.scheduler.tick(&f.clusters, window), edit);

        assert_eq!(started, vec!["lab".to_string()]);
        let after = f.scheduler.get("lab").await;
        assert!(!after.enabled);
        assert_eq!(after.next_run, edited.next_run);
        assert_eq!(after.last_run, Some(window));
        assert_eq!(f.store.load_schedule("lab").await.unwrap(), Some(after));
        f.clusters["lab"].wait_for_worker().await;
    }

    #[tokio::test]
    async fn test_missed_window_is_not_fired() {
        let f = fixture();
        let saved = enable(&f, ScheduleType::Recurring).await;
        let late = saved.next_run.unwrap() + chrono::Duration::hours(2);

        assert!(f.scheduler.tick(&f.clusters, late).await.is_empty());
        assert!(f.clusters["lab"].snapshot().is_none());
        assert!(f.scheduler.get("lab").await.next_run.unwrap() > late);
    }

    #[tokio::test]
    async fn test_load_restores_persisted_schedule() {
        let f = fixture();
        let saved = enable(&f, ScheduleType::Recurring).await;

        let reloaded = UpdateScheduler::new(Arc::clone(&f.store));
        reloaded.load(f.clusters.keys()).await.unwrap();
        assert_eq!(reloaded.get("lab").await, saved);
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_default() {
        let f = fixture();
        enable(&f, ScheduleType::Recurring).await;
        f.scheduler.delete("lab").await.unwrap();
        assert_eq!(f.scheduler.get("lab").await, Schedule::default());
        assert!(f.store.load_schedule("lab").await.unwrap().is_none());
    }
}
