//! Control surface over every configured cluster
//!
//! Thin routing layer: resolves the cluster id and delegates to the
//! cluster's [`ClusterRuntime`] or to the [`UpdateScheduler`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::cluster::{ClusterBackend, CommandOutput};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::{ClusterMap, Schedule, UpdateScheduler};
use crate::store::StateStore;
use crate::update::{
    ClusterRuntime, ClusterUpdateSummary, JobSnapshot, JobStatus, RuntimeSettings, Trigger,
    UpdateOptions,
};

/// Longest long-poll a caller may ask for
pub const MAX_STATUS_WAIT: Duration = Duration::from_secs(60);

/// One line of the cluster listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: String,
    pub job_status: Option<JobStatus>,
    pub schedule_enabled: bool,
    pub next_scheduled_run: Option<DateTime<Local>>,
}

pub struct Orchestrator {
    clusters: Arc<ClusterMap>,
    scheduler: Arc<UpdateScheduler>,
}

impl Orchestrator {
    /// Wire up runtimes for `backends`, restoring persisted jobs and
    /// schedules from `store`.
    pub async fn new(
        store: Arc<StateStore>,
        backends: Vec<(String, Arc<dyn ClusterBackend>)>,
        settings: RuntimeSettings,
    ) -> Result<Self> {
        let mut clusters = ClusterMap::new();
        for (id, backend) in backends {
            let runtime = Arc::new(ClusterRuntime::new(
                &id,
                backend,
                Arc::clone(&store),
                settings.clone(),
            ));
            runtime.recover().await?;
            clusters.insert(id, runtime);
        }

        let scheduler = UpdateScheduler::new(Arc::clone(&store));
        scheduler.load(clusters.keys()).await?;

        Ok(Self {
            clusters: Arc::new(clusters),
            scheduler: Arc::new(scheduler),
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(StateStore::new(&config.state_dir));
        let mut backends = Vec::with_capacity(config.clusters.len());
        for cluster in &config.clusters {
            info!(
                "Configuring cluster {} ({} backend)",
                cluster.id,
                cluster.backend.kind()
            );
            backends.push((cluster.id.clone(), cluster.backend.build()?));
        }
        Self::new(store, backends, config.timings.runtime_settings()).await
    }

    pub fn cluster(&self, id: &str) -> Result<&Arc<ClusterRuntime>> {
        self.clusters
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    /// Start the scheduler loop in the background
    pub fn spawn_scheduler(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let clusters = Arc::clone(&self.clusters);
        tokio::spawn(scheduler.run(clusters, interval))
    }

    pub async fn list_clusters(&self) -> Vec<ClusterSummary> {
        let mut out = Vec::with_capacity(self.clusters.len());
        for (id, runtime) in self.clusters.iter() {
            let schedule = self.scheduler.get(id).await;
            out.push(ClusterSummary {
                id: id.clone(),
                job_status: runtime.status(),
                schedule_enabled: schedule.enabled,
                next_scheduled_run: schedule.next_run,
            });
        }
        out
    }

    #[instrument(skip(self))]
    pub async fn check_updates(&self, cluster: &str) -> Result<ClusterUpdateSummary> {
        self.cluster(cluster)?.check_updates().await
    }

    #[instrument(skip(self, options))]
    pub async fn start_rolling_update(
        &self,
        cluster: &str,
        nodes: Option<Vec<String>>,
        options: UpdateOptions,
    ) -> Result<JobSnapshot> {
        if options.evacuation_timeout == 0 {
            return Err(Error::ConfigError(
                "evacuation_timeout must be positive".to_string(),
            ));
        }
        self.cluster(cluster)?
            .start(nodes, options, Trigger::Manual)
            .await
    }

    /// Current job, waiting up to `wait` (capped) for it to change first
    pub async fn get_rolling_status(
        &self,
        cluster: &str,
        wait: Option<Duration>,
    ) -> Result<Option<JobSnapshot>> {
        let runtime = self.cluster(cluster)?;
        let wait = wait.unwrap_or(Duration::ZERO).min(MAX_STATUS_WAIT);
        Ok(runtime.wait_for_change(wait).await)
    }

    pub async fn cancel_rolling_update(&self, cluster: &str) -> Result<JobSnapshot> {
        self.cluster(cluster)?.cancel().await
    }

    pub async fn resume_rolling_update(&self, cluster: &str) -> Result<JobSnapshot> {
        self.cluster(cluster)?.resume().await
    }

    pub async fn pause_rolling_update(&self, cluster: &str) -> Result<JobSnapshot> {
        self.cluster(cluster)?.pause().await
    }

    pub async fn clear_rolling_update(&self, cluster: &str) -> Result<()> {
        self.cluster(cluster)?.clear().await
    }

    pub async fn update_single_node(
        &self,
        cluster: &str,
        node: &str,
        reboot: bool,
        force: bool,
    ) -> Result<CommandOutput> {
        self.cluster(cluster)?
            .update_single_node(node, reboot, force)
            .await
    }

    pub async fn get_schedule(&self, cluster: &str) -> Result<Schedule> {
        self.cluster(cluster)?;
        Ok(self.scheduler.get(cluster).await)
    }

    pub async fn set_schedule(&self, cluster: &str, schedule: Schedule) -> Result<Schedule> {
        self.cluster(cluster)?;
        self.scheduler.set(cluster, schedule).await
    }

    pub async fn delete_schedule(&self, cluster: &str) -> Result<()> {
        self.cluster(cluster)?;
        self.scheduler.delete(cluster).await
    }

    /// Run one scheduler pass at `now`
    pub async fn run_scheduler_tick(&self, now: DateTime<Local>) -> Vec<String> {
        self.scheduler.tick(&self.clusters, now).await
    }
}
