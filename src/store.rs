//! On-disk state: one directory per cluster holding `job.json` and
//! `schedule.json`. Files are replaced atomically via write-then-rename.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::scheduler::Schedule;
use crate::update::Job;

const JOB_FILE: &str = "job.json";
const SCHEDULE_FILE: &str = "schedule.json";

pub struct StateStore {
    root: PathBuf,
    writes: Mutex<()>,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, cluster: &str, file: &str) -> PathBuf {
        self.root.join(cluster).join(file)
    }

    async fn read<T: DeserializeOwned>(&self, path: PathBuf) -> Result<Option<T>> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_unlocked<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn remove_unlocked(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_job(&self, cluster: &str) -> Result<Option<Job>> {
        self.read(self.path(cluster, JOB_FILE)).await
    }

    /// Persist the job, or forget it when `None`
    pub async fn save_job(&self, cluster: &str, job: Option<&Job>) -> Result<()> {
        self.save_job_with(cluster, || job.cloned()).await
    }

    /// Persist whatever `current` yields once the write lock is held, so
    /// concurrent writers always leave the latest state on disk.
    pub async fn save_job_with<F>(&self, cluster: &str, current: F) -> Result<()>
    where
        F: FnOnce() -> Option<Job>,
    {
        let path = self.path(cluster, JOB_FILE);
        let _guard = self.writes.lock().await;
        match current() {
            Some(job) => self.write_unlocked(&path, &job).await,
            None => self.remove_unlocked(&path).await,
        }
    }

    /// Best-effort variant for the worker, which has nowhere to propagate to
    pub async fn persist_job_with<F>(&self, cluster: &str, current: F)
    where
        F: FnOnce() -> Option<Job>,
    {
        if let Err(e) = self.save_job_with(cluster, current).await {
            warn!("Failed to persist job for {}: {}", cluster, e);
        }
    }

    pub async fn load_schedule(&self, cluster: &str) -> Result<Option<Schedule>> {
        self.read(self.path(cluster, SCHEDULE_FILE)).await
    }

    pub async fn save_schedule(&self, cluster: &str, schedule: &Schedule) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.write_unlocked(&self.path(cluster, SCHEDULE_FILE), schedule)
            .await
    }

    pub async fn delete_schedule(&self, cluster: &str) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.remove_unlocked(&self.path(cluster, SCHEDULE_FILE))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{Trigger, UpdateOptions};

    #[tokio::test]
    async fn test_job_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let job = Job::new("lab", vec!["a".into()], UpdateOptions::default(), Trigger::Manual);

        store.save_job("lab", Some(&job)).await.unwrap();
        assert_eq!(store.load_job("lab").await.unwrap(), Some(job));

        store.save_job("lab", None).await.unwrap();
        assert_eq!(store.load_job("lab").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_files_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load_schedule("nowhere").await.unwrap().is_none());
        store.delete_schedule("nowhere").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lab")).unwrap();
        std::fs::write(dir.path().join("lab").join(JOB_FILE), b"{not json").unwrap();

        let store = StateStore::new(dir.path());
        assert!(store.load_job("lab").await.is_err());
    }
}
