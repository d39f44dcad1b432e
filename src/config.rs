//! Configuration file
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! state_dir = "/var/lib/rolling-updater"
//!
//! [timings]
//! reboot_timeout_secs = 900
//!
//! [[clusters]]
//! id = "pve-prod"
//! backend = "proxmox"
//! api_url = "https://pve1.example.com:8006"
//! api_token = "root@pam!updater=..."
//!
//! [[clusters]]
//! id = "lab"
//! backend = "simulated"
//! nodes = [{ name = "a" }, { name = "b", pending = ["curl"] }]
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{
    ClusterBackend, ProxmoxBackend, ProxmoxConfig, SimulatedCluster, SimulatedConfig,
};
use crate::error::{Error, Result};
use crate::update::{RuntimeSettings, Timings};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// REST API bind address
    pub listen_addr: SocketAddr,
    /// Where jobs and schedules are persisted
    pub state_dir: PathBuf,
    /// How often the scheduler checks for open update windows
    pub scheduler_interval_secs: u64,
    pub timings: TimingsConfig,
    pub clusters: Vec<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            state_dir: PathBuf::from("/var/lib/rolling-updater"),
            scheduler_interval_secs: 60,
            timings: TimingsConfig::default(),
            clusters: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub poll_interval_secs: u64,
    pub reboot_offline_grace_secs: u64,
    pub reboot_timeout_secs: u64,
    pub update_timeout_secs: u64,
    /// Per-node bound on refreshing and reading the package index
    pub check_timeout_secs: u64,
    pub log_capacity: usize,
    pub status_log_tail: usize,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            reboot_offline_grace_secs: 120,
            reboot_timeout_secs: 600,
            update_timeout_secs: 900,
            check_timeout_secs: 300,
            log_capacity: 500,
            status_log_tail: 100,
        }
    }
}

impl TimingsConfig {
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            timings: Timings {
                poll_interval: Duration::from_secs(self.poll_interval_secs),
                reboot_offline_grace: Duration::from_secs(self.reboot_offline_grace_secs),
                reboot_timeout: Duration::from_secs(self.reboot_timeout_secs),
                update_timeout: Duration::from_secs(self.update_timeout_secs),
                check_timeout: Duration::from_secs(self.check_timeout_secs),
            },
            log_capacity: self.log_capacity,
            status_log_tail: self.status_log_tail,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub id: String,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Proxmox(ProxmoxConfig),
    Simulated(SimulatedConfig),
}

impl BackendConfig {
    pub fn build(&self) -> Result<Arc<dyn ClusterBackend>> {
        Ok(match self {
            BackendConfig::Proxmox(config) => Arc::new(ProxmoxBackend::new(config.clone())?),
            BackendConfig::Simulated(config) => Arc::new(SimulatedCluster::from_config(config)),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Proxmox(_) => "proxmox",
            BackendConfig::Simulated(_) => "simulated",
        }
    }
}

/// Cluster ids name state directories, so keep them path-safe
fn valid_cluster_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if !valid_cluster_id(&cluster.id) {
                return Err(Error::ConfigError(format!(
                    "Invalid cluster id {:?} (use letters, digits, '-', '_' or '.')",
                    cluster.id
                )));
            }
            if !seen.insert(cluster.id.as_str()) {
                return Err(Error::ConfigError(format!(
                    "Duplicate cluster id {}",
                    cluster.id
                )));
            }
        }
        if self.timings.log_capacity == 0 {
            return Err(Error::ConfigError(
                "timings.log_capacity must be positive".to_string(),
            ));
        }
        if self.timings.poll_interval_secs == 0 || self.scheduler_interval_secs == 0 {
            return Err(Error::ConfigError(
                "poll and scheduler intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_addr = "127.0.0.1:9000"
state_dir = "/tmp/updater"

[timings]
reboot_timeout_secs = 900

[[clusters]]
id = "pve-prod"
backend = "proxmox"
api_url = "https://pve1:8006"
api_token = "root@pam!updater=secret"
ha_maintenance = true

[[clusters]]
id = "lab"
backend = "simulated"
reboot_delay_ms = 10
nodes = [{ name = "a" }, { name = "b", pending = ["curl"], vms = [100] }]
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.timings.reboot_timeout_secs, 900);
        assert_eq!(config.timings.update_timeout_secs, 900);
        assert_eq!(config.scheduler_interval_secs, 60);
        assert_eq!(config.clusters.len(), 2);

        match &config.clusters[0].backend {
            BackendConfig::Proxmox(p) => {
                assert!(p.ha_maintenance);
                assert_eq!(p.ssh_user, "root");
            }
            other => panic!("unexpected backend {:?}", other),
        }
        match &config.clusters[1].backend {
            BackendConfig::Simulated(s) => {
                assert_eq!(s.nodes.len(), 2);
                assert_eq!(s.nodes[1].pending, vec!["curl".to_string()]);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.clusters.is_empty());
        assert_eq!(
            config.timings.runtime_settings().timings,
            Timings::default()
        );
    }

    #[test]
    fn test_duplicate_cluster_rejected() {
        let toml = r#"
[[clusters]]
id = "lab"
backend = "simulated"

[[clusters]]
id = "lab"
backend = "simulated"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate cluster id"));
    }

    #[test]
    fn test_unsafe_cluster_id_rejected() {
        for id in ["", "..", "a/b", "prod cluster"] {
            let toml = format!("[[clusters]]\nid = {:?}\nbackend = \"simulated\"\n", id);
            assert!(Config::from_toml(&toml).is_err(), "{:?} accepted", id);
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let toml = "[[clusters]]\nid = \"x\"\nbackend = \"vmware\"\n";
        assert!(matches!(
            Config::from_toml(toml),
            Err(Error::TomlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Config::from_file(&path).unwrap().clusters.len(), 2);
        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
