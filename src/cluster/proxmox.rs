//! Proxmox VE cluster backend
//!
//! Inventory, package status, migrations and reboots go through the PVE HTTP
//! API (`/api2/json`). The distribution upgrade and the optional HA
//! maintenance toggle have no API endpoint and run over SSH.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{ClusterBackend, CommandOutput, NodeInfo, PackageUpdate, Workload, WorkloadKind};
use crate::error::{Error, Result};

/// Keep this much of a command's output for error reporting
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxmoxConfig {
    /// Base URL of any cluster member, e.g. `https://pve1:8006`
    pub api_url: String,
    /// API token in `user@realm!tokenid=secret` form
    pub api_token: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// SSH address per node name; the node name is used when absent
    #[serde(default)]
    pub node_addresses: HashMap<String, String>,
    #[serde(default = "default_update_command")]
    pub update_command: String,
    /// Also toggle HA node-maintenance through `ha-manager`
    #[serde(default)]
    pub ha_maintenance: bool,
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
    /// Give up on a PVE task that has not stopped after this long
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_update_command() -> String {
    "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get -y -o Dpkg::Options::=--force-confold dist-upgrade".to_string()
}

fn default_task_poll_interval_ms() -> u64 {
    2_000
}

fn default_task_timeout_secs() -> u64 {
    1_800
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct NodeEntry {
    node: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct GuestEntry {
    #[serde(deserialize_with = "de_vmid")]
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// PVE reports container ids as strings and VM ids as numbers
fn de_vmid<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Vmid {
        Num(u32),
        Str(String),
    }

    match Vmid::deserialize(deserializer)? {
        Vmid::Num(n) => Ok(n),
        Vmid::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

pub struct ProxmoxBackend {
    config: ProxmoxConfig,
    http: reqwest::Client,
    /// Nodes this process has put into maintenance
    maintenance: Mutex<HashSet<String>>,
}

impl ProxmoxBackend {
    pub fn new(config: ProxmoxConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&format!("PVEAPIToken={}", config.api_token))
            .map_err(|e| Error::ConfigError(format!("Invalid API token: {}", e)))?;
        headers.insert(AUTHORIZATION, token);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            config,
            http,
            maintenance: Mutex::new(HashSet::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ApiResponse<T>>().await?.data)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ApiResponse<T>>().await?.data)
    }

    /// Poll a PVE task until it stops; a non-`OK` exit status is an error
    async fn wait_task(&self, node: &str, upid: &str) -> Result<()> {
        let poll = Duration::from_millis(self.config.task_poll_interval_ms);
        let limit = Duration::from_secs(self.config.task_timeout_secs);
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let status: TaskStatus = self
                .get(&format!("/nodes/{}/tasks/{}/status", node, upid))
                .await?;
            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(Error::BackendError(format!(
                        "task {} failed: {}",
                        upid,
                        other.unwrap_or("unknown exit status")
                    ))),
                };
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(Error::Timeout(format!(
                    "task {} on {} still running after {}s",
                    upid,
                    node,
                    limit.as_secs()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn ssh(&self, node: &str, command: &str) -> Result<CommandOutput> {
        let host = self
            .config
            .node_addresses
            .get(node)
            .cloned()
            .unwrap_or_else(|| node.to_string());
        debug!("ssh {}@{}: {}", self.config.ssh_user, host, command);

        let output = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}@{}", self.config.ssh_user, host))
            .arg(command)
            .output()
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: tail(&text, OUTPUT_TAIL_BYTES),
        })
    }

    async fn ha_maintenance(&self, node: &str, action: &str) -> Result<()> {
        let out = self
            .ssh(
                node,
                &format!("ha-manager crm-command node-maintenance {} {}", action, node),
            )
            .await?;
        if !out.success() {
            return Err(Error::CommandFailed {
                node: node.to_string(),
                code: out.exit_code,
                output: out.output,
            });
        }
        Ok(())
    }

    fn in_maintenance(&self) -> HashSet<String> {
        self.maintenance
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    fn set_maintenance(&self, node: &str, on: bool) {
        if let Ok(mut set) = self.maintenance.lock() {
            if on {
                set.insert(node.to_string());
            } else {
                set.remove(node);
            }
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl ClusterBackend for ProxmoxBackend {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let entries: Vec<NodeEntry> = self.get("/nodes").await?;
        let maintenance = self.in_maintenance();
        let mut nodes: Vec<NodeInfo> = entries
            .into_iter()
            .map(|e| NodeInfo {
                maintenance: maintenance.contains(&e.node),
                online: e.status == "online",
                name: e.node,
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    #[instrument(skip(self))]
    async fn refresh_packages(&self, node: &str) -> Result<()> {
        let upid: String = self.post(&format!("/nodes/{}/apt/update", node), &[]).await?;
        self.wait_task(node, &upid).await
    }

    async fn pending_updates(&self, node: &str) -> Result<Vec<PackageUpdate>> {
        self.get(&format!("/nodes/{}/apt/update", node)).await
    }

    #[instrument(skip(self))]
    async fn enter_maintenance(&self, node: &str) -> Result<()> {
        if self.config.ha_maintenance {
            self.ha_maintenance(node, "enable").await?;
        }
        self.set_maintenance(node, true);
        info!("Node {} entered maintenance", node);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exit_maintenance(&self, node: &str) -> Result<()> {
        if self.config.ha_maintenance {
            self.ha_maintenance(node, "disable").await?;
        }
        self.set_maintenance(node, false);
        info!("Node {} left maintenance", node);
        Ok(())
    }

    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>> {
        let mut workloads = Vec::new();
        for (kind, segment) in [(WorkloadKind::Qemu, "qemu"), (WorkloadKind::Lxc, "lxc")] {
            let guests: Vec<GuestEntry> = self.get(&format!("/nodes/{}/{}", node, segment)).await?;
            workloads.extend(guests.into_iter().filter(|g| g.status == "running").map(|g| {
                Workload {
                    name: g.name.unwrap_or_else(|| format!("{}-{}", segment, g.vmid)),
                    id: g.vmid,
                    kind,
                }
            }));
        }
        workloads.sort_by_key(|w| w.id);
        Ok(workloads)
    }

    #[instrument(skip(self, workload), fields(vmid = workload.id))]
    async fn migrate(&self, workload: &Workload, source: &str, target: &str) -> Result<()> {
        let upid: String = match workload.kind {
            WorkloadKind::Qemu => {
                self.post(
                    &format!("/nodes/{}/qemu/{}/migrate", source, workload.id),
                    &[("target", target), ("online", "1")],
                )
                .await?
            }
            WorkloadKind::Lxc => {
                self.post(
                    &format!("/nodes/{}/lxc/{}/migrate", source, workload.id),
                    &[("target", target), ("restart", "1")],
                )
                .await?
            }
        };
        self.wait_task(source, &upid).await
    }

    #[instrument(skip(self))]
    async fn run_update(&self, node: &str) -> Result<CommandOutput> {
        let out = self.ssh(node, &self.config.update_command).await?;
        if !out.success() {
            warn!("Update command on {} exited with {}", node, out.exit_code);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn reboot(&self, node: &str) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .post(&format!("/nodes/{}/status", node), &[("command", "reboot")])
            .await?;
        Ok(())
    }
}
