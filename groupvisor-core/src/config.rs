use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GroupvisorConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub container: ContainerRuntimeConfig,
    pub scheduler: SchedulerConfig,
    pub ipc: IpcConfig,
    pub mounts: MountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_body_bytes: usize,
    /// Base URL of the chat adapter that delivers outbound messages.
    /// Empty means outbound messages are only logged.
    pub host_callback_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
            max_body_bytes: 1_048_576,
            host_callback_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    pub groups_dir: String,
    pub data_dir: String,
    /// Mounted read-only into every worker at `/workspace/store`.
    pub store_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "store/groupvisor.db".to_string(),
            groups_dir: "groups".to_string(),
            data_dir: "data".to_string(),
            store_dir: "store".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Run the message loop, queue and worker dispatch. When false only the
    /// HTTP surface is served.
    pub enabled: bool,
    /// Name the assistant answers to; `@{name}` is the default trigger.
    pub assistant_name: String,
    /// Maximum concurrent workers across all groups.
    pub max_concurrent_workers: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Silence after the last result before the worker is asked to close (milliseconds).
    pub idle_timeout_ms: u64,
    /// Folder name for the main group.
    pub main_group_folder: String,
    /// First retry delay for a failed message check; doubles per attempt.
    pub retry_base_delay_ms: u64,
    pub max_retries: u32,
    /// Tell the chat when a message check is dropped after exhausted retries.
    pub notify_on_dropped_messages: bool,
    /// How long shutdown waits for active workers before detaching them.
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            assistant_name: "Andy".to_string(),
            max_concurrent_workers: 5,
            poll_interval_ms: 2000,
            idle_timeout_ms: 1_800_000,
            main_group_folder: "main".to_string(),
            retry_base_delay_ms: 5000,
            max_retries: 5,
            notify_on_dropped_messages: false,
            shutdown_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    pub runtime_bin: String,
    pub image: String,
    /// Hard bound on a whole worker run (milliseconds).
    pub timeout_ms: u64,
    /// Per-block cap on bytes between output markers.
    pub max_output_bytes: usize,
    /// Envelopes forwarded per run; later ones are read but not delivered.
    pub max_envelopes: usize,
    /// How long to wait for exit after stdout closes before killing.
    pub exit_grace_ms: u64,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "groupvisor-agent:latest".to_string(),
            timeout_ms: 1_800_000,
            max_output_bytes: 10 * 1024 * 1024,
            max_envelopes: 1000,
            exit_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enable the task scheduler loop.
    pub enabled: bool,
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions and naive `once` timestamps.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MountsConfig {
    /// Allowlist location. Defaults to `~/.config/groupvisor/mount-allowlist.json`,
    /// outside anything a worker can see.
    pub allowlist_path: Option<String>,
}

impl MountsConfig {
    pub fn resolved_allowlist_path(&self) -> PathBuf {
        match &self.allowlist_path {
            Some(path) => PathBuf::from(path),
            None => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
                PathBuf::from(home).join(".config/groupvisor/mount-allowlist.json")
            }
        }
    }
}

impl SchedulerConfig {
    /// Parsed timezone, falling back to UTC on an unknown name.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(tz = %self.timezone, "invalid timezone, falling back to UTC");
            chrono_tz::Tz::UTC
        })
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<GroupvisorConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(GroupvisorConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: GroupvisorConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl GroupvisorConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(bind) = non_empty_env("GROUPVISORD_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = non_empty_env("GROUPVISOR_DB_PATH") {
            self.storage.database_path = path;
        }
        if let Some(url) = non_empty_env("HOST_CALLBACK_URL") {
            self.server.host_callback_url = url;
        }
        if let Some(name) = non_empty_env("ASSISTANT_NAME") {
            self.orchestrator.assistant_name = name;
        }
        if let Some(image) = non_empty_env("CONTAINER_IMAGE") {
            self.container.image = image;
        }
        if let Some(max) = non_empty_env("MAX_CONCURRENT_WORKERS") {
            match max.parse::<usize>() {
                Ok(n) => self.orchestrator.max_concurrent_workers = n.max(1),
                Err(_) => tracing::warn!(value = %max, "ignoring invalid MAX_CONCURRENT_WORKERS"),
            }
        }
        if let Some(tz) = non_empty_env("TZ") {
            self.scheduler.timezone = tz;
        }
        if let Some(path) = non_empty_env("GROUPVISOR_MOUNT_ALLOWLIST") {
            self.mounts.allowlist_path = Some(path);
        }

        self
    }

    pub fn groups_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.groups_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir().join("ipc")
    }
}
