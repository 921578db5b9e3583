// Agent configuration (relayd.toml + RELAYD_* environment overrides) and the
// persisted worker config blob.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default paths for the agent config file.
const DEFAULT_CONFIG_PATH: &str = "/etc/relayd/relayd.toml";

/// Fallback path for development (relative to CWD).
const DEV_CONFIG_PATH: &str = "relayd.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    pub dev_mode: bool,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the proxy worker binary.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Where the worker config blob is persisted.
    pub config_file: PathBuf,
    pub stop_timeout_secs: u64,
    /// Start the worker as soon as the agent is up.
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("xray/xray"),
            args: crate::supervisor::process::DEFAULT_WORKER_ARGS
                .iter()
                .map(|a| a.to_string())
                .collect(),
            config_file: PathBuf::from("xconf/config.json"),
            stop_timeout_secs: 10,
            autostart: false,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: "/var/log/relayd/audit.log".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl AgentConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config TOML: {}", e))
    }

    /// Apply RELAYD_* overrides on top of whatever the file said.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("RELAYD_NODE_NAME") {
            self.node_name = name;
        }
        if let Some(exe) = lookup("RELAYD_WORKER_EXECUTABLE") {
            self.worker.executable = PathBuf::from(exe);
        }
        if let Some(file) = lookup("RELAYD_WORKER_CONFIG") {
            self.worker.config_file = PathBuf::from(file);
        }
        if let Some(dev) = lookup("RELAYD_DEV_MODE") {
            self.dev_mode = parse_bool(&dev)
                .ok_or_else(|| anyhow::anyhow!("RELAYD_DEV_MODE must be true or false, got {:?}", dev))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("node_name is required (set it in the config file or RELAYD_NODE_NAME)");
        }
        if self.worker.stop_timeout_secs == 0 {
            anyhow::bail!("worker.stop_timeout_secs must be greater than zero");
        }
        if self.worker.executable.as_os_str().is_empty() {
            anyhow::bail!("worker.executable cannot be empty");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Pick the config file: RELAYD_CONFIG, then the system path, then CWD.
fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("RELAYD_CONFIG") {
        return Some(PathBuf::from(path));
    }
    [DEFAULT_CONFIG_PATH, DEV_CONFIG_PATH]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

pub fn load_config() -> anyhow::Result<AgentConfig> {
    let mut config = match resolve_config_path() {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
            tracing::info!("Loaded config from {}", path.display());
            AgentConfig::from_toml(&content)?
        }
        None => {
            tracing::info!("No config file found, using defaults");
            AgentConfig::default()
        }
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Read the persisted worker config blob.
pub async fn load_worker_config(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read worker config {}: {}", path.display(), e))
}

/// Persist a worker config blob.
///
/// The blob goes to a uniquely named temp file in the target directory, is
/// fsynced, and is renamed over `path`; the directory is fsynced afterwards
/// so the rename itself survives a crash. Readers see the old blob or the
/// new one, never a mix.
pub async fn write_worker_config(path: &Path, blob: &str) -> anyhow::Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| anyhow::anyhow!("mkdir {} failed: {}", dir.display(), e))?;

    let blob = blob.to_owned();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| anyhow::anyhow!("Create temp file in {} failed: {}", dir.display(), e))?;
        tmp.write_all(blob.as_bytes())
            .map_err(|e| anyhow::anyhow!("Write {} failed: {}", tmp.path().display(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| anyhow::anyhow!("fsync {} failed: {}", tmp.path().display(), e))?;
        tmp.persist(&path)
            .map_err(|e| anyhow::anyhow!("Rename into {} failed: {}", path.display(), e.error))?;
        std::fs::File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| anyhow::anyhow!("fsync {} failed: {}", dir.display(), e))?;
        Ok(())
    })
    .await
    .map_err(|e| anyhow::anyhow!("Config write task panicked: {}", e))?
}

/// The on-disk home of the worker config blob.
///
/// Updates are serialized: each one holds the store lock across the write
/// and the in-memory swap, so the file and the supervisor's copy always end
/// on the same blob even when updates race.
#[derive(Debug)]
pub struct WorkerConfigStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl WorkerConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<String> {
        load_worker_config(&self.path).await
    }

    /// Write `blob`, then run `apply`. `apply` is skipped if the write fails.
    pub async fn persist_then<F: FnOnce()>(&self, blob: &str, apply: F) -> anyhow::Result<()> {
        let _serialized = self.lock.lock().await;
        write_worker_config(&self.path, blob).await?;
        apply();
        Ok(())
    }
}
