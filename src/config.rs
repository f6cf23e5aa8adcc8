//! Configuration types.
//!
//! [`WorkerConfig`] comes from `SCAN_WORKER_*` environment variables.
//! [`ToolsConfigStore`] holds the local tools configuration, a JSON file
//! mapping command names to the binary that runs them and the parser that
//! reads their output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ConfigError;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Orchestrator REST API root.
    pub api_url: String,
    /// Orchestrator event socket.
    pub events_url: String,
    /// Fixed worker name. Generated when unset.
    pub name: Option<String>,
    /// Local tools configuration file.
    pub tools_config: PathBuf,
    /// Root of the tool output directories.
    pub results_dir: PathBuf,
    /// Interval between two keepalive events.
    pub heartbeat_interval: Duration,
    /// Maximum concurrent tool runs (None = unlimited).
    pub max_tasks: Option<usize>,
    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5000/api/v1/".to_string(),
            events_url: "ws://127.0.0.1:5000/ws".to_string(),
            name: None,
            tools_config: PathBuf::from("./config/tools.json"),
            results_dir: PathBuf::from("./results"),
            heartbeat_interval: Duration::from_secs(10),
            max_tasks: None,
            log_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let heartbeat_interval = match get("SCAN_WORKER_HEARTBEAT_SECS") {
            Some(raw) => {
                let secs = parse_number::<u64>("SCAN_WORKER_HEARTBEAT_SECS", &raw)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "SCAN_WORKER_HEARTBEAT_SECS".to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => defaults.heartbeat_interval,
        };

        let max_tasks = match get("SCAN_WORKER_MAX_TASKS") {
            Some(raw) => match parse_number::<usize>("SCAN_WORKER_MAX_TASKS", &raw)? {
                0 => None,
                max => Some(max),
            },
            None => None,
        };

        Ok(Self {
            api_url: get("SCAN_WORKER_API_URL").unwrap_or(defaults.api_url),
            events_url: get("SCAN_WORKER_EVENTS_URL").unwrap_or(defaults.events_url),
            name: get("SCAN_WORKER_NAME"),
            tools_config: get("SCAN_WORKER_TOOLS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.tools_config),
            results_dir: get("SCAN_WORKER_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            heartbeat_interval,
            max_tasks,
            log_dir: get("SCAN_WORKER_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

/// One locally installed tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEntry {
    /// Binary (or command prefix) the crafted arguments are appended to.
    pub bin: String,
    /// Parser the orchestrator uses to import the tool's output.
    #[serde(default)]
    pub plugin: String,
}

/// Command name → local tool.
pub type ToolsConfig = BTreeMap<String, ToolEntry>;

/// Shared tools configuration backed by a JSON file.
#[derive(Debug)]
pub struct ToolsConfigStore {
    path: PathBuf,
    tools: RwLock<ToolsConfig>,
}

impl ToolsConfigStore {
    /// Load the file at `path`. A missing file is an empty configuration.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let tools = read_tools(&path).await?;
        tracing::info!(path = %path.display(), tools = tools.len(), "Loaded tools configuration");
        Ok(Self {
            path,
            tools: RwLock::new(tools),
        })
    }

    /// In-memory store that persists to `path` on edit.
    pub fn with_tools(path: impl Into<PathBuf>, tools: ToolsConfig) -> Self {
        Self {
            path: path.into(),
            tools: RwLock::new(tools),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn entry(&self, command: &str) -> Option<ToolEntry> {
        self.tools.read().await.get(command).cloned()
    }

    /// Names of all configured commands, sorted.
    pub async fn commands(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Replace the entry of `command` and persist the file.
    pub async fn set_entry(&self, command: &str, entry: ToolEntry) -> Result<(), ConfigError> {
        let mut tools = self.tools.write().await;
        tools.insert(command.to_string(), entry);

        let json = serde_json::to_string_pretty(&*tools).map_err(|e| ConfigError::ParseError {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        // The write lock is held until the file is written so edits land in order.
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(command, path = %self.path.display(), "Updated tools configuration");
        Ok(())
    }
}

async fn read_tools(path: &Path) -> Result<ToolsConfig, ConfigError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Tools configuration not found, no commands available");
            return Ok(ToolsConfig::new());
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
