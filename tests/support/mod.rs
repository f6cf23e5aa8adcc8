//! Shared fixtures: an in-memory orchestrator and an executor wired to it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use secrecy::SecretString;
use tempfile::TempDir;

use scan_worker::config::{ToolEntry, ToolsConfig, ToolsConfigStore};
use scan_worker::error::OrchestratorError;
use scan_worker::orchestrator::{
    CommandLine, CommandSettings, IMPORT_SUCCESS, Orchestrator, TimeWindow, ToolRecord,
    ToolUpdate,
};
use scan_worker::worker::{
    ExecutorDeps, JobAssignment, TaskExecutor, TaskRegistry, WorkerIdentity,
};

pub const PENTEST: &str = "acme";
pub const WORKER_NAME: &str = "test-worker@localhost";

/// Everything the stub has been told, plus what it answers with.
#[derive(Debug)]
pub struct StubState {
    pub reachable: bool,
    pub tools: HashMap<String, ToolRecord>,
    pub commands: HashMap<String, CommandSettings>,
    pub intervals: Vec<TimeWindow>,
    /// Crafted command line per tool id. Missing ids are refused.
    pub command_lines: HashMap<String, CommandLine>,
    pub import_answer: String,

    pub tokens: Vec<String>,
    pub crafted_with: Vec<(String, String)>,
    /// Latest status list per tool id.
    pub statuses: HashMap<String, Vec<String>>,
    pub updates: Vec<(String, ToolUpdate)>,
    pub imported: Vec<PathBuf>,
    pub registered: Vec<(String, Vec<String>)>,
    pub unregistered: Vec<String>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            reachable: true,
            tools: HashMap::new(),
            commands: HashMap::new(),
            intervals: Vec::new(),
            command_lines: HashMap::new(),
            import_answer: IMPORT_SUCCESS.to_string(),
            tokens: Vec::new(),
            crafted_with: Vec::new(),
            statuses: HashMap::new(),
            updates: Vec::new(),
            imported: Vec::new(),
            registered: Vec::new(),
            unregistered: Vec::new(),
        }
    }
}

/// In-memory orchestrator. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct StubOrchestrator {
    state: Arc<Mutex<StubState>>,
}

impl StubOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut StubState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn status(&self, tool_id: &str) -> Option<Vec<String>> {
        self.with(|s| s.statuses.get(tool_id).cloned())
    }

    /// Add a tool whose crafted command is `args` (appended to the local
    /// binary) and whose output extension is `ext`.
    pub fn add_tool(&self, tool: ToolRecord, args: &str, ext: &str) {
        self.with(|s| {
            s.command_lines.insert(
                tool.id.clone(),
                CommandLine {
                    command: args.to_string(),
                    extension: ext.to_string(),
                },
            );
            s.tools.insert(tool.id.clone(), tool);
        });
    }
}

#[async_trait]
impl Orchestrator for StubOrchestrator {
    fn authorized(&self, token: &str) -> Arc<dyn Orchestrator> {
        self.with(|s| s.tokens.push(token.to_string()));
        Arc::new(self.clone())
    }

    async fn try_connection(&self) -> bool {
        self.with(|s| s.reachable)
    }

    async fn register_commands(
        &self,
        worker_name: &str,
        commands: &[String],
    ) -> Result<(), OrchestratorError> {
        self.with(|s| {
            s.registered
                .push((worker_name.to_string(), commands.to_vec()))
        });
        Ok(())
    }

    async fn unregister(&self, worker_name: &str) -> Result<(), OrchestratorError> {
        self.with(|s| s.unregistered.push(worker_name.to_string()));
        Ok(())
    }

    async fn craft_command_line(
        &self,
        _pentest: &str,
        tool_id: &str,
        parser: &str,
    ) -> Result<CommandLine, OrchestratorError> {
        self.with(|s| {
            s.crafted_with
                .push((tool_id.to_string(), parser.to_string()));
            s.command_lines
                .get(tool_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::Rejected {
                    operation: "craftCommandLine".to_string(),
                    status: 404,
                    body: "Tool not found".to_string(),
                })
        })
    }

    async fn import_result(
        &self,
        _pentest: &str,
        _tool_id: &str,
        _parser: &str,
        path: &Path,
    ) -> Result<String, OrchestratorError> {
        if !path.exists() {
            return Err(OrchestratorError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        Ok(self.with(|s| {
            s.imported.push(path.to_path_buf());
            s.import_answer.clone()
        }))
    }

    async fn set_status(
        &self,
        _pentest: &str,
        tool_id: &str,
        status: &[String],
        _arg: &str,
    ) -> Result<(), OrchestratorError> {
        self.with(|s| s.statuses.insert(tool_id.to_string(), status.to_vec()));
        Ok(())
    }

    async fn fetch_tool(
        &self,
        _pentest: &str,
        tool_id: &str,
    ) -> Result<ToolRecord, OrchestratorError> {
        self.with(|s| s.tools.get(tool_id).cloned())
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "Tool".to_string(),
                id: tool_id.to_string(),
            })
    }

    async fn fetch_command(
        &self,
        _pentest: &str,
        command_id: &str,
    ) -> Result<Option<CommandSettings>, OrchestratorError> {
        Ok(self.with(|s| s.commands.get(command_id).copied()))
    }

    async fn fetch_intervals(
        &self,
        _pentest: &str,
        wave: &str,
    ) -> Result<Vec<TimeWindow>, OrchestratorError> {
        Ok(self.with(|s| {
            s.intervals
                .iter()
                .filter(|w| w.wave == wave)
                .cloned()
                .collect()
        }))
    }

    async fn update_tool(
        &self,
        _pentest: &str,
        tool_id: &str,
        update: &ToolUpdate,
    ) -> Result<(), OrchestratorError> {
        self.with(|s| {
            if let Some(status) = &update.status {
                s.statuses.insert(tool_id.to_string(), status.clone());
            }
            s.updates.push((tool_id.to_string(), update.clone()));
        });
        Ok(())
    }
}

/// An executor backed by a stub orchestrator and a temporary results dir.
pub struct Harness {
    pub stub: StubOrchestrator,
    pub registry: Arc<TaskRegistry>,
    pub tools: Arc<ToolsConfigStore>,
    pub identity: Arc<WorkerIdentity>,
    pub executor: TaskExecutor,
    pub dir: TempDir,
}

/// Harness whose tools config maps each command name to `sh`.
pub fn harness(commands: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let tools_config: ToolsConfig = commands
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ToolEntry {
                    bin: "sh".to_string(),
                    plugin: format!("{name}-parser"),
                },
            )
        })
        .collect();
    let tools = Arc::new(ToolsConfigStore::with_tools(
        dir.path().join("tools.json"),
        tools_config,
    ));
    let stub = StubOrchestrator::new();
    let registry = Arc::new(TaskRegistry::new(None));
    let identity = Arc::new(WorkerIdentity::new(
        Some(WORKER_NAME.to_string()),
        commands.iter().map(|c| c.to_string()).collect(),
    ));
    let executor = TaskExecutor::new(ExecutorDeps {
        orchestrator: Arc::new(stub.clone()),
        registry: Arc::clone(&registry),
        tools: Arc::clone(&tools),
        identity: Arc::clone(&identity),
        results_dir: dir.path().join("results"),
    });
    Harness {
        stub,
        registry,
        tools,
        identity,
        executor,
        dir,
    }
}

pub fn tool(id: &str, name: &str, wave: &str) -> ToolRecord {
    ToolRecord {
        id: id.to_string(),
        name: name.to_string(),
        command_iid: format!("cmd-{name}"),
        wave: wave.to_string(),
        ip: "10.0.0.1".to_string(),
        port: "80".to_string(),
        proto: "tcp".to_string(),
        ..ToolRecord::default()
    }
}

pub fn job(tool_id: &str) -> JobAssignment {
    JobAssignment {
        worker_token: SecretString::from("worker-token".to_string()),
        pentest: PENTEST.to_string(),
        tool_id: tool_id.to_string(),
        infos: serde_json::json!({}),
    }
}

pub fn settings(timeout: f64, sleep_between: f64) -> CommandSettings {
    CommandSettings {
        timeout,
        sleep_between,
    }
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Poll until `job_id` shows up in the registry.
pub async fn wait_registered(registry: &TaskRegistry, job_id: &str) {
    for _ in 0..200 {
        if registry.lookup(job_id).is_some_and(|h| h.pid.is_some()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {job_id} never registered");
}
