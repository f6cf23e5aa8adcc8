//! Worker session: registration, event dispatch and teardown.
//!
//! A session owns the single event connection of the worker. It registers
//! the worker's identity and commands, then dispatches inbound events until
//! the orchestrator deletes the worker, the process is asked to shut down or
//! the socket is lost. Whatever the reason, every running task is cancelled
//! and the worker unregistered before the session returns.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;

use crate::config::{ToolEntry, ToolsConfigStore};
use crate::connection::heartbeat::spawn_heartbeat;
use crate::connection::protocol::{InboundEvent, OutboundEvent};
use crate::connection::transport::{self, EventSink, EventStream};
use crate::error::ConnectionError;
use crate::orchestrator::Orchestrator;
use crate::worker::executor::{JobAssignment, TaskExecutor};
use crate::worker::identity::WorkerIdentity;

/// How long queued outbound events may take to flush on teardown.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of the event connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
    /// Cancelling tasks before unregistering.
    Draining,
}

impl ConnectionState {
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Registered)
                | (Connecting, Disconnected)
                | (Registered, Draining)
                | (Draining, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Draining => "draining",
        };
        write!(f, "{}", s)
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The orchestrator removed this worker.
    Deleted,
    /// Local shutdown request.
    Shutdown,
}

/// Endpoints and timing of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_url: String,
    pub events_url: String,
    pub heartbeat_interval: Duration,
}

pub struct WorkerSession {
    config: SessionConfig,
    orchestrator: Arc<dyn Orchestrator>,
    executor: TaskExecutor,
    tools: Arc<ToolsConfigStore>,
    identity: Arc<WorkerIdentity>,
    state: ConnectionState,
}

impl WorkerSession {
    pub fn new(
        config: SessionConfig,
        orchestrator: Arc<dyn Orchestrator>,
        executor: TaskExecutor,
        tools: Arc<ToolsConfigStore>,
        identity: Arc<WorkerIdentity>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            executor,
            tools,
            identity,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, target: ConnectionState) {
        if !self.state.can_transition_to(target) {
            tracing::warn!(from = %self.state, to = %target, "Unexpected connection state change");
        }
        tracing::debug!(from = %self.state, to = %target, "Connection state");
        self.state = target;
    }

    /// Probe the orchestrator, register, open the event socket and run until
    /// the session ends.
    pub async fn connect_and_run<F>(&mut self, shutdown: F) -> Result<SessionEnd, ConnectionError>
    where
        F: Future<Output = ()> + Send,
    {
        self.set_state(ConnectionState::Connecting);

        if !self.orchestrator.try_connection().await {
            self.set_state(ConnectionState::Disconnected);
            return Err(ConnectionError::Unreachable {
                url: self.config.api_url.clone(),
            });
        }

        if let Err(e) = self
            .orchestrator
            .register_commands(&self.identity.name, &self.identity.capabilities)
            .await
        {
            self.set_state(ConnectionState::Disconnected);
            return Err(ConnectionError::Registration(e));
        }
        tracing::info!(
            worker = %self.identity.name,
            commands = ?self.identity.capabilities,
            "Registered with orchestrator"
        );

        let socket = match transport::connect(&self.config.events_url).await {
            Ok(socket) => socket,
            Err(e) => {
                self.unregister().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let outcome = self.run(socket.sink, socket.inbound, shutdown).await;

        // Every sink clone is gone once `run` returns; let the writer flush.
        let mut writer = socket.writer;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        outcome
    }

    /// Announce the worker on an established event channel and dispatch
    /// events until the session ends.
    pub async fn run<F>(
        &mut self,
        sink: EventSink,
        mut inbound: EventStream,
        shutdown: F,
    ) -> Result<SessionEnd, ConnectionError>
    where
        F: Future<Output = ()> + Send,
    {
        if self.state == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Connecting);
        }

        let registered = sink
            .send(OutboundEvent::Register {
                name: self.identity.name.clone(),
                binaries: self.identity.capabilities.clone(),
            })
            .await;
        if let Err(e) = registered {
            self.unregister().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        self.set_state(ConnectionState::Registered);

        let heartbeat = spawn_heartbeat(
            self.identity.name.clone(),
            Arc::clone(self.executor.registry()),
            sink.clone(),
            self.config.heartbeat_interval,
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(SessionEnd::Shutdown);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Worker task panicked");
                    }
                }
                event = inbound.next() => match event {
                    Some(Ok(event)) => {
                        if let Some(end) = self.dispatch(event, &mut tasks, &sink) {
                            break Ok(end);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        break Err(ConnectionError::Disconnected {
                            reason: "event stream ended".to_string(),
                        });
                    }
                },
            }
        };

        if let Err(ref e) = outcome {
            tracing::error!(error = %e, "Lost connection to orchestrator");
        }
        self.set_state(ConnectionState::Draining);
        heartbeat.abort();
        self.executor.registry().cancel_all().await;
        tasks.shutdown().await;
        self.unregister().await;
        self.set_state(ConnectionState::Disconnected);
        outcome
    }

    /// Route one event. Returns the end of the session when the event
    /// closes it. Never waits on a task.
    fn dispatch(
        &self,
        event: InboundEvent,
        tasks: &mut JoinSet<()>,
        sink: &EventSink,
    ) -> Option<SessionEnd> {
        tracing::debug!(event = event.name(), "Received event");
        match event {
            InboundEvent::ExecuteCommand {
                worker_token,
                pentest,
                tool_id,
                infos,
            } => {
                let job = JobAssignment {
                    worker_token,
                    pentest,
                    tool_id,
                    infos,
                };
                // Admitted before the next event is read, so a stop that
                // follows right behind finds the entry.
                let admitted = match self.executor.admit(job) {
                    Ok(admitted) => admitted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Execution rejected");
                        return None;
                    }
                };
                let executor = self.executor.clone();
                tasks.spawn(async move {
                    let tool_id = admitted.tool_id().to_string();
                    let report = executor.execute_admitted(admitted).await;
                    tracing::debug!(
                        tool_id = %tool_id,
                        success = report.success,
                        message = %report.message,
                        "Execution finished"
                    );
                });
            }
            InboundEvent::StopCommand { pentest, tool_iid } => {
                let registry = Arc::clone(self.executor.registry());
                tasks.spawn(async move {
                    if !registry.cancel(&tool_iid).await {
                        tracing::debug!(pentest = %pentest, tool_id = %tool_iid, "Nothing to stop");
                    }
                });
            }
            InboundEvent::GetProgress { tool_iid } => {
                let registry = Arc::clone(self.executor.registry());
                let sink = sink.clone();
                tasks.spawn(async move {
                    let result = registry.progress(&tool_iid).await;
                    if let Err(e) = sink.send(OutboundEvent::ProgressResult { result }).await {
                        tracing::warn!(tool_id = %tool_iid, error = %e, "Failed to send progress");
                    }
                });
            }
            InboundEvent::DeleteWorker {} => {
                tracing::info!(worker = %self.identity.name, "Worker deleted by orchestrator");
                return Some(SessionEnd::Deleted);
            }
            InboundEvent::EditToolConfig {
                command_name,
                remote_bin,
                plugin,
            } => {
                let tools = Arc::clone(&self.tools);
                tasks.spawn(async move {
                    let entry = ToolEntry {
                        bin: remote_bin,
                        plugin,
                    };
                    if let Err(e) = tools.set_entry(&command_name, entry).await {
                        tracing::warn!(command = %command_name, error = %e, "Failed to update tools configuration");
                    }
                });
            }
        }
        None
    }

    async fn unregister(&self) {
        match self.orchestrator.unregister(&self.identity.name).await {
            Ok(()) => tracing::info!(worker = %self.identity.name, "Unregistered from orchestrator"),
            Err(e) => tracing::warn!(worker = %self.identity.name, error = %e, "Failed to unregister"),
        }
    }
}
