//! Error types for the scan worker.

use std::path::PathBuf;
use std::time::Duration;

use crate::worker::status::ExecutionState;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse tools configuration {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the orchestrator's REST API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid orchestrator URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{operation} request failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    /// Non-success HTTP answer. `body` is the remote text, kept verbatim.
    #[error("{body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response to {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Failure to open provided file: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool {job_id} is already running on this worker")]
    AlreadyRunning { job_id: String },

    #[error("Maximum concurrent tasks ({max}) reached")]
    AtCapacity { max: usize },
}

/// Per-job execution errors. Every variant is absorbed by the executor and
/// turned into a tool status plus a report message.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Remote refusal to craft the command line; text is the remote message.
    #[error("{0}")]
    CommandLine(String),

    #[error("Binary for command {command} is not registered on worker {worker}")]
    BinaryNotRegistered { command: String, worker: String },

    #[error("Cannot create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn tool process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Tool process failed: {description}")]
    Abnormal { description: String },

    #[error("Tool Timeout after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    /// Result import did not answer "Success"; text is the remote message.
    #[error("{0}")]
    Import(String),

    #[error("Tool execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    DataLayer(#[from] OrchestratorError),
}

impl ExecError {
    /// Status the tool ends in for this error. `None` leaves it untouched.
    pub fn terminal_state(&self) -> Option<ExecutionState> {
        match self {
            Self::TimedOut { .. } => Some(ExecutionState::TimedOut),
            Self::Cancelled | Self::Registry(_) => None,
            _ => Some(ExecutionState::Error),
        }
    }
}

/// Tool status state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Cannot transition tool status from {from} to {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },
}

/// Event connection errors. These are fatal to the worker.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Orchestrator at {url} is unreachable")]
    Unreachable { url: String },

    #[error("Failed to connect event socket {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Registration rejected: {0}")]
    Registration(#[source] OrchestratorError),

    #[error("Event socket disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Failed to send event: {0}")]
    Send(String),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
