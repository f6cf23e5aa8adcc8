//! Orchestrator contract consumed by the worker.
//!
//! The worker never holds a global client: an `Arc<dyn Orchestrator>` is
//! built once in `main` and handed to every component that needs it. Job
//! level calls go through [`Orchestrator::authorized`], which scopes the
//! handle to the token shipped with the assignment.

pub mod api;
pub mod model;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OrchestratorError;

pub use api::ApiClient;
pub use model::{CommandLine, CommandSettings, TimeWindow, ToolRecord, ToolUpdate};

/// Message the orchestrator answers when a result import succeeded.
pub const IMPORT_SUCCESS: &str = "Success";

/// Remote side of the worker: registration, command crafting, result import
/// and the data-layer reads/writes the execution engine needs.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Handle whose requests carry `token` as credentials.
    fn authorized(&self, token: &str) -> Arc<dyn Orchestrator>;

    /// Reachability probe.
    async fn try_connection(&self) -> bool;

    /// Announce the worker and the commands it can run.
    async fn register_commands(
        &self,
        worker_name: &str,
        commands: &[String],
    ) -> Result<(), OrchestratorError>;

    async fn unregister(&self, worker_name: &str) -> Result<(), OrchestratorError>;

    /// Build the full command line for a tool. A refusal comes back as
    /// [`OrchestratorError::Rejected`] carrying the remote text.
    async fn craft_command_line(
        &self,
        pentest: &str,
        tool_id: &str,
        parser: &str,
    ) -> Result<CommandLine, OrchestratorError>;

    /// Upload a result file for parsing. Returns the remote message, which is
    /// [`IMPORT_SUCCESS`] when the import worked.
    async fn import_result(
        &self,
        pentest: &str,
        tool_id: &str,
        parser: &str,
        path: &Path,
    ) -> Result<String, OrchestratorError>;

    async fn set_status(
        &self,
        pentest: &str,
        tool_id: &str,
        status: &[String],
        arg: &str,
    ) -> Result<(), OrchestratorError>;

    async fn fetch_tool(&self, pentest: &str, tool_id: &str)
    -> Result<ToolRecord, OrchestratorError>;

    async fn fetch_command(
        &self,
        pentest: &str,
        command_id: &str,
    ) -> Result<Option<CommandSettings>, OrchestratorError>;

    /// All time windows of a schedule group.
    async fn fetch_intervals(
        &self,
        pentest: &str,
        wave: &str,
    ) -> Result<Vec<TimeWindow>, OrchestratorError>;

    async fn update_tool(
        &self,
        pentest: &str,
        tool_id: &str,
        update: &ToolUpdate,
    ) -> Result<(), OrchestratorError>;
}
