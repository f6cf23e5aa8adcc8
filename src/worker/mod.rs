//! Task execution engine.

pub mod deadline;
pub mod executor;
pub mod identity;
pub mod output;
pub mod process;
pub mod registry;
pub mod status;

pub use deadline::{compute_deadline, resolve_deadline};
pub use executor::{AdmittedJob, ExecutionReport, ExecutorDeps, JobAssignment, TaskExecutor};
pub use identity::WorkerIdentity;
pub use registry::{TaskHandle, TaskRegistry};
pub use status::{ExecutionState, ToolRun, ToolStatus};
