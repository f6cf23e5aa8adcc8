//! Task registry: the set of tool runs currently alive on this worker.
//!
//! The registry is the single-flight guard (at most one run per tool id) and
//! the rendezvous point for stop and progress requests. Each entry carries a
//! control channel to the executor that owns the process; the process itself
//! is never touched from here.
//!
//! Every registration gets an attempt id. Removal checks it, so a run that
//! finishes naturally and a concurrent cancellation remove the entry exactly
//! once, and a late removal can never evict a newer attempt.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::RegistryError;

/// How long a progress query waits for the executor to answer.
pub const PROGRESS_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a cancellation waits for the process to be confirmed dead.
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests an executor accepts about its running process.
#[derive(Debug)]
pub enum TaskControl {
    /// Ask for the output produced since the last query.
    Progress { reply: oneshot::Sender<String> },
    /// Kill the process; `done` fires once it has exited.
    Cancel { done: oneshot::Sender<()> },
}

/// Registry entry for one tool run.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub job_id: String,
    pub pentest: String,
    pub attempt: Uuid,
    /// OS process id, known once the process is spawned.
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    control: mpsc::Sender<TaskControl>,
}

/// Executor side of a [`TaskHandle`].
#[derive(Debug)]
pub struct TaskLink {
    pub attempt: Uuid,
    pub control: mpsc::Receiver<TaskControl>,
}

impl TaskHandle {
    /// Create a handle and the link its executor listens on.
    pub fn new(job_id: impl Into<String>, pentest: impl Into<String>) -> (Self, TaskLink) {
        let (control, control_rx) = mpsc::channel(8);
        let attempt = Uuid::new_v4();
        let handle = Self {
            job_id: job_id.into(),
            pentest: pentest.into(),
            attempt,
            pid: None,
            created_at: Utc::now(),
            control,
        };
        (
            handle,
            TaskLink {
                attempt,
                control: control_rx,
            },
        )
    }
}

/// Concurrent map from tool id to its live run.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskHandle>>,
    /// Maximum concurrent runs (None = unlimited).
    max_tasks: Option<usize>,
}

impl TaskRegistry {
    pub fn new(max_tasks: Option<usize>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            max_tasks,
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskHandle>> {
        // Critical sections never panic halfway through a mutation.
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a run. Rejects a second run of the same tool.
    pub fn register(&self, handle: TaskHandle) -> Result<(), RegistryError> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&handle.job_id) {
            return Err(RegistryError::AlreadyRunning {
                job_id: handle.job_id,
            });
        }
        if let Some(max) = self.max_tasks
            && tasks.len() >= max
        {
            return Err(RegistryError::AtCapacity { max });
        }

        tracing::debug!(job_id = %handle.job_id, attempt = %handle.attempt, "Registered task");
        tasks.insert(handle.job_id.clone(), handle);
        Ok(())
    }

    /// Record the process id of a registered attempt.
    pub fn set_pid(&self, job_id: &str, attempt: Uuid, pid: Option<u32>) {
        if let Some(handle) = self.tasks().get_mut(job_id)
            && handle.attempt == attempt
        {
            handle.pid = pid;
        }
    }

    pub fn lookup(&self, job_id: &str) -> Option<TaskHandle> {
        self.tasks().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.tasks().contains_key(job_id)
    }

    /// Remove the entry of `attempt`. Returns false if it was already gone
    /// or belongs to another attempt.
    pub fn deregister(&self, job_id: &str, attempt: Uuid) -> bool {
        let mut tasks = self.tasks();
        match tasks.get(job_id) {
            Some(handle) if handle.attempt == attempt => {
                tasks.remove(job_id);
                tracing::debug!(job_id, attempt = %attempt, "Deregistered task");
                true
            }
            _ => false,
        }
    }

    /// Stop a run and wait until its executor has handled the request.
    /// Returns whether a live run was found; unknown ids are a no-op.
    ///
    /// An executor that answers owns its entry: it removes it before
    /// confirming a kill, and keeps it while a finished tool is still being
    /// imported. The entry is only removed here when the executor is gone
    /// or never answers.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(handle) = self.lookup(job_id) else {
            tracing::debug!(job_id, "Cancel requested for unknown task");
            return false;
        };

        tracing::info!(job_id, pid = ?handle.pid, "Stopping task");
        let (done_tx, done_rx) = oneshot::channel();
        let answered = match handle.control.send(TaskControl::Cancel { done: done_tx }).await {
            Ok(()) => match tokio::time::timeout(CANCEL_TIMEOUT, done_rx).await {
                Ok(confirmed) => confirmed.is_ok(),
                Err(_) => {
                    tracing::warn!(
                        job_id,
                        timeout = ?CANCEL_TIMEOUT,
                        "Task did not confirm termination"
                    );
                    false
                }
            },
            Err(_) => false,
        };

        if !answered {
            self.deregister(job_id, handle.attempt);
        }
        tracing::info!(job_id, "Task stopped");
        true
    }

    /// Stop every run concurrently.
    pub async fn cancel_all(&self) {
        let job_ids = self.snapshot();
        if job_ids.is_empty() {
            return;
        }
        tracing::info!(count = job_ids.len(), "Stopping all tasks");
        futures::future::join_all(job_ids.iter().map(|id| self.cancel(id))).await;
    }

    /// Ids of all live runs.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Output of a live run since the previous query. Unknown, finished or
    /// unresponsive runs yield an empty string.
    pub async fn progress(&self, job_id: &str) -> String {
        let Some(handle) = self.lookup(job_id) else {
            return String::new();
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .control
            .send_timeout(TaskControl::Progress { reply: reply_tx }, PROGRESS_TIMEOUT)
            .await
            .is_err()
        {
            return String::new();
        }

        match tokio::time::timeout(PROGRESS_TIMEOUT, reply_rx).await {
            Ok(Ok(output)) => output,
            _ => String::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }
}
