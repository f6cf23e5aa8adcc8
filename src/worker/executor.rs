//! Task executor: runs one tool assignment from command line to result import.
//!
//! An execution goes through these stages:
//!
//! ```text
//! admit (registry entry) ─► fetch tool ─► craft command ─► resolve binary
//!     ─► output dir ─► deadline ─► running ─► spawn ─► supervise ─► import
//!     ─► done ─► sleep between ─► release entry
//! ```
//!
//! The registry entry is reserved when the job is accepted and released
//! when the execution ends, so the tool counts as running for its whole
//! lifetime. A cancel request before the spawn stops the job there; during
//! supervision it kills the whole process group, as the deadline does.
//! Once the process has exited a cancel is only acknowledged. Every failure
//! is absorbed here and turned into a tool status plus an
//! [`ExecutionReport`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;

use crate::config::ToolsConfigStore;
use crate::error::{ExecError, OrchestratorError, RegistryError};
use crate::orchestrator::{CommandSettings, IMPORT_SUCCESS, Orchestrator, ToolRecord, ToolUpdate};
use crate::worker::deadline::{remaining, resolve_deadline};
use crate::worker::identity::WorkerIdentity;
use crate::worker::output::{ensure_dir, output_dir, output_stem, substitute_output};
use crate::worker::process::{ToolProcess, describe_exit};
use crate::worker::registry::{TaskControl, TaskHandle, TaskLink, TaskRegistry};
use crate::worker::status::{ExecutionState, ToolRun, ToolStatus};

/// How long a progress query waits for fresh output when none is buffered.
/// Kept well under the registry's progress timeout.
const PROGRESS_POLL_WAIT: Duration = Duration::from_millis(500);

/// A job handed to this worker.
#[derive(Debug)]
pub struct JobAssignment {
    /// Credentials for the job's orchestrator calls.
    pub worker_token: SecretString,
    pub pentest: String,
    pub tool_id: String,
    /// Free-form extras. `plugin` names an explicit parser.
    pub infos: serde_json::Value,
}

impl JobAssignment {
    fn explicit_parser(&self) -> Option<&str> {
        self.infos
            .get("plugin")
            .and_then(|p| p.as_str())
            .filter(|p| !p.is_empty())
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub success: bool,
    pub message: String,
}

/// Everything an executor needs, shared between all jobs.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub registry: Arc<TaskRegistry>,
    pub tools: Arc<ToolsConfigStore>,
    pub identity: Arc<WorkerIdentity>,
    pub results_dir: PathBuf,
}

/// Runs assignments. Cheap to clone; one execution per spawned task.
#[derive(Clone)]
pub struct TaskExecutor {
    deps: ExecutorDeps,
}

/// How a supervised process ended.
enum Exit {
    Finished(std::process::ExitStatus),
    TimedOut(Duration),
    Cancelled(oneshot::Sender<()>),
    Lost(std::io::Error),
}

/// Removes the registry entry of one attempt when dropped, so an aborted
/// executor task never leaves a stale entry behind.
struct Registration {
    registry: Arc<TaskRegistry>,
    job_id: String,
    link: TaskLink,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.job_id, self.link.attempt);
    }
}

/// A job whose registry entry is reserved. Dropping it releases the entry.
pub struct AdmittedJob {
    job: JobAssignment,
    registration: Registration,
}

impl AdmittedJob {
    pub fn tool_id(&self) -> &str {
        &self.job.tool_id
    }
}

/// Everything the run needs once the command line is known.
struct Prepared {
    command: Option<CommandSettings>,
    parser: String,
    command_line: String,
    result_file: PathBuf,
    deadline: Option<NaiveDateTime>,
}

/// Where the current attempt stands, for status reporting.
struct Attempt {
    orchestrator: Arc<dyn Orchestrator>,
    run: ToolRun,
    /// Set once the tool was marked running.
    started: bool,
}

impl TaskExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.deps.registry
    }

    /// Reserve the registry entry of `job`. Stop and progress requests reach
    /// the job from here on, before any remote call is made.
    pub fn admit(&self, job: JobAssignment) -> Result<AdmittedJob, RegistryError> {
        let (handle, link) = TaskHandle::new(&job.tool_id, &job.pentest);
        self.deps.registry.register(handle)?;
        Ok(AdmittedJob {
            registration: Registration {
                registry: Arc::clone(&self.deps.registry),
                job_id: job.tool_id.clone(),
                link,
            },
            job,
        })
    }

    /// Admit `job` and execute it to completion.
    pub async fn execute(&self, job: JobAssignment) -> ExecutionReport {
        let tool_id = job.tool_id.clone();
        match self.admit(job) {
            Ok(admitted) => self.execute_admitted(admitted).await,
            Err(e) => {
                tracing::warn!(tool_id = %tool_id, error = %e, "Tool rejected");
                ExecutionReport {
                    success: false,
                    message: ExecError::from(e).to_string(),
                }
            }
        }
    }

    /// Execute an admitted job to completion and report its outcome.
    pub async fn execute_admitted(&self, admitted: AdmittedJob) -> ExecutionReport {
        let AdmittedJob {
            job,
            mut registration,
        } = admitted;
        let mut attempt = Attempt {
            orchestrator: self
                .deps
                .orchestrator
                .authorized(job.worker_token.expose_secret()),
            run: ToolRun::default(),
            started: false,
        };

        tracing::info!(pentest = %job.pentest, tool_id = %job.tool_id, "Executing tool");
        let report = match self.run(&job, &mut registration.link, &mut attempt).await {
            Ok(message) => {
                tracing::info!(tool_id = %job.tool_id, "Tool completed");
                ExecutionReport {
                    success: true,
                    message,
                }
            }
            Err(err) => {
                match err {
                    ExecError::Cancelled => {
                        tracing::info!(tool_id = %job.tool_id, "Tool cancelled")
                    }
                    ref e => tracing::warn!(tool_id = %job.tool_id, error = %e, "Tool failed"),
                }
                if let Some(state) = err.terminal_state() {
                    self.report_end(&job, &mut attempt, state, &err.to_string())
                        .await;
                }
                ExecutionReport {
                    success: false,
                    message: err.to_string(),
                }
            }
        };
        drop(registration);
        report
    }

    async fn run(
        &self,
        job: &JobAssignment,
        link: &mut TaskLink,
        attempt: &mut Attempt,
    ) -> Result<String, ExecError> {
        let prepared = tokio::select! {
            prepared = self.prepare(job, attempt) => prepared?,
            done = next_cancel(link) => {
                self.confirm_cancel(job, link, done);
                return Err(ExecError::Cancelled);
            }
        };

        self.mark_running(job, attempt).await;

        tracing::debug!(tool_id = %job.tool_id, command = %prepared.command_line, "Spawning tool");
        let mut process = ToolProcess::spawn(&prepared.command_line).map_err(ExecError::Spawn)?;
        self.deps
            .registry
            .set_pid(&job.tool_id, link.attempt, process.id());

        let exit = supervise(&mut process, link, prepared.deadline).await;
        drop(process);

        match exit {
            Exit::Cancelled(done) => {
                self.confirm_cancel(job, link, done);
                return Err(ExecError::Cancelled);
            }
            Exit::TimedOut(elapsed) => return Err(ExecError::TimedOut { elapsed }),
            Exit::Finished(status) if !status.success() => {
                return Err(ExecError::Abnormal {
                    description: describe_exit(&status),
                });
            }
            Exit::Lost(e) => {
                return Err(ExecError::Abnormal {
                    description: format!("lost track of process: {e}"),
                });
            }
            Exit::Finished(_) => {}
        }

        let finishing = self.finish(job, attempt, &prepared);
        tokio::pin!(finishing);
        loop {
            tokio::select! {
                result = &mut finishing => return result,
                done = next_cancel(link) => {
                    tracing::info!(tool_id = %job.tool_id, "Tool already exited, finishing its import");
                    let _ = done.send(());
                }
            }
        }
    }

    /// Everything up to the spawn: tool record, command line, binary,
    /// output location and deadline.
    async fn prepare(
        &self,
        job: &JobAssignment,
        attempt: &mut Attempt,
    ) -> Result<Prepared, ExecError> {
        let orchestrator = Arc::clone(&attempt.orchestrator);
        let tool = orchestrator.fetch_tool(&job.pentest, &job.tool_id).await?;
        attempt.run = ToolRun::new(ToolStatus::from_wire(&tool.status));
        let command = orchestrator
            .fetch_command(&job.pentest, &tool.command_iid)
            .await?;

        let entry = self.deps.tools.entry(&tool.name).await;
        let parser = job
            .explicit_parser()
            .map(str::to_string)
            .or_else(|| entry.as_ref().map(|e| e.plugin.clone()))
            .unwrap_or_default();

        let crafted = orchestrator
            .craft_command_line(&job.pentest, &job.tool_id, &parser)
            .await
            .map_err(|e| match e {
                OrchestratorError::Rejected { body, .. } => ExecError::CommandLine(body),
                other => ExecError::CommandLine(other.to_string()),
            })?;

        let Some(entry) = entry.filter(|e| !e.bin.trim().is_empty()) else {
            let err = ExecError::BinaryNotRegistered {
                command: tool.name.clone(),
                worker: self.deps.identity.name.clone(),
            };
            self.append_note(&*orchestrator, job, &tool, &err.to_string())
                .await;
            return Err(err);
        };

        let dir = output_dir(&self.deps.results_dir, &job.pentest, &tool);
        ensure_dir(&dir).await.map_err(|source| ExecError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        let stem = output_stem(&dir, &tool.name, chrono::Utc::now());
        let command_line = format!(
            "{} {}",
            entry.bin.trim(),
            substitute_output(&crafted.command, &stem)
        );
        let result_file = PathBuf::from(format!("{}{}", stem.display(), crafted.extension));

        let deadline =
            resolve_deadline(&*orchestrator, &job.pentest, &tool, command.as_ref(), local_now())
                .await?;
        match deadline {
            Some(at) => tracing::info!(tool_id = %job.tool_id, deadline = %at, "Tool will time out at deadline"),
            None => tracing::info!(tool_id = %job.tool_id, "Tool runs without deadline"),
        }

        Ok(Prepared {
            command,
            parser,
            command_line,
            result_file,
            deadline,
        })
    }

    /// Import the result of a clean exit, mark the tool done and throttle.
    async fn finish(
        &self,
        job: &JobAssignment,
        attempt: &mut Attempt,
        prepared: &Prepared,
    ) -> Result<String, ExecError> {
        let message = attempt
            .orchestrator
            .import_result(
                &job.pentest,
                &job.tool_id,
                &prepared.parser,
                &prepared.result_file,
            )
            .await?;
        if message != IMPORT_SUCCESS {
            return Err(ExecError::Import(message));
        }
        self.report_end(job, attempt, ExecutionState::Done, &message)
            .await;

        if let Some(pause) = prepared
            .command
            .as_ref()
            .and_then(CommandSettings::sleep_between)
        {
            tracing::info!(tool_id = %job.tool_id, pause = ?pause, "Sleeping before next tool");
            tokio::time::sleep(pause).await;
        }
        Ok(message)
    }

    /// Release the entry of a stopped run, then confirm the stop.
    fn confirm_cancel(&self, job: &JobAssignment, link: &TaskLink, done: oneshot::Sender<()>) {
        self.deps.registry.deregister(&job.tool_id, link.attempt);
        let _ = done.send(());
    }

    async fn mark_running(&self, job: &JobAssignment, attempt: &mut Attempt) {
        if let Err(e) = attempt
            .run
            .mark_running(self.deps.identity.name.clone(), local_now())
        {
            tracing::warn!(tool_id = %job.tool_id, error = %e, "Unexpected tool status");
            return;
        }
        attempt.started = true;
        if let Err(e) = attempt
            .orchestrator
            .update_tool(&job.pentest, &job.tool_id, &ToolUpdate::from_run(&attempt.run))
            .await
        {
            tracing::warn!(tool_id = %job.tool_id, error = %e, "Failed to mark tool running");
        }
    }

    /// Close the attempt with `state`. A started run updates the whole run
    /// record; one that never started only changes the status.
    async fn report_end(
        &self,
        job: &JobAssignment,
        attempt: &mut Attempt,
        state: ExecutionState,
        message: &str,
    ) {
        let result = if attempt.started {
            if let Err(e) = attempt.run.finish(state, local_now()) {
                tracing::warn!(tool_id = %job.tool_id, error = %e, "Unexpected tool status");
                return;
            }
            attempt
                .orchestrator
                .update_tool(&job.pentest, &job.tool_id, &ToolUpdate::from_run(&attempt.run))
                .await
        } else {
            if let Err(e) = attempt.run.status.transition_to(state) {
                tracing::warn!(tool_id = %job.tool_id, error = %e, "Unexpected tool status");
                return;
            }
            attempt
                .orchestrator
                .set_status(
                    &job.pentest,
                    &job.tool_id,
                    &attempt.run.status.to_wire(),
                    message,
                )
                .await
        };
        if let Err(e) = result {
            tracing::warn!(tool_id = %job.tool_id, status = %state, error = %e, "Failed to report tool status");
        }
    }

    async fn append_note(
        &self,
        orchestrator: &dyn Orchestrator,
        job: &JobAssignment,
        tool: &ToolRecord,
        note: &str,
    ) {
        let notes = if tool.notes.is_empty() {
            note.to_string()
        } else {
            format!("{}\n{note}", tool.notes)
        };
        if let Err(e) = orchestrator
            .update_tool(&job.pentest, &job.tool_id, &ToolUpdate::notes(notes))
            .await
        {
            tracing::warn!(tool_id = %job.tool_id, error = %e, "Failed to update tool notes");
        }
    }
}

/// Wait for the process to exit, the deadline to pass or a cancel request,
/// serving progress queries in between.
async fn supervise(
    process: &mut ToolProcess,
    link: &mut TaskLink,
    deadline: Option<NaiveDateTime>,
) -> Exit {
    let started = Instant::now();
    let deadline = deadline.map(|at| tokio::time::Instant::now() + remaining(at, local_now()));
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);
    let mut control_open = true;

    loop {
        tokio::select! {
            status = process.wait() => {
                return match status {
                    Ok(status) => Exit::Finished(status),
                    Err(e) => {
                        kill(process).await;
                        Exit::Lost(e)
                    }
                };
            }
            () = &mut expiry => {
                tracing::warn!(pid = ?process.id(), "Tool reached its deadline, killing it");
                kill(process).await;
                return Exit::TimedOut(started.elapsed());
            }
            control = link.control.recv(), if control_open => match control {
                Some(TaskControl::Progress { reply }) => {
                    process.nudge().await;
                    let output = process.output();
                    tokio::spawn(async move {
                        let _ = reply.send(output.read(PROGRESS_POLL_WAIT).await);
                    });
                }
                Some(TaskControl::Cancel { done }) => {
                    kill(process).await;
                    return Exit::Cancelled(done);
                }
                // Registry entry gone; keep supervising the process alone.
                None => control_open = false,
            },
        }
    }
}

/// Serve control requests of a run without a live process. Progress is
/// empty; the first cancel request is handed back.
async fn next_cancel(link: &mut TaskLink) -> oneshot::Sender<()> {
    loop {
        match link.control.recv().await {
            Some(TaskControl::Progress { reply }) => {
                let _ = reply.send(String::new());
            }
            Some(TaskControl::Cancel { done }) => return done,
            None => std::future::pending::<()>().await,
        }
    }
}

async fn kill(process: &mut ToolProcess) {
    if let Err(e) = process.terminate().await {
        tracing::warn!(pid = ?process.id(), error = %e, "Failed to reap tool process");
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}
