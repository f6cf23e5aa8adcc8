//! Tool status state machine.
//!
//! A tool's status on the wire is a list of strings. Internally it is one
//! primary [`ExecutionState`] plus the two scheduling modifiers `OOT` (out of
//! time window) and `OOS` (out of scope), which survive every transition.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::StatusError;

/// Wire names of the scheduling modifiers.
pub const OUT_OF_TIME: &str = "OOT";
pub const OUT_OF_SCOPE: &str = "OOS";

/// Primary execution state of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Not run yet, or reset by an administrator.
    Ready,
    /// A worker process is executing the tool.
    Running,
    /// Process exited cleanly and its result was imported.
    Done,
    /// Dispatch, environment, execution or import failure.
    Error,
    /// Killed because the deadline passed.
    TimedOut,
}

impl ExecutionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;

        match (self, target) {
            // Administrative reset and dispatch failures are allowed from anywhere.
            (_, Ready) | (_, Error) => true,
            // A stale `running` left by a dead worker may be re-dispatched.
            (_, Running) => true,
            (Running, Done) | (Running, TimedOut) => true,
            _ => false,
        }
    }

    /// Terminal state of one execution attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::TimedOut)
    }

    fn wire_name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::TimedOut => "timedout",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Full status of a tool: primary state plus orthogonal modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolStatus {
    pub state: ExecutionState,
    pub out_of_time: bool,
    pub out_of_scope: bool,
}

impl Default for ToolStatus {
    fn default() -> Self {
        Self {
            state: ExecutionState::Ready,
            out_of_time: false,
            out_of_scope: false,
        }
    }
}

impl ToolStatus {
    /// Parse the wire list. When a legacy record carries several primary
    /// states, `running` wins, then the terminal states.
    pub fn from_wire<S: AsRef<str>>(list: &[S]) -> Self {
        let has = |name: &str| list.iter().any(|s| s.as_ref() == name);

        let state = [
            ExecutionState::Running,
            ExecutionState::TimedOut,
            ExecutionState::Error,
            ExecutionState::Done,
        ]
        .into_iter()
        .find(|s| has(s.wire_name()))
        .unwrap_or(ExecutionState::Ready);

        for unknown in list.iter().map(AsRef::as_ref).filter(|s| {
            ![
                "ready", "running", "done", "error", "timedout", OUT_OF_TIME, OUT_OF_SCOPE,
            ]
            .contains(s)
        }) {
            tracing::debug!(status = %unknown, "Ignoring unknown tool status flag");
        }

        Self {
            state,
            out_of_time: has(OUT_OF_TIME),
            out_of_scope: has(OUT_OF_SCOPE),
        }
    }

    /// Wire list. A ready tool carrying modifiers is reported by its
    /// modifiers alone.
    pub fn to_wire(&self) -> Vec<String> {
        let mut list = Vec::with_capacity(3);
        let has_modifier = self.out_of_time || self.out_of_scope;
        if self.state != ExecutionState::Ready || !has_modifier {
            list.push(self.state.wire_name().to_string());
        }
        if self.out_of_scope {
            list.push(OUT_OF_SCOPE.to_string());
        }
        if self.out_of_time {
            list.push(OUT_OF_TIME.to_string());
        }
        list
    }

    /// Move to a new primary state, keeping the modifiers.
    pub fn transition_to(&mut self, target: ExecutionState) -> Result<(), StatusError> {
        if !self.state.can_transition_to(target) {
            return Err(StatusError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    pub fn is_timed_out(&self) -> bool {
        self.state == ExecutionState::TimedOut
    }
}

/// Execution bookkeeping kept on the tool record next to its status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRun {
    pub status: ToolStatus,
    /// Name of the worker that ran the tool last.
    pub worker: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
}

impl ToolRun {
    pub fn new(status: ToolStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Enter `running` for `worker`: records the start, clears the end.
    pub fn mark_running(
        &mut self,
        worker: impl Into<String>,
        now: NaiveDateTime,
    ) -> Result<(), StatusError> {
        self.status.transition_to(ExecutionState::Running)?;
        self.worker = Some(worker.into());
        self.started_at = Some(now);
        self.ended_at = None;
        Ok(())
    }

    /// Close the current attempt with a terminal state.
    pub fn finish(&mut self, state: ExecutionState, now: NaiveDateTime) -> Result<(), StatusError> {
        debug_assert!(state.is_terminal());
        self.status.transition_to(state)?;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Administrative reset: drops `done`/`running`, the worker and both
    /// timestamps. Modifiers survive.
    pub fn mark_not_done(&mut self) {
        self.worker = None;
        self.started_at = None;
        self.ended_at = None;
        // Ready is reachable from every state.
        let _ = self.status.transition_to(ExecutionState::Ready);
    }
}
