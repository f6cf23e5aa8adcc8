//! Deadline computation for a tool run.
//!
//! A run may last until the furthest end of the time windows of its wave that
//! are active right now, further capped by the command's own timeout. Time is
//! always passed in, so every function here is pure.

use std::time::Duration;

use chrono::NaiveDateTime;

use crate::error::OrchestratorError;
use crate::orchestrator::{CommandSettings, Orchestrator, TimeWindow, ToolRecord};
use crate::worker::status::ToolStatus;

/// Schedule group of tools launched by hand. It has no time windows.
pub const UNSCHEDULED_WAVE: &str = "Custom commands";

/// Ceiling imposed by the active windows of a wave.
///
/// - no active window: `Some(now)`, the run is already out of its windows;
/// - an active window without an end: `None`;
/// - otherwise the latest end among the active windows.
pub fn schedule_deadline(windows: &[TimeWindow], now: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut active = windows.iter().filter(|w| w.contains(now)).peekable();
    if active.peek().is_none() {
        return Some(now);
    }

    let mut furthest = now;
    for window in active {
        match window.end {
            Some(end) => furthest = furthest.max(end),
            None => return None,
        }
    }
    Some(furthest)
}

/// Latest permissible end of a run, or `None` for an unbounded run.
///
/// A tool whose previous attempt timed out is retried without a deadline.
pub fn compute_deadline(
    wave: &str,
    windows: &[TimeWindow],
    timeout_secs: Option<u64>,
    previous: &ToolStatus,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    if previous.is_timed_out() {
        return None;
    }

    let schedule = if wave == UNSCHEDULED_WAVE {
        None
    } else {
        schedule_deadline(windows, now)
    };

    // Timeouts too large to represent impose no cap.
    let capped = timeout_secs
        .filter(|secs| *secs > 0)
        .and_then(|secs| chrono::Duration::try_seconds(i64::try_from(secs).ok()?))
        .and_then(|timeout| now.checked_add_signed(timeout));

    match capped {
        Some(capped) => Some(schedule.map_or(capped, |s| s.min(capped))),
        None => schedule,
    }
}

/// Fetch the windows of the tool's wave and compute its deadline.
pub async fn resolve_deadline(
    orchestrator: &dyn Orchestrator,
    pentest: &str,
    tool: &ToolRecord,
    command: Option<&CommandSettings>,
    now: NaiveDateTime,
) -> Result<Option<NaiveDateTime>, OrchestratorError> {
    let previous = ToolStatus::from_wire(&tool.status);
    if previous.is_timed_out() {
        return Ok(None);
    }

    let windows = if tool.wave == UNSCHEDULED_WAVE {
        Vec::new()
    } else {
        orchestrator.fetch_intervals(pentest, &tool.wave).await?
    };

    Ok(compute_deadline(
        &tool.wave,
        &windows,
        command.and_then(CommandSettings::timeout_secs),
        &previous,
        now,
    ))
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining(deadline: NaiveDateTime, now: NaiveDateTime) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}
