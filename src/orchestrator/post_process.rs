//! Post-run processing.
//!
//! Writes completion markers, records the terminal outcome, removes work directories and
//! sends the outcome notification once a run's pipelines have all exited.

use super::controller::RunContext;
use crate::config::PipelineSpec;
use crate::error::LaunchError;
use crate::model::{ExecutionOutcome, ExecutionRecord, RunOutcome, RunState};
use crate::notify::NotificationEvent;
use serde::Serialize;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{error, info, warn};

pub(crate) const COMPLETION_MARKER: &str = "analysis_complete.json";

/// Why a run did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunFailure {
    Launch { pipeline: String, error: String },
    Pipeline { pipeline: String, exit_code: Option<i32> },
    Store(String),
    /// Stopped by a terminating shutdown.
    Terminated,
}

impl RunFailure {
    pub(crate) fn launch(spec: &PipelineSpec, e: &LaunchError) -> Self {
        RunFailure::Launch {
            pipeline: spec.label(),
            error: e.to_string(),
        }
    }

    pub(crate) fn outcome(&self) -> RunOutcome {
        match self {
            RunFailure::Terminated => RunOutcome::Interrupted,
            _ => RunOutcome::Failed,
        }
    }

    pub(crate) fn reason(&self) -> String {
        match self {
            RunFailure::Launch { pipeline, error } => {
                format!("{pipeline} could not be started: {error}")
            }
            RunFailure::Pipeline {
                pipeline,
                exit_code: Some(code),
            } => format!("{pipeline} exited with status {code}"),
            RunFailure::Pipeline {
                pipeline,
                exit_code: None,
            } => format!("{pipeline} exited abnormally"),
            RunFailure::Store(e) => format!("run state could not be recorded: {e}"),
            RunFailure::Terminated => "interrupted by orchestrator shutdown".to_string(),
        }
    }
}

#[derive(Serialize)]
struct CompletionMarker {
    #[serde(with = "time::serde::rfc3339")]
    timestamp_analysis_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    timestamp_analysis_complete: OffsetDateTime,
}

fn write_completion_marker(record: &ExecutionRecord) -> std::io::Result<()> {
    let marker = CompletionMarker {
        timestamp_analysis_start: record.started_at,
        timestamp_analysis_complete: record.finished_at.unwrap_or_else(OffsetDateTime::now_utc),
    };
    let json = serde_json::to_string_pretty(&marker).map_err(std::io::Error::other)?;
    std::fs::write(record.output_dir.join(COMPLETION_MARKER), json)
}

fn remove_work_dir(run_id: &str, work_dir: &Path) {
    if !work_dir.exists() {
        return;
    }
    match std::fs::remove_dir_all(work_dir) {
        Ok(()) => info!(
            event_type = "work_dir_deleted",
            run_id = %run_id,
            work_dir = %work_dir.display(),
        ),
        Err(e) => warn!(
            event_type = "delete_work_dir_failed",
            run_id = %run_id,
            work_dir = %work_dir.display(),
            error = %e,
        ),
    }
}

/// Record the terminal outcome of a run and publish it. Delivery happens in the background, so
/// a stuck mail command never holds the run's slot.
///
/// Returns the terminal state, or `None` when the store refused the transition.
pub(crate) fn process_run_completion(
    ctx: &RunContext,
    run_id: &str,
    failure: Option<RunFailure>,
) -> Option<RunState> {
    let outcome = failure
        .as_ref()
        .map_or(RunOutcome::Completed, RunFailure::outcome);

    let succeeded: Vec<ExecutionRecord> = ctx
        .store
        .get(run_id)
        .map(|state| state.executions)
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.outcome == Some(ExecutionOutcome::Success))
        .collect();

    if outcome == RunOutcome::Completed {
        for record in &succeeded {
            if let Err(e) = write_completion_marker(record) {
                warn!(
                    event_type = "completion_marker_failed",
                    run_id = %run_id,
                    output_dir = %record.output_dir.display(),
                    error = %e,
                );
            }
        }
    }

    let state = match ctx.store.mark_terminal(run_id, outcome) {
        Ok(state) => state,
        Err(e) => {
            error!(event_type = "state_store_error", run_id = %run_id, error = %e);
            return None;
        }
    };
    info!(
        event_type = "run_finished",
        run_id = %run_id,
        status = %state.status,
        attempt = state.attempt,
        interrupted = state.interrupted,
    );

    if outcome == RunOutcome::Completed && ctx.cleanup_work_dir {
        for record in &succeeded {
            remove_work_dir(run_id, &record.work_dir);
        }
    }

    let event = match failure {
        None => NotificationEvent::RunCompleted {
            state: state.clone(),
        },
        Some(failure) => NotificationEvent::RunFailed {
            state: state.clone(),
            reason: failure.reason(),
        },
    };
    ctx.notifier.publish(event);
    Some(state)
}
