//! Text summary builder for `--status`.
//!
//! Formats the persisted state of every known run as human-readable lines.

use crate::model::{ExecutionOutcome, RunState, RunStatus};
use time::format_description::well_known::Rfc3339;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn outcome_label(outcome: Option<ExecutionOutcome>) -> &'static str {
    match outcome {
        Some(ExecutionOutcome::Success) => "success",
        Some(ExecutionOutcome::Failure) => "failure",
        Some(ExecutionOutcome::Unknown) => "unknown",
        None => "running",
    }
}

/// Build a status summary, one block per run in the given order.
pub(crate) fn build_status_summary(states: &[RunState]) -> TextSummary {
    let count = |status: RunStatus| states.iter().filter(|s| s.status == status).count();
    let mut lines = vec![format!(
        "Runs: {} (queued {}, running {}, completed {}, failed {})",
        states.len(),
        count(RunStatus::Queued),
        count(RunStatus::Running),
        count(RunStatus::Completed),
        count(RunStatus::Failed),
    )];

    for state in states {
        let mut header = format!(
            "{}: {} (attempt {}",
            state.run.run_id, state.status, state.attempt
        );
        if state.interrupted {
            header.push_str(", interrupted");
        }
        header.push(')');
        if let Ok(updated) = state.updated_at.format(&Rfc3339) {
            header.push_str(&format!(" updated {updated}"));
        }
        lines.push(header);

        for record in &state.executions {
            let mut line = format!(
                "  {}@{}: {}",
                record.pipeline_name,
                record.pipeline_version,
                outcome_label(record.outcome)
            );
            if let Some(code) = record.exit_code {
                line.push_str(&format!(", exit {code}"));
            }
            if let Some(elapsed) = record.elapsed() {
                let rounded = std::time::Duration::from_secs(elapsed.as_secs());
                line.push_str(&format!(", {}", humantime::format_duration(rounded)));
            }
            lines.push(line);
        }
    }

    TextSummary { lines }
}
