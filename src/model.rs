use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Lifecycle of a sequencing run. Transitions only move forward (see [`RunStatus::can_advance_to`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Discovered,
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Discovered => "discovered",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            RunStatus::Discovered => 0,
            RunStatus::Queued => 1,
            RunStatus::Running => 2,
            RunStatus::Completed | RunStatus::Failed => 3,
        }
    }

    /// Forward-only check. Queued may jump straight to Failed when the launch itself fails.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Queued, RunStatus::Completed) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Gridion,
    Promethion,
    Unknown,
}

/// One sequencing-run directory under the watched root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub instrument_type: InstrumentType,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
}

/// How a pipeline execution ended. `Unknown` marks executions cut short by an orchestrator crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Unknown,
}

/// Terminal verdict handed to the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Interrupted,
}

impl RunOutcome {
    pub fn status(self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed | RunOutcome::Interrupted => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub pipeline_name: String,
    pub pipeline_version: String,
    pub parameters: IndexMap<String, String>,
    pub command: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub outcome: Option<ExecutionOutcome>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub diagnostic_tail: Vec<String>,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Pid of the pipeline process, which also names its process group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ExecutionRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Close the record. The end time is set once; later calls are ignored and return false.
    pub fn finish(
        &mut self,
        at: OffsetDateTime,
        outcome: ExecutionOutcome,
        exit_code: Option<i32>,
        diagnostic_tail: Vec<String>,
    ) -> bool {
        if self.finished_at.is_some() {
            return false;
        }
        // Clock adjustments must not produce an end before the start.
        self.finished_at = Some(at.max(self.started_at));
        self.outcome = Some(outcome);
        self.exit_code = exit_code;
        self.diagnostic_tail = diagnostic_tail;
        true
    }

    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let end = self.finished_at?;
        (end - self.started_at).try_into().ok()
    }
}

/// Persisted status of one run: the unit the state store reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run: Run,
    pub status: RunStatus,
    pub attempt: u32,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    /// Records of earlier attempts superseded by a retry.
    #[serde(default)]
    pub superseded: Vec<ExecutionRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
