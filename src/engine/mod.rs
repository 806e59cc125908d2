mod command;
mod monitor;
pub(crate) mod process;

pub use command::{build_invocation, Invocation, LaunchSettings};

use crate::config::PipelineSpec;
use crate::error::LaunchError;
use crate::model::{ExecutionOutcome, ExecutionRecord, Run};
use crate::orchestrator::Slot;
use std::process::Stdio;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub enum ExecutionControl {
    /// Kill the pipeline process; the record is closed as a failure.
    Terminate,
}

/// A running pipeline. The monitor task owns the child process and the open record until exit.
pub struct ExecutionHandle {
    pub record: ExecutionRecord,
    control_tx: mpsc::UnboundedSender<ExecutionControl>,
    join: tokio::task::JoinHandle<ExecutionRecord>,
}

impl ExecutionHandle {
    pub fn controller(&self) -> mpsc::UnboundedSender<ExecutionControl> {
        self.control_tx.clone()
    }

    /// Wait for the process to exit. A panicked monitor yields an `unknown` outcome.
    pub async fn wait(self) -> ExecutionRecord {
        let ExecutionHandle { record, join, .. } = self;
        match join.await {
            Ok(finished) => finished,
            Err(e) => {
                let mut record = record;
                record.finish(
                    OffsetDateTime::now_utc(),
                    ExecutionOutcome::Unknown,
                    None,
                    vec![format!("execution monitor failed: {e}")],
                );
                record
            }
        }
    }
}

/// A resolved invocation whose record can be persisted before the process exists.
#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub invocation: Invocation,
    pub record: ExecutionRecord,
}

pub struct PipelineLauncher {
    settings: LaunchSettings,
}

impl PipelineLauncher {
    pub fn new(settings: LaunchSettings) -> Self {
        Self { settings }
    }

    /// Resolve the command line and build the open execution record. Touches nothing on disk.
    pub fn prepare(&self, run: &Run, spec: &PipelineSpec) -> Result<PreparedLaunch, LaunchError> {
        let started_at = OffsetDateTime::now_utc();
        let invocation = build_invocation(&self.settings, run, spec, started_at)?;
        let record = ExecutionRecord {
            run_id: run.run_id.clone(),
            pipeline_name: spec.pipeline_name.clone(),
            pipeline_version: spec.pipeline_version.clone(),
            parameters: invocation.parameters.clone(),
            command: invocation.command_line(),
            started_at,
            finished_at: None,
            outcome: None,
            exit_code: None,
            diagnostic_tail: Vec::new(),
            work_dir: invocation.work_dir.clone(),
            output_dir: invocation.output_dir.clone(),
            pid: None,
        };
        Ok(PreparedLaunch { invocation, record })
    }

    /// Prepare per-run directories and spawn the pipeline. Never retries.
    ///
    /// The slot is not consumed: the caller keeps it until the outcome is recorded.
    #[tracing::instrument(skip_all, fields(run_id = %prepared.record.run_id))]
    pub fn spawn(
        &self,
        prepared: PreparedLaunch,
        _slot: &Slot,
    ) -> Result<ExecutionHandle, LaunchError> {
        let PreparedLaunch {
            invocation,
            mut record,
        } = prepared;

        if invocation.work_dir.exists() {
            std::fs::remove_dir_all(&invocation.work_dir).map_err(|source| {
                LaunchError::PrepareDir {
                    path: invocation.work_dir.clone(),
                    source,
                }
            })?;
        }
        for dir in [&invocation.work_dir, &invocation.output_dir] {
            std::fs::create_dir_all(dir).map_err(|source| LaunchError::PrepareDir {
                path: dir.clone(),
                source,
            })?;
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a Ctrl-C on the orchestrator's terminal must not reach the pipeline.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        record.pid = child.id();

        info!(
            event_type = "pipeline_start",
            run_id = %record.run_id,
            pipeline_name = %record.pipeline_name,
            pipeline_version = %record.pipeline_version,
            pipeline_command = %record.command.join(" "),
            pid = ?record.pid,
        );

        let (control_tx, control_rx) = mpsc::unbounded_channel::<ExecutionControl>();
        let join = tokio::spawn(monitor::monitor(
            child,
            record.clone(),
            control_rx,
            self.settings.diagnostic_tail_lines,
        ));
        Ok(ExecutionHandle {
            record,
            control_tx,
            join,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ParameterValue;
    use crate::model::InstrumentType;
    use crate::orchestrator::ConcurrencyController;
    use indexmap::IndexMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn fake_pipeline(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-nextflow");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn setup(body: &str) -> (tempfile::TempDir, PipelineLauncher, Run, PipelineSpec) {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_pipeline(tmp.path(), body);
        let launcher = PipelineLauncher::new(LaunchSettings {
            nextflow_binary: program.display().to_string(),
            profile: None,
            conda_cache_dir: None,
            output_root: tmp.path().join("out"),
            work_root: tmp.path().join("work"),
            diagnostic_tail_lines: 5,
        });
        let run = Run {
            run_id: "R1".into(),
            run_dir: tmp.path().join("fastq/R1"),
            instrument_type: InstrumentType::Unknown,
            discovered_at: OffsetDateTime::now_utc(),
        };
        let mut params = IndexMap::new();
        params.insert("outdir".to_string(), ParameterValue::Fill);
        let spec = PipelineSpec {
            pipeline_name: "org/qc".into(),
            pipeline_version: "1.0.0".into(),
            pipeline_parameters: params,
        };
        (tmp, launcher, run, spec)
    }

    fn launch(
        launcher: &PipelineLauncher,
        run: &Run,
        spec: &PipelineSpec,
        slot: &Slot,
    ) -> Result<ExecutionHandle, LaunchError> {
        let prepared = launcher.prepare(run, spec)?;
        launcher.spawn(prepared, slot)
    }

    #[tokio::test]
    async fn successful_exit_is_success() {
        let (_tmp, launcher, run, spec) = setup("echo \"$@\"\nexit 0");
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let handle = launch(&launcher, &run, &spec, &slot).unwrap();
        assert!(handle.record.work_dir.is_dir());
        assert!(handle.record.output_dir.is_dir());
        let record = handle.wait().await;
        assert_eq!(record.outcome, Some(ExecutionOutcome::Success));
        assert_eq!(record.exit_code, Some(0));
        assert!(record.finished_at.unwrap() >= record.started_at);
        assert!(record.diagnostic_tail.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_diagnostic_tail() {
        let body = "for i in 1 2 3 4 5 6 7; do echo \"line $i\"; done\necho 'ERROR ~ missing db' >&2\nexit 1";
        let (_tmp, launcher, run, spec) = setup(body);
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let record = launch(&launcher, &run, &spec, &slot).unwrap().wait().await;
        assert_eq!(record.outcome, Some(ExecutionOutcome::Failure));
        assert_eq!(record.exit_code, Some(1));
        assert!(record.diagnostic_tail.len() <= 5);
        assert!(record
            .diagnostic_tail
            .iter()
            .any(|l| l == "stderr: ERROR ~ missing db"));
        assert!(!record.diagnostic_tail.iter().any(|l| l == "stdout: line 1"));
    }

    #[tokio::test]
    async fn terminate_kills_the_pipeline() {
        let (_tmp, launcher, run, spec) = setup("sleep 30");
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let handle = launch(&launcher, &run, &spec, &slot).unwrap();
        handle.controller().send(ExecutionControl::Terminate).unwrap();
        let record = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("terminated pipeline should exit promptly");
        assert_eq!(record.outcome, Some(ExecutionOutcome::Failure));
        assert!(record
            .diagnostic_tail
            .iter()
            .any(|l| l.contains("orchestrator shutdown")));
    }

    #[tokio::test]
    async fn invalid_utf8_output_does_not_break_the_pipe() {
        let body = "printf '\\377\\n'\ni=0\nwhile [ $i -lt 5000 ]; do echo \"line $i\"; i=$((i+1)); done\nprintf 'bad \\377 tail\\n' >&2\nexit 0";
        let (_tmp, launcher, run, spec) = setup(body);
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let handle = launch(&launcher, &run, &spec, &slot).unwrap();
        assert!(handle.record.pid.is_some());
        let record = tokio::time::timeout(Duration::from_secs(20), handle.wait())
            .await
            .unwrap();
        assert_eq!(record.outcome, Some(ExecutionOutcome::Success));
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn invalid_utf8_is_kept_lossily_in_the_tail() {
        let (_tmp, launcher, run, spec) = setup("printf 'oops \\377\\n' >&2\nexit 4");
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let record = launch(&launcher, &run, &spec, &slot).unwrap().wait().await;
        assert_eq!(record.exit_code, Some(4));
        assert!(record
            .diagnostic_tail
            .iter()
            .any(|l| l == "stderr: oops \u{FFFD}"));
    }

    #[tokio::test]
    async fn background_child_holding_output_does_not_keep_run_open() {
        let (_tmp, launcher, run, spec) = setup("sleep 20 &\nexit 0");
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        let handle = launch(&launcher, &run, &spec, &slot).unwrap();
        let pid = handle.record.pid.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(8), handle.wait())
            .await
            .expect("monitor should return shortly after the pipeline exits");
        assert_eq!(record.outcome, Some(ExecutionOutcome::Success));
        let _ = process::kill_process_group(pid);
    }

    #[test]
    fn prepare_does_not_touch_disk() {
        let (_tmp, launcher, run, spec) = setup("exit 0");
        let prepared = launcher.prepare(&run, &spec).unwrap();
        assert!(!prepared.record.is_finished());
        assert!(!prepared.record.work_dir.exists());
        assert!(!prepared.record.output_dir.exists());
        assert_eq!(prepared.record.command, prepared.invocation.command_line());
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let (tmp, _launcher, run, spec) = setup("exit 0");
        let launcher = PipelineLauncher::new(LaunchSettings {
            nextflow_binary: tmp.path().join("no-such-binary").display().to_string(),
            profile: None,
            conda_cache_dir: None,
            output_root: tmp.path().join("out"),
            work_root: tmp.path().join("work"),
            diagnostic_tail_lines: 5,
        });
        let slots = ConcurrencyController::new(1);
        let slot = slots.try_acquire().unwrap();
        assert!(matches!(
            launch(&launcher, &run, &spec, &slot),
            Err(LaunchError::Spawn { .. })
        ));
    }
}
