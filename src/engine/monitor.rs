use super::ExecutionControl;
use crate::model::{ExecutionOutcome, ExecutionRecord};
use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long output readers may keep draining after the pipeline itself has exited. Background
/// children that inherited the pipes would otherwise hold the run open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Bounded buffer of the most recent output lines from a pipeline.
#[derive(Debug)]
pub(crate) struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub(crate) fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines).into()
    }
}

fn spawn_reader<R>(
    stream: Option<R>,
    prefix: &'static str,
    tail: Arc<Mutex<OutputTail>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        // Bytes, not lines: output that is not UTF-8 must not stop the drain, or the pipeline
        // dies of SIGPIPE on its next write.
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if let Ok(mut tail) = tail.lock() {
                        tail.push(format!("{prefix}: {line}"));
                    }
                }
            }
        }
    })
}

async fn finish_reader(handle: JoinHandle<()>, run_id: &str, stream: &'static str) {
    let mut handle = handle;
    if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut handle).await.is_err() {
        handle.abort();
        warn!(
            event_type = "output_reader_detached",
            run_id = %run_id,
            stream,
            "pipeline exited but its {stream} is still held open"
        );
    }
}

/// The pipeline leads its own process group; take its workers down with it.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    match super::process::kill_process_group(pid) {
        Ok(()) => Ok(()),
        Err(_) => child.start_kill(),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn describe_abnormal_exit(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|sig| format!("pipeline terminated by signal {sig}"))
}

#[cfg(not(unix))]
fn describe_abnormal_exit(_status: &ExitStatus) -> Option<String> {
    None
}

/// Wait for the pipeline to exit, honouring terminate requests, and close the record.
pub(crate) async fn monitor(
    mut child: Child,
    mut record: ExecutionRecord,
    mut control_rx: mpsc::UnboundedReceiver<ExecutionControl>,
    tail_lines: usize,
) -> ExecutionRecord {
    let tail = Arc::new(Mutex::new(OutputTail::new(tail_lines)));
    let stdout_handle = spawn_reader(child.stdout.take(), "stdout", tail.clone());
    let stderr_handle = spawn_reader(child.stderr.take(), "stderr", tail.clone());

    let mut terminated = false;
    let waited = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(ctrl) = control_rx.recv() => match ctrl {
                ExecutionControl::Terminate => {
                    terminated = true;
                    if let Err(e) = kill_process_group(&mut child) {
                        warn!(event_type = "pipeline_kill_failed", run_id = %record.run_id, error = %e);
                    }
                }
            },
        }
    };

    finish_reader(stdout_handle, &record.run_id, "stdout").await;
    finish_reader(stderr_handle, &record.run_id, "stderr").await;
    let mut diagnostics = tail
        .lock()
        .map(|mut t| t.take_lines())
        .unwrap_or_default();

    let (outcome, exit_code) = match &waited {
        Ok(status) if status.success() && !terminated => (ExecutionOutcome::Success, status.code()),
        Ok(status) => {
            if let Some(msg) = describe_abnormal_exit(status) {
                diagnostics.push(msg);
            }
            if terminated {
                diagnostics.push("pipeline terminated by orchestrator shutdown".to_string());
            }
            (ExecutionOutcome::Failure, status.code())
        }
        Err(e) => {
            diagnostics.push(format!("failed waiting for pipeline: {e}"));
            (ExecutionOutcome::Failure, None)
        }
    };
    if outcome == ExecutionOutcome::Success {
        diagnostics.clear();
    }
    record.finish(OffsetDateTime::now_utc(), outcome, exit_code, diagnostics);

    match outcome {
        ExecutionOutcome::Success => info!(
            event_type = "pipeline_complete",
            run_id = %record.run_id,
            pipeline_name = %record.pipeline_name,
            pipeline_version = %record.pipeline_version,
            output_dir = %record.output_dir.display(),
        ),
        _ => warn!(
            event_type = "pipeline_failed",
            run_id = %record.run_id,
            pipeline_name = %record.pipeline_name,
            pipeline_version = %record.pipeline_version,
            exit_code = ?record.exit_code,
            diagnostic_tail = ?record.diagnostic_tail,
        ),
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_lines() {
        let mut tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.take_lines(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn zero_capacity_tail_keeps_nothing() {
        let mut tail = OutputTail::new(0);
        tail.push("x".into());
        assert!(tail.take_lines().is_empty());
    }
}
