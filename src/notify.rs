//! Outcome notifications.
//!
//! Delivery is best-effort: a failed or timed-out send is logged as `notification_failed` and
//! never changes run state or stops the loop. The loop and run tasks only [`Notifier::publish`];
//! delivery happens on tracked background tasks that [`Notifier::flush`] waits for.

use crate::config::OrchestratorConfig;
use crate::error::NotificationError;
use crate::model::{ExecutionOutcome, RunState};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    RunStarted { state: RunState },
    RunCompleted { state: RunState },
    RunFailed { state: RunState, reason: String },
    CycleError { message: String },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::RunStarted { .. } => "run_started",
            NotificationEvent::RunCompleted { .. } => "run_completed",
            NotificationEvent::RunFailed { .. } => "run_failed",
            NotificationEvent::CycleError { .. } => "cycle_error",
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            NotificationEvent::RunStarted { state }
            | NotificationEvent::RunCompleted { state }
            | NotificationEvent::RunFailed { state, .. } => Some(&state.run.run_id),
            NotificationEvent::CycleError { .. } => None,
        }
    }

    /// Subject and plain-text body.
    pub fn render(&self) -> (String, String) {
        match self {
            NotificationEvent::RunStarted { state } => (
                format!("[auto-qc] Analysis started: {}", state.run.run_id),
                render_run(state, None),
            ),
            NotificationEvent::RunCompleted { state } => (
                format!("[auto-qc] Analysis completed: {}", state.run.run_id),
                render_run(state, None),
            ),
            NotificationEvent::RunFailed { state, reason } => (
                format!("[auto-qc] Analysis FAILED: {}", state.run.run_id),
                render_run(state, Some(reason)),
            ),
            NotificationEvent::CycleError { message } => (
                "[auto-qc] Scan cycle error".to_string(),
                format!("The orchestrator could not complete a scan cycle.\n\n{message}\n"),
            ),
        }
    }
}

fn render_run(state: &RunState, reason: Option<&str>) -> String {
    let mut lines = vec![
        format!("Run: {}", state.run.run_id),
        format!("Run directory: {}", state.run.run_dir.display()),
        format!("Status: {} (attempt {})", state.status, state.attempt),
    ];
    if let Some(reason) = reason {
        lines.push(format!("Reason: {reason}"));
    }
    for record in &state.executions {
        lines.push(String::new());
        lines.push(format!(
            "Pipeline: {} {}",
            record.pipeline_name, record.pipeline_version
        ));
        let outcome = match record.outcome {
            Some(ExecutionOutcome::Success) => "success",
            Some(ExecutionOutcome::Failure) => "failure",
            Some(ExecutionOutcome::Unknown) => "unknown",
            None => "running",
        };
        lines.push(format!("  Outcome: {outcome}"));
        if let Some(code) = record.exit_code {
            lines.push(format!("  Exit code: {code}"));
        }
        if let Some(elapsed) = record.elapsed() {
            let rounded = std::time::Duration::from_secs(elapsed.as_secs());
            lines.push(format!(
                "  Duration: {}",
                humantime::format_duration(rounded)
            ));
        }
        lines.push(format!("  Output: {}", record.output_dir.display()));
        if !record.diagnostic_tail.is_empty() {
            lines.push("  Last output:".to_string());
            lines.extend(record.diagnostic_tail.iter().map(|l| format!("    {l}")));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotificationError>;
}

/// Pipes an RFC 822 message into a local mail command (`sendmail -t` by default).
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
    sender: Option<String>,
}

impl CommandTransport {
    pub fn new(command: &[String], sender: Option<String>) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => ("sendmail".to_string(), vec!["-t".to_string()]),
        };
        Self {
            program,
            args,
            sender,
        }
    }

    fn message(&self, recipients: &[String], subject: &str, body: &str) -> String {
        let mut msg = format!("To: {}\n", recipients.join(", "));
        if let Some(from) = self.sender.as_ref() {
            msg.push_str(&format!("From: {from}\n"));
        }
        msg.push_str(&format!("Subject: {subject}\n"));
        msg.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        msg.push_str(body);
        msg
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotificationError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotificationError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.message(recipients, subject, body).as_bytes())
                .await
                .map_err(NotificationError::Write)?;
            // Closing stdin ends the message.
            drop(stdin);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(NotificationError::Write)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Notifier {
    enabled: bool,
    recipients: Vec<String>,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
    deliveries: TaskTracker,
}

impl Notifier {
    pub fn new(enabled: bool, recipients: Vec<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            enabled,
            recipients,
            transport,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            deliveries: TaskTracker::new(),
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self::new(
            cfg.send_notification_emails,
            cfg.notification_email_addresses.clone(),
            Arc::new(CommandTransport::new(
                &cfg.notification_command,
                cfg.notification_sender.clone(),
            )),
        )
        .with_send_timeout(cfg.notification_timeout)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Deliver in the background and return at once.
    pub fn publish(&self, event: NotificationEvent) {
        if !self.enabled || self.recipients.is_empty() {
            return;
        }
        let notifier = self.clone();
        self.deliveries.spawn(async move { notifier.notify(&event).await });
    }

    /// Wait for every published delivery. Bounded by the send timeout.
    pub async fn flush(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    pub async fn notify(&self, event: &NotificationEvent) {
        if !self.enabled || self.recipients.is_empty() {
            return;
        }
        let (subject, body) = event.render();
        let sent = tokio::time::timeout(
            self.send_timeout,
            self.transport.send(&self.recipients, &subject, &body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(NotificationError::TimedOut {
                after: humantime::format_duration(self.send_timeout).to_string(),
            })
        });
        match sent {
            Ok(()) => info!(
                event_type = "notification_sent",
                notification = event.kind(),
                run_id = ?event.run_id(),
                recipients = ?self.recipients,
            ),
            Err(e) => warn!(
                event_type = "notification_failed",
                notification = event.kind(),
                run_id = ?event.run_id(),
                error = %e,
            ),
        }
    }
}
