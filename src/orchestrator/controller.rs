//! Scan/dispatch loop.
//!
//! One cycle: list the watched root, claim every newly ready run, then hand queued runs to free
//! slots. Each admitted run executes in its own task; the loop itself never waits on a pipeline
//! and wakes early when one finishes so a freed slot is reused without waiting a full interval.

use super::post_process::{process_run_completion, RunFailure};
use super::slots::{ConcurrencyController, Slot};
use crate::config::{OrchestratorConfig, PipelineSpec, ShutdownPolicy};
use crate::engine::{ExecutionControl, PipelineLauncher};
use crate::error::{CycleError, StoreError};
use crate::model::{ExecutionOutcome, Run, RunOutcome, RunStatus};
use crate::notify::{NotificationEvent, Notifier};
use crate::scanner::{self, ReadinessRules};
use crate::storage::{QueueOutcome, StateStore};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one scan/dispatch cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub queued: usize,
    pub dispatched: Vec<String>,
}

/// Shared by every run task.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub store: Arc<StateStore>,
    pub launcher: Arc<PipelineLauncher>,
    pub notifier: Notifier,
    pub pipelines: Arc<Vec<PipelineSpec>>,
    pub cleanup_work_dir: bool,
    pub slots: ConcurrencyController,
}

type RunTaskResult = (String, bool);

pub struct Orchestrator {
    watched_root: PathBuf,
    rules: ReadinessRules,
    scan_interval: std::time::Duration,
    shutdown_policy: ShutdownPolicy,
    ctx: RunContext,
    in_flight: JoinSet<RunTaskResult>,
    // Runs handed to a task whose status may still read Queued.
    active: HashSet<String>,
    // Running runs left by a previous session whose pipeline is still alive, with the slot
    // they occupy when one was free.
    orphans: Vec<(String, Option<Slot>)>,
    terminate: CancellationToken,
    last_exit_code: Option<u8>,
    last_cycle_error: Option<String>,
}

impl Orchestrator {
    pub fn new(
        cfg: &OrchestratorConfig,
        store: Arc<StateStore>,
        launcher: PipelineLauncher,
        notifier: Notifier,
    ) -> Result<Self, regex::Error> {
        let slots = ConcurrencyController::new(cfg.max_concurrent_analyses);
        // Nothing has been dispatched yet, so every Running run belongs to a previous session.
        let orphans = store
            .snapshot()
            .into_iter()
            .filter(|s| s.status == RunStatus::Running)
            .map(|s| (s.run.run_id, slots.try_acquire()))
            .collect();
        Ok(Self {
            watched_root: cfg.fastq_by_run_dir.clone(),
            rules: ReadinessRules::from_config(cfg)?,
            scan_interval: cfg.scan_interval(),
            shutdown_policy: cfg.shutdown_policy,
            ctx: RunContext {
                store,
                launcher: Arc::new(launcher),
                notifier,
                pipelines: Arc::new(cfg.pipelines.clone()),
                cleanup_work_dir: cfg.cleanup_work_dir,
                slots,
            },
            in_flight: JoinSet::new(),
            active: HashSet::new(),
            orphans,
            terminate: CancellationToken::new(),
            last_exit_code: None,
            last_cycle_error: None,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.ctx.store
    }

    /// Exit code of the session so far: the last cycle error's code, or zero.
    pub fn exit_code(&self) -> u8 {
        self.last_exit_code.unwrap_or(0)
    }

    /// One scan phase followed by one dispatch phase. Scan failures do not prevent dispatching
    /// runs queued by earlier cycles.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.settle_orphans();
        let scanned = self.scan_and_queue().await;
        let dispatched = self.dispatch();
        let (candidates, queued) = match scanned {
            Ok(counts) => counts,
            Err(e) => {
                self.record_cycle_error(&e);
                return Err(e);
            }
        };
        if let Some(previous) = self.last_cycle_error.take() {
            info!(event_type = "cycle_recovered", previous_error = %previous);
        }
        Ok(CycleReport {
            candidates,
            queued,
            dispatched,
        })
    }

    /// `run_cycle` for the loop: errors are already logged, notified and folded into the
    /// exit code.
    async fn cycle(&mut self) {
        if let Ok(report) = self.run_cycle().await {
            debug!(
                event_type = "cycle_complete",
                candidates = report.candidates,
                queued = report.queued,
                dispatched = ?report.dispatched,
            );
        }
    }

    #[tracing::instrument(skip_all)]
    async fn scan_and_queue(&self) -> Result<(usize, usize), CycleError> {
        let root = self.watched_root.clone();
        let rules = self.rules.clone();
        let candidates = tokio::task::spawn_blocking(move || {
            scanner::scan(&root, rules).map(|runs| runs.collect::<Vec<Run>>())
        })
        .await
        .map_err(|e| CycleError::Join(e.to_string()))??;

        let store = &self.ctx.store;
        let mut queued = 0;
        let mut store_error: Option<StoreError> = None;
        for run in &candidates {
            if !store.is_eligible(&run.run_id) {
                continue;
            }
            info!(
                event_type = "run_discovered",
                run_id = %run.run_id,
                run_directory_path = %run.run_dir.display(),
                instrument_type = ?run.instrument_type,
            );
            match store.mark_queued(run) {
                Ok(QueueOutcome::Queued) => queued += 1,
                Ok(QueueOutcome::AlreadyQueued) => {}
                Err(e) => {
                    error!(event_type = "cycle_error", run_id = %run.run_id, error = %e);
                    store_error = Some(e);
                }
            }
        }
        info!(
            event_type = "scan_complete",
            candidates = candidates.len(),
            queued,
        );
        match store_error {
            Some(e) => Err(e.into()),
            None => Ok((candidates.len(), queued)),
        }
    }

    /// Admit queued runs while slots are free. Runs without a slot stay Queued.
    fn dispatch(&mut self) -> Vec<String> {
        let mut dispatched = Vec::new();
        if self.terminate.is_cancelled() {
            return dispatched;
        }
        for run in self.ctx.store.queued() {
            if self.active.contains(&run.run_id) {
                continue;
            }
            let Some(slot) = self.ctx.slots.try_acquire() else {
                debug!(
                    event_type = "dispatch_deferred",
                    run_id = %run.run_id,
                    capacity = self.ctx.slots.capacity(),
                    running = self.ctx.store.running_count(),
                );
                break;
            };
            let run_id = run.run_id.clone();
            let ctx = self.ctx.clone();
            let terminate = self.terminate.clone();
            self.active.insert(run_id.clone());
            dispatched.push(run_id.clone());
            self.in_flight.spawn(async move {
                let finished = AssertUnwindSafe(execute_run(ctx, run, slot, terminate))
                    .catch_unwind()
                    .await
                    .is_ok();
                (run_id, finished)
            });
        }
        dispatched
    }

    /// Release the slots of orphaned runs whose pipeline has exited since the last check.
    fn settle_orphans(&mut self) {
        for (run_id, slot) in std::mem::take(&mut self.orphans) {
            match self.ctx.store.settle_orphan(&run_id) {
                Ok(None) => self.orphans.push((run_id, slot)),
                Ok(Some(state)) => {
                    info!(
                        event_type = "orphan_settled",
                        run_id = %run_id,
                        status = %state.status,
                        attempt = state.attempt,
                    );
                    if let Some(slot) = slot {
                        self.ctx.slots.release(slot);
                    }
                }
                Err(e) => {
                    warn!(event_type = "state_store_error", run_id = %run_id, error = %e);
                    self.orphans.push((run_id, slot));
                }
            }
        }
    }

    fn reap(&mut self, joined: Result<RunTaskResult, JoinError>) {
        match joined {
            Ok((run_id, true)) => {
                self.active.remove(&run_id);
            }
            Ok((run_id, false)) => {
                self.active.remove(&run_id);
                error!(
                    event_type = "run_task_panicked",
                    run_id = %run_id,
                );
                // Whatever the task managed to record, the run must not stay open.
                if let Err(e) = self.ctx.store.mark_terminal(&run_id, RunOutcome::Failed) {
                    debug!(event_type = "run_task_panicked", run_id = %run_id, error = %e);
                }
            }
            Err(e) => error!(event_type = "run_task_panicked", error = %e),
        }
    }

    /// Mail goes out when an error first appears or changes, not on every failing interval.
    fn record_cycle_error(&mut self, e: &CycleError) {
        error!(event_type = "cycle_error", error = %e, exit_code = e.exit_code());
        self.last_exit_code = Some(e.exit_code());
        let message = e.to_string();
        if self.last_cycle_error.as_deref() == Some(message.as_str()) {
            return;
        }
        self.last_cycle_error = Some(message.clone());
        self.ctx
            .notifier
            .publish(NotificationEvent::CycleError { message });
    }

    /// Wait until every dispatched run has reached a terminal state, admitting queued runs as
    /// slots free up, and until their notifications are delivered or timed out.
    pub async fn wait_for_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.reap(joined);
            self.dispatch();
        }
        self.ctx.notifier.flush().await;
    }

    /// Single pass for `--once`: one cycle, then run everything it queued to completion.
    pub async fn run_once(mut self) -> u8 {
        self.cycle().await;
        self.wait_for_in_flight().await;
        info!(event_type = "shutdown_complete", exit_code = self.exit_code());
        self.exit_code()
    }

    /// Run until `shutdown` fires. `force` escalates a draining shutdown to terminating the
    /// running pipelines. Returns the process exit code.
    pub async fn run(mut self, shutdown: CancellationToken, force: CancellationToken) -> u8 {
        info!(
            event_type = "orchestrator_start",
            fastq_by_run_dir = %self.watched_root.display(),
            capacity = self.ctx.slots.capacity(),
            scan_interval = %humantime::format_duration(self.scan_interval),
        );

        'cycles: loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.cycle().await;

            let sleep = tokio::time::sleep(self.scan_interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'cycles,
                    _ = &mut sleep => break,
                    joined = next_finished(&mut self.in_flight) => {
                        self.reap(joined);
                        self.dispatch();
                    }
                }
            }
        }

        self.shutdown(force).await
    }

    async fn shutdown(mut self, force: CancellationToken) -> u8 {
        info!(
            event_type = "shutdown_requested",
            policy = ?self.shutdown_policy,
            in_flight = self.in_flight.len(),
        );
        if self.shutdown_policy == ShutdownPolicy::Terminate {
            self.terminate.cancel();
        }

        loop {
            tokio::select! {
                joined = self.in_flight.join_next() => match joined {
                    Some(joined) => self.reap(joined),
                    None => break,
                },
                _ = force.cancelled(), if !self.terminate.is_cancelled() => {
                    warn!(event_type = "shutdown_requested", policy = "terminate", in_flight = self.in_flight.len());
                    self.terminate.cancel();
                }
            }
        }
        self.ctx.notifier.flush().await;

        info!(event_type = "shutdown_complete", exit_code = self.exit_code());
        self.exit_code()
    }
}

/// `join_next` that never resolves on an empty set, so it can sit in a `select!`.
async fn next_finished(set: &mut JoinSet<RunTaskResult>) -> Result<RunTaskResult, JoinError> {
    match set.join_next().await {
        Some(joined) => joined,
        None => futures::future::pending().await,
    }
}

/// Execute every configured pipeline for one admitted run, in order, inside one slot.
///
/// The run is marked Running before the first process exists, so a crash at any later point
/// is seen as an interrupted run on restart rather than an unlaunched queued one.
#[tracing::instrument(skip_all, fields(run_id = %run.run_id))]
async fn execute_run(ctx: RunContext, run: Run, slot: Slot, terminate: CancellationToken) {
    let store = &ctx.store;
    let mut failure: Option<RunFailure> = None;
    let mut started = false;

    for spec in ctx.pipelines.iter() {
        if terminate.is_cancelled() {
            failure = Some(RunFailure::Terminated);
            break;
        }

        let prepared = match ctx.launcher.prepare(&run, spec) {
            Ok(prepared) => prepared,
            Err(e) => {
                failure = Some(RunFailure::launch(spec, &e));
                break;
            }
        };
        let mut record = prepared.record.clone();
        let persisted = if started {
            store.record_execution(&run.run_id, record.clone())
        } else {
            store.mark_running(&run.run_id, record.clone())
        };
        if let Err(e) = persisted {
            failure = Some(RunFailure::Store(e.to_string()));
            break;
        }

        let handle = match ctx.launcher.spawn(prepared, &slot) {
            Ok(handle) => {
                // Restart recovery needs the pid to tell a live pipeline from a dead one.
                if let Err(e) = store.record_execution(&run.run_id, handle.record.clone()) {
                    warn!(event_type = "state_store_error", run_id = %run.run_id, error = %e);
                }
                handle
            }
            Err(e) => {
                error!(
                    event_type = "pipeline_failed",
                    run_id = %run.run_id,
                    pipeline_name = %spec.pipeline_name,
                    pipeline_version = %spec.pipeline_version,
                    error = %e,
                );
                record.finish(
                    OffsetDateTime::now_utc(),
                    ExecutionOutcome::Failure,
                    None,
                    vec![e.to_string()],
                );
                if let Err(e) = store.record_execution(&run.run_id, record) {
                    warn!(event_type = "state_store_error", run_id = %run.run_id, error = %e);
                }
                failure = Some(RunFailure::launch(spec, &e));
                break;
            }
        };

        if !started {
            started = true;
            if let Some(state) = store.get(&run.run_id) {
                ctx.notifier.publish(NotificationEvent::RunStarted { state });
            }
        }

        let control = handle.controller();
        let exited = handle.wait();
        tokio::pin!(exited);
        let finished = tokio::select! {
            record = &mut exited => record,
            _ = terminate.cancelled() => {
                let _ = control.send(ExecutionControl::Terminate);
                let record = exited.await;
                failure = Some(RunFailure::Terminated);
                record
            }
        };

        let succeeded = finished.outcome == Some(ExecutionOutcome::Success);
        let exit_code = finished.exit_code;
        if let Err(e) = store.record_execution(&run.run_id, finished) {
            warn!(event_type = "state_store_error", run_id = %run.run_id, error = %e);
        }
        if failure.is_some() {
            break;
        }
        if !succeeded {
            failure = Some(RunFailure::Pipeline {
                pipeline: spec.label(),
                exit_code,
            });
            break;
        }
    }

    process_run_completion(&ctx, &run.run_id, failure);
    // The slot is held until the outcome is durable.
    ctx.slots.release(slot);
}
