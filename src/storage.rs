//! Durable run state under the analysis output root.
//!
//! Layout per run:
//!
//! ```text
//! <analysis_output_dir>/<run_id>/.orchestrator/claim.json      admission marker (attempt 1)
//! <analysis_output_dir>/<run_id>/.orchestrator/claim-<n>.json  admission marker (retry attempt n)
//! <analysis_output_dir>/<run_id>/.orchestrator/state.json      current RunState
//! ```
//!
//! Claim files are created with `create_new`, so the filesystem decides the single winner
//! when two cycles or two processes race for the same run. The state file is replaced by
//! write-then-rename and is what restart recovery reads.
//!
//! Recovery rewrites state, so only the holder of `<analysis_output_dir>/.orchestrator.lock`
//! ([`RootLock`]) may open the store for writing. Status listings use
//! [`StateStore::open_read_only`].

use crate::engine::process::{process_alive, process_group_alive};
use crate::error::StoreError;
use crate::model::{ExecutionOutcome, ExecutionRecord, Run, RunOutcome, RunState, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const MARKER_DIR: &str = ".orchestrator";
const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = ".orchestrator.lock";

/// Exclusive ownership of an output root by one orchestrator process. Removed on drop.
#[derive(Debug)]
pub struct RootLock {
    path: PathBuf,
}

impl RootLock {
    /// Take the lock, replacing it when the recorded holder is no longer running.
    pub fn acquire(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
        let path = root.join(LOCK_FILE);
        let mut holder = None;
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .and_then(|_| file.sync_all())
                        .map_err(|e| StoreError::io(&path, e))?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if !process_alive(pid) => {
                            warn!(event_type = "stale_lock_removed", path = %path.display(), pid);
                            match std::fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(StoreError::io(&path, e)),
                            }
                        }
                        // A live holder, or one that has not written its pid yet.
                        _ => break,
                    }
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Err(StoreError::Locked {
            holder: holder.map_or_else(|| "pid unknown".to_string(), |pid| format!("pid {pid}")),
            path,
        })
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Someone else holds the claim; the caller must not launch.
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPolicy {
    /// Re-open runs found Running at startup as a fresh attempt instead of leaving them Failed.
    pub retry_interrupted: bool,
    pub allow_manual_retry: bool,
}

/// What `StateStore::open` found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub interrupted: Vec<String>,
    pub requeued: Vec<String>,
    /// Running runs whose pipeline process group outlived the previous orchestrator. They stay
    /// Running until [`StateStore::settle_orphan`] sees the group gone.
    pub orphaned: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClaimRecord {
    run: Run,
    attempt: u32,
    pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    claimed_at: OffsetDateTime,
}

pub struct StateStore {
    root: PathBuf,
    policy: RecoveryPolicy,
    read_only: bool,
    // One lock for the index and the files behind it keeps every run's transitions totally ordered.
    runs: Mutex<HashMap<String, RunState>>,
}

impl StateStore {
    /// Open the store and reconstruct status from persisted markers.
    pub fn open(
        root: impl AsRef<Path>,
        policy: RecoveryPolicy,
    ) -> Result<(Self, RecoveryReport), StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        let store = Self {
            root,
            policy,
            read_only: false,
            runs: Mutex::new(HashMap::new()),
        };
        let report = store.recover()?;
        Ok((store, report))
    }

    /// Load persisted state as-is: no recovery, and every mutation fails with `ReadOnly`.
    /// Safe to use while an orchestrator owns the root.
    pub fn open_read_only(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            root: root.as_ref().to_path_buf(),
            policy: RecoveryPolicy::default(),
            read_only: true,
            runs: Mutex::new(HashMap::new()),
        };
        if store.root.is_dir() {
            let loaded = store.load_all()?;
            *store.lock() = loaded;
        }
        Ok(store)
    }

    fn writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn marker_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id).join(MARKER_DIR)
    }

    fn claim_path(&self, run_id: &str, attempt: u32) -> PathBuf {
        let name = if attempt <= 1 {
            "claim.json".to_string()
        } else {
            format!("claim-{attempt}.json")
        };
        self.marker_dir(run_id).join(name)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.marker_dir(run_id).join(STATE_FILE)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunState>> {
        // A panic while holding the lock cannot leave a half-written file behind (writes are
        // rename-based), so the index is still usable.
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_all(&self) -> Result<HashMap<String, RunState>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut runs = HashMap::new();
        for entry in entries.flatten() {
            let run_id = entry.file_name().to_string_lossy().to_string();
            let marker_dir = self.marker_dir(&run_id);
            if !marker_dir.is_dir() {
                continue;
            }
            let state = match self.load_state(&run_id) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    // The claim still exists on disk, so the run stays ineligible.
                    warn!(event_type = "state_unreadable", run_id = %run_id, error = %e);
                    continue;
                }
            };
            runs.insert(run_id, state);
        }
        Ok(runs)
    }

    fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let loaded = self.load_all()?;
        let mut runs = self.lock();
        *runs = loaded;
        let mut report = RecoveryReport {
            loaded: runs.len(),
            ..RecoveryReport::default()
        };

        let stranded: Vec<String> = runs
            .values()
            .filter(|s| s.status == RunStatus::Running)
            .map(|s| s.run.run_id.clone())
            .collect();
        for run_id in stranded {
            let Some(state) = runs.get_mut(&run_id) else {
                continue;
            };
            if has_live_pipeline(state) {
                warn!(
                    event_type = "run_orphaned",
                    run_id = %run_id,
                    attempt = state.attempt,
                    "pipeline from the previous orchestrator is still running"
                );
                report.orphaned.push(run_id);
                continue;
            }
            report.interrupted.push(run_id.clone());
            if self.interrupt(state)? {
                report.requeued.push(run_id);
            }
        }
        report.interrupted.sort();
        report.requeued.sort();
        report.orphaned.sort();
        Ok(report)
    }

    /// Close a Running run whose process is gone as Failed + interrupted, then re-open it when
    /// the policy says so. Returns whether it was re-queued.
    fn interrupt(&self, state: &mut RunState) -> Result<bool, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut next = state.clone();
        for record in next.executions.iter_mut() {
            record.finish(now, ExecutionOutcome::Unknown, None, Vec::new());
        }
        next.status = RunStatus::Failed;
        next.interrupted = true;
        next.updated_at = now;
        self.persist(&next)?;
        *state = next;
        warn!(
            event_type = "run_interrupted",
            run_id = %state.run.run_id,
            attempt = state.attempt,
            "run was running when the orchestrator stopped"
        );
        Ok(self.policy.retry_interrupted && self.reopen(state)? == QueueOutcome::Queued)
    }

    /// Check on an orphaned run. `None` while its process group is alive; otherwise the run is
    /// closed like any interrupted run and its new state returned.
    pub fn settle_orphan(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        self.writable()?;
        let mut runs = self.lock();
        let state = runs.get_mut(run_id).ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        if state.status != RunStatus::Running {
            return Ok(Some(state.clone()));
        }
        if has_live_pipeline(state) {
            return Ok(None);
        }
        self.interrupt(state)?;
        Ok(Some(state.clone()))
    }

    fn load_state(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        let state_path = self.state_path(run_id);
        match std::fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    path: state_path,
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Claimed but the state file never landed: the run is still Queued.
                let claim_path = self.claim_path(run_id, 1);
                let bytes = match std::fs::read(&claim_path) {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(StoreError::io(claim_path, e)),
                };
                let claim: ClaimRecord =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: claim_path,
                        source,
                    })?;
                Ok(Some(RunState {
                    run: claim.run,
                    status: RunStatus::Queued,
                    attempt: claim.attempt,
                    interrupted: false,
                    executions: Vec::new(),
                    superseded: Vec::new(),
                    updated_at: claim.claimed_at,
                }))
            }
            Err(e) => Err(StoreError::io(state_path, e)),
        }
    }

    fn persist(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.state_path(&state.run.run_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Create the claim marker for `attempt`. Exactly one caller per (run, attempt) gets `Queued`.
    fn claim(&self, run: &Run, attempt: u32) -> Result<QueueOutcome, StoreError> {
        let dir = self.marker_dir(&run.run_id);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = self.claim_path(&run.run_id, attempt);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(QueueOutcome::AlreadyQueued)
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let claim = ClaimRecord {
            run: run.clone(),
            attempt,
            pid: std::process::id(),
            claimed_at: OffsetDateTime::now_utc(),
        };
        let bytes = serde_json::to_vec_pretty(&claim).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(QueueOutcome::Queued)
    }

    /// A run is eligible when neither this process nor any claim on disk knows about it.
    pub fn is_eligible(&self, run_id: &str) -> bool {
        if self.lock().contains_key(run_id) {
            return false;
        }
        !self.claim_path(run_id, 1).exists()
    }

    /// The admission gate.
    pub fn mark_queued(&self, run: &Run) -> Result<QueueOutcome, StoreError> {
        self.writable()?;
        let mut runs = self.lock();
        if runs.contains_key(&run.run_id) {
            return Ok(QueueOutcome::AlreadyQueued);
        }
        if self.claim(run, 1)? == QueueOutcome::AlreadyQueued {
            debug!(event_type = "admission_conflict", run_id = %run.run_id);
            return Ok(QueueOutcome::AlreadyQueued);
        }
        let state = RunState {
            run: run.clone(),
            status: RunStatus::Queued,
            attempt: 1,
            interrupted: false,
            executions: Vec::new(),
            superseded: Vec::new(),
            updated_at: OffsetDateTime::now_utc(),
        };
        self.persist(&state)?;
        runs.insert(run.run_id.clone(), state);
        info!(event_type = "run_queued", run_id = %run.run_id, attempt = 1);
        Ok(QueueOutcome::Queued)
    }

    pub fn mark_running(&self, run_id: &str, record: ExecutionRecord) -> Result<(), StoreError> {
        self.writable()?;
        let mut runs = self.lock();
        let state = runs.get_mut(run_id).ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        if !state.status.can_advance_to(RunStatus::Running) {
            return Err(StoreError::InvalidTransition {
                run_id: run_id.to_string(),
                from: state.status.as_str(),
                to: RunStatus::Running.as_str(),
            });
        }
        let mut next = state.clone();
        next.status = RunStatus::Running;
        next.executions.push(record);
        next.updated_at = OffsetDateTime::now_utc();
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Add or update an execution record of a Running run (later pipelines of the same run,
    /// or the exit of the current one).
    pub fn record_execution(
        &self,
        run_id: &str,
        record: ExecutionRecord,
    ) -> Result<(), StoreError> {
        self.writable()?;
        let mut runs = self.lock();
        let state = runs.get_mut(run_id).ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        if state.status != RunStatus::Running {
            return Err(StoreError::InvalidTransition {
                run_id: run_id.to_string(),
                from: state.status.as_str(),
                to: RunStatus::Running.as_str(),
            });
        }
        let mut next = state.clone();
        let open = next.executions.iter_mut().find(|r| {
            !r.is_finished()
                && r.pipeline_name == record.pipeline_name
                && r.pipeline_version == record.pipeline_version
                && r.started_at == record.started_at
        });
        match open {
            Some(existing) => *existing = record,
            None => next.executions.push(record),
        }
        next.updated_at = OffsetDateTime::now_utc();
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// The only writer of Completed/Failed.
    pub fn mark_terminal(&self, run_id: &str, outcome: RunOutcome) -> Result<RunState, StoreError> {
        self.writable()?;
        let mut runs = self.lock();
        let state = runs.get_mut(run_id).ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        let target = outcome.status();
        if !state.status.can_advance_to(target) {
            return Err(StoreError::InvalidTransition {
                run_id: run_id.to_string(),
                from: state.status.as_str(),
                to: target.as_str(),
            });
        }
        let now = OffsetDateTime::now_utc();
        let mut next = state.clone();
        for record in next.executions.iter_mut() {
            record.finish(now, ExecutionOutcome::Unknown, None, Vec::new());
        }
        next.status = target;
        next.interrupted = outcome == RunOutcome::Interrupted;
        next.updated_at = now;
        self.persist(&next)?;
        *state = next.clone();
        Ok(next)
    }

    /// Manual retry: re-open a Failed run as a new attempt with its own claim.
    pub fn retry(&self, run_id: &str) -> Result<QueueOutcome, StoreError> {
        self.writable()?;
        if !self.policy.allow_manual_retry {
            return Err(StoreError::RetryDisabled);
        }
        let mut runs = self.lock();
        let state = runs.get_mut(run_id).ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        self.reopen(state)
    }

    fn reopen(&self, state: &mut RunState) -> Result<QueueOutcome, StoreError> {
        if state.status != RunStatus::Failed {
            return Err(StoreError::InvalidTransition {
                run_id: state.run.run_id.clone(),
                from: state.status.as_str(),
                to: RunStatus::Queued.as_str(),
            });
        }
        let attempt = state.attempt + 1;
        if self.claim(&state.run, attempt)? == QueueOutcome::AlreadyQueued {
            debug!(event_type = "admission_conflict", run_id = %state.run.run_id, attempt);
            return Ok(QueueOutcome::AlreadyQueued);
        }
        let mut next = state.clone();
        let previous = std::mem::take(&mut next.executions);
        next.superseded.extend(previous);
        next.status = RunStatus::Queued;
        next.attempt = attempt;
        next.interrupted = false;
        next.updated_at = OffsetDateTime::now_utc();
        self.persist(&next)?;
        *state = next;
        info!(event_type = "run_queued", run_id = %state.run.run_id, attempt);
        Ok(QueueOutcome::Queued)
    }

    pub fn get(&self, run_id: &str) -> Option<RunState> {
        self.lock().get(run_id).cloned()
    }

    /// Every known run's state, ordered by run id.
    pub fn snapshot(&self) -> Vec<RunState> {
        let mut states: Vec<RunState> = self.lock().values().cloned().collect();
        states.sort_by(|a, b| a.run.run_id.cmp(&b.run.run_id));
        states
    }

    /// Queued runs, oldest discovery first, so every queued run is eventually admitted.
    pub fn queued(&self) -> Vec<Run> {
        let mut queued: Vec<(OffsetDateTime, Run)> = self
            .lock()
            .values()
            .filter(|s| s.status == RunStatus::Queued)
            .map(|s| (s.updated_at, s.run.clone()))
            .collect();
        queued.sort_by(|a, b| {
            a.1.discovered_at
                .cmp(&b.1.discovered_at)
                .then(a.0.cmp(&b.0))
                .then(a.1.run_id.cmp(&b.1.run_id))
        });
        queued.into_iter().map(|(_, run)| run).collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| s.status == RunStatus::Running)
            .count()
    }
}

/// Whether an open execution of this run still has a process group. Records without a pid
/// predate the spawn and count as dead.
fn has_live_pipeline(state: &RunState) -> bool {
    state
        .executions
        .iter()
        .filter(|r| !r.is_finished())
        .filter_map(|r| r.pid)
        .any(process_group_alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentType;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn run(id: &str) -> Run {
        Run {
            run_id: id.to_string(),
            run_dir: PathBuf::from(format!("/fastq/{id}")),
            instrument_type: InstrumentType::Unknown,
            discovered_at: OffsetDateTime::now_utc(),
        }
    }

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            run_id: id.to_string(),
            pipeline_name: "org/qc".into(),
            pipeline_version: "1.0.0".into(),
            parameters: IndexMap::new(),
            command: vec!["nextflow".into()],
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            outcome: None,
            exit_code: None,
            diagnostic_tail: Vec::new(),
            work_dir: PathBuf::from("/work"),
            output_dir: PathBuf::from("/out"),
            pid: None,
        }
    }

    fn open(root: &Path, policy: RecoveryPolicy) -> StateStore {
        StateStore::open(root, policy).unwrap().0
    }

    #[test]
    fn queue_run_terminal_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        assert!(store.is_eligible("R1"));
        assert_eq!(store.mark_queued(&run("R1")).unwrap(), QueueOutcome::Queued);
        assert!(!store.is_eligible("R1"));
        store.mark_running("R1", record("R1")).unwrap();
        assert_eq!(store.running_count(), 1);
        let state = store.mark_terminal("R1", RunOutcome::Completed).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.executions[0].finished_at.is_some());
        let known: Vec<_> = store
            .snapshot()
            .into_iter()
            .map(|s| (s.run.run_id, s.status))
            .collect();
        assert_eq!(known, vec![("R1".to_string(), RunStatus::Completed)]);
    }

    #[test]
    fn second_queue_attempt_is_already_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        assert_eq!(store.mark_queued(&run("R1")).unwrap(), QueueOutcome::Queued);
        assert_eq!(
            store.mark_queued(&run("R1")).unwrap(),
            QueueOutcome::AlreadyQueued
        );
    }

    #[test]
    fn concurrent_claims_across_store_instances_admit_once() {
        let tmp = tempfile::tempdir().unwrap();
        let a = Arc::new(open(tmp.path(), RecoveryPolicy::default()));
        let b = Arc::new(open(tmp.path(), RecoveryPolicy::default()));
        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = if i % 2 == 0 { a.clone() } else { b.clone() };
                    scope.spawn(move || store.mark_queued(&run("R1")).unwrap())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| *o == QueueOutcome::Queued)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn running_requires_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        assert!(matches!(
            store.mark_running("R1", record("R1")),
            Err(StoreError::UnknownRun { .. })
        ));
        store.mark_queued(&run("R1")).unwrap();
        store.mark_running("R1", record("R1")).unwrap();
        assert!(matches!(
            store.mark_running("R1", record("R1")),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_is_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        store.mark_queued(&run("R1")).unwrap();
        store.mark_running("R1", record("R1")).unwrap();
        store.mark_terminal("R1", RunOutcome::Failed).unwrap();
        assert!(store.mark_terminal("R1", RunOutcome::Completed).is_err());
        assert_eq!(store.get("R1").unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn launch_failure_may_fail_a_queued_run() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        store.mark_queued(&run("R1")).unwrap();
        assert!(store.mark_terminal("R1", RunOutcome::Completed).is_err());
        store.mark_terminal("R1", RunOutcome::Failed).unwrap();
    }

    #[test]
    fn restart_marks_running_runs_interrupted() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path(), RecoveryPolicy::default());
            store.mark_queued(&run("R1")).unwrap();
            store.mark_running("R1", record("R1")).unwrap();
            store.mark_queued(&run("R2")).unwrap();
            store.mark_queued(&run("R3")).unwrap();
            store.mark_running("R3", record("R3")).unwrap();
            store.mark_terminal("R3", RunOutcome::Completed).unwrap();
        }
        let (store, report) = StateStore::open(tmp.path(), RecoveryPolicy::default()).unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.interrupted, vec!["R1".to_string()]);
        assert!(report.requeued.is_empty());

        let r1 = store.get("R1").unwrap();
        assert_eq!(r1.status, RunStatus::Failed);
        assert!(r1.interrupted);
        assert_eq!(r1.executions[0].outcome, Some(ExecutionOutcome::Unknown));
        assert_eq!(store.get("R2").unwrap().status, RunStatus::Queued);
        assert_eq!(store.get("R3").unwrap().status, RunStatus::Completed);
        assert!(!store.is_eligible("R3"));
        assert_eq!(store.queued().len(), 1);
    }

    #[test]
    fn restart_can_requeue_interrupted_runs() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path(), RecoveryPolicy::default());
            store.mark_queued(&run("R1")).unwrap();
            store.mark_running("R1", record("R1")).unwrap();
        }
        let policy = RecoveryPolicy {
            retry_interrupted: true,
            allow_manual_retry: false,
        };
        let (store, report) = StateStore::open(tmp.path(), policy).unwrap();
        assert_eq!(report.requeued, vec!["R1".to_string()]);
        let r1 = store.get("R1").unwrap();
        assert_eq!(r1.status, RunStatus::Queued);
        assert_eq!(r1.attempt, 2);
        assert!(r1.executions.is_empty());
        assert_eq!(r1.superseded.len(), 1);
        assert!(tmp.path().join("R1/.orchestrator/claim-2.json").exists());
    }

    #[test]
    fn claim_without_state_recovers_as_queued() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path(), RecoveryPolicy::default());
            store.mark_queued(&run("R1")).unwrap();
        }
        std::fs::remove_file(tmp.path().join("R1/.orchestrator/state.json")).unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        assert_eq!(store.get("R1").unwrap().status, RunStatus::Queued);
    }

    #[test]
    fn manual_retry_is_gated_by_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        store.mark_queued(&run("R1")).unwrap();
        store.mark_terminal("R1", RunOutcome::Failed).unwrap();
        assert!(matches!(store.retry("R1"), Err(StoreError::RetryDisabled)));

        let store = open(
            tmp.path(),
            RecoveryPolicy {
                retry_interrupted: false,
                allow_manual_retry: true,
            },
        );
        assert_eq!(store.retry("R1").unwrap(), QueueOutcome::Queued);
        assert_eq!(store.get("R1").unwrap().attempt, 2);
        // A completed or queued run cannot be retried.
        assert!(store.retry("R1").is_err());
    }

    #[test]
    fn read_only_open_does_not_recover_a_live_daemons_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = open(
            tmp.path(),
            RecoveryPolicy {
                retry_interrupted: true,
                allow_manual_retry: true,
            },
        );
        daemon.mark_queued(&run("R1")).unwrap();
        daemon.mark_running("R1", record("R1")).unwrap();

        let status = StateStore::open_read_only(tmp.path()).unwrap();
        assert_eq!(status.get("R1").unwrap().status, RunStatus::Running);
        assert!(matches!(
            status.mark_queued(&run("R2")),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(status.retry("R1"), Err(StoreError::ReadOnly)));
        assert!(!tmp.path().join("R1/.orchestrator/claim-2.json").exists());
        assert!(!tmp.path().join("R2").exists());

        // The daemon's view and the file on disk are untouched.
        daemon.mark_terminal("R1", RunOutcome::Completed).unwrap();
        let again = StateStore::open_read_only(tmp.path()).unwrap();
        assert_eq!(again.get("R1").unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn read_only_open_of_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open_read_only(tmp.path().join("absent")).unwrap();
        assert!(store.snapshot().is_empty());
        assert!(!tmp.path().join("absent").exists());
    }

    #[test]
    fn root_lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RootLock::acquire(tmp.path()).unwrap();
        assert!(matches!(
            RootLock::acquire(tmp.path()),
            Err(StoreError::Locked { .. })
        ));
        drop(lock);
        assert!(!tmp.path().join(LOCK_FILE).exists());
        let _again = RootLock::acquire(tmp.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stale_root_lock_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();
        std::fs::write(tmp.path().join(LOCK_FILE), pid.to_string()).unwrap();

        let _lock = RootLock::acquire(tmp.path()).unwrap();
        let holder = std::fs::read_to_string(tmp.path().join(LOCK_FILE)).unwrap();
        assert_eq!(holder, std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn live_pipeline_group_keeps_the_run_running_until_it_exits() {
        use std::os::unix::process::CommandExt;

        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        {
            let store = open(tmp.path(), RecoveryPolicy::default());
            store.mark_queued(&run("R1")).unwrap();
            let mut rec = record("R1");
            rec.pid = Some(pipeline.id());
            store.mark_running("R1", rec).unwrap();
        }

        let policy = RecoveryPolicy {
            retry_interrupted: true,
            allow_manual_retry: false,
        };
        let (store, report) = StateStore::open(tmp.path(), policy).unwrap();
        assert_eq!(report.orphaned, vec!["R1".to_string()]);
        assert!(report.interrupted.is_empty() && report.requeued.is_empty());
        assert_eq!(store.get("R1").unwrap().status, RunStatus::Running);
        assert!(!tmp.path().join("R1/.orchestrator/claim-2.json").exists());
        assert!(store.settle_orphan("R1").unwrap().is_none());

        crate::engine::process::kill_process_group(pipeline.id()).unwrap();
        pipeline.wait().unwrap();

        let settled = store.settle_orphan("R1").unwrap().unwrap();
        assert_eq!(settled.status, RunStatus::Queued);
        assert_eq!(settled.attempt, 2);
        assert_eq!(
            settled.superseded[0].outcome,
            Some(ExecutionOutcome::Unknown)
        );
    }

    #[test]
    fn queued_is_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path(), RecoveryPolicy::default());
        let mut older = run("B");
        older.discovered_at -= time::Duration::minutes(5);
        store.mark_queued(&run("A")).unwrap();
        store.mark_queued(&older).unwrap();
        let ids: Vec<String> = store.queued().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["B".to_string(), "A".to_string()]);
    }
}
