//! Run directory discovery.
//!
//! The scanner only answers "does the filesystem say this run is ready". Whether a run was
//! already claimed is the state store's question; the scanner never writes anything.

use crate::config::{OrchestratorConfig, GRIDION_RUN_ID_PATTERN, PROMETHION_RUN_ID_PATTERN};
use crate::error::ScanError;
use crate::model::{InstrumentType, Run};
use regex::Regex;
use std::collections::HashSet;
use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::debug;

static GRIDION_RUN_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(GRIDION_RUN_ID_PATTERN).ok());
static PROMETHION_RUN_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(PROMETHION_RUN_ID_PATTERN).ok());

/// The "analysis-ready" predicate applied to every subdirectory of the watched root.
#[derive(Debug, Clone)]
pub struct ReadinessRules {
    pub patterns: Vec<Regex>,
    pub excluded: HashSet<String>,
    pub completion_sentinel: Option<String>,
    pub min_age: Option<Duration>,
}

impl ReadinessRules {
    pub fn from_config(cfg: &OrchestratorConfig) -> Result<Self, regex::Error> {
        let patterns = cfg
            .run_id_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            excluded: cfg.excluded_runs.iter().cloned().collect(),
            completion_sentinel: cfg.completion_sentinel.clone(),
            min_age: cfg.min_run_age,
        })
    }
}

/// Classify a run id by the instrument naming convention it follows.
pub fn instrument_type(run_id: &str) -> InstrumentType {
    let matches = |re: &Option<Regex>| re.as_ref().is_some_and(|re| re.is_match(run_id));
    if matches(&GRIDION_RUN_ID) {
        InstrumentType::Gridion
    } else if matches(&PROMETHION_RUN_ID) {
        InstrumentType::Promethion
    } else {
        InstrumentType::Unknown
    }
}

/// Lazy iterator over analysis-ready runs.
pub struct RunCandidates {
    entries: ReadDir,
    rules: ReadinessRules,
}

/// List the watched root. Fails only when the root itself cannot be read.
pub fn scan(root: &Path, rules: ReadinessRules) -> Result<RunCandidates, ScanError> {
    debug!(event_type = "scan_start", fastq_by_run_dir = %root.display());
    let entries = std::fs::read_dir(root).map_err(|source| ScanError::UnreadableRoot {
        path: root.to_path_buf(),
        source,
    })?;
    Ok(RunCandidates { entries, rules })
}

impl Iterator for RunCandidates {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(event_type = "directory_skipped", error = %e, "unreadable directory entry");
                    continue;
                }
            };
            if let Some(run) = check_candidate(&entry.path(), &self.rules) {
                return Some(run);
            }
        }
        None
    }
}

fn is_old_enough(path: &Path, min_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= min_age)
}

fn check_candidate(path: &Path, rules: &ReadinessRules) -> Option<Run> {
    let run_id = path.file_name()?.to_string_lossy().to_string();
    let run_dir: PathBuf = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    let is_directory = path.is_dir();
    let matches_run_id_format =
        rules.patterns.is_empty() || rules.patterns.iter().any(|re| re.is_match(&run_id));
    let not_excluded = !rules.excluded.contains(&run_id);
    let sentinel_present = rules
        .completion_sentinel
        .as_ref()
        .map(|name| path.join(name).is_file());
    let old_enough = rules.min_age.map(|age| is_old_enough(path, age));

    let ready = is_directory
        && matches_run_id_format
        && not_excluded
        && sentinel_present.unwrap_or(true)
        && old_enough.unwrap_or(true);

    if !ready {
        debug!(
            event_type = "directory_skipped",
            run_directory_path = %run_dir.display(),
            is_directory,
            matches_run_id_format,
            not_excluded,
            sentinel_present = ?sentinel_present,
            old_enough = ?old_enough,
        );
        return None;
    }

    // Ready says nothing about whether the run was already claimed; the loop logs discovery.
    debug!(
        event_type = "run_ready",
        run_id = %run_id,
        run_directory_path = %run_dir.display(),
    );
    Some(Run {
        instrument_type: instrument_type(&run_id),
        run_id,
        run_dir,
        discovered_at: OffsetDateTime::now_utc(),
    })
}
