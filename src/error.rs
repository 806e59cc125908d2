//! Error taxonomy shared across the scanner, state store, launcher and notifier.
//!
//! Per-run failures (`LaunchError`, a failed pipeline exit) are contained in that run's
//! execution record. Only `ConfigError` at startup terminates the process.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json parse error in {path}: {source}")]
    JsonParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("`{field}` is invalid: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read watched directory {path}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("run {run_id} is not known to the state store")]
    UnknownRun { run_id: String },

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("manual retry is disabled (set allow_manual_retry)")]
    RetryDisabled,

    #[error("{path} is held by a running orchestrator ({holder})")]
    Locked { path: PathBuf, holder: String },

    #[error("state store was opened read-only")]
    ReadOnly,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to prepare directory {path}: {source}")]
    PrepareDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("parameter `{parameter}` has no value for this run")]
    UnresolvedParameter { parameter: String },
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification command `{program}` could not be started: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed writing message to notification command: {0}")]
    Write(std::io::Error),

    #[error("notification command exited with {status}: {stderr}")]
    Rejected { status: String, stderr: String },

    #[error("notification was not delivered within {after}")]
    TimedOut { after: String },
}

/// Failure of one scan/dispatch cycle. Non-fatal: the loop logs it and tries again next interval.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scan task panicked: {0}")]
    Join(String),
}

impl CycleError {
    /// Process exit code reported when this was the last cycle error of a session.
    pub fn exit_code(&self) -> u8 {
        match self {
            CycleError::Scan(_) => 3,
            CycleError::Store(_) => 4,
            CycleError::Join(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_exit_codes_are_distinct_and_nonzero() {
        let scan = CycleError::from(ScanError::UnreadableRoot {
            path: PathBuf::from("/missing"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        let store = CycleError::from(StoreError::UnknownRun {
            run_id: "r".into(),
        });
        assert_eq!(scan.exit_code(), 3);
        assert_eq!(store.exit_code(), 4);
        assert!(scan.to_string().contains("/missing"));
    }
}
