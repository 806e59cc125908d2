use crate::config::OrchestratorConfig;
use crate::engine::{LaunchSettings, PipelineLauncher};
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::storage::{QueueOutcome, RecoveryPolicy, RootLock, StateStore};
use crate::text_summary::build_status_summary;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "auto-routine-nanopore-qc",
    version,
    about = "Launch routine QC pipelines for completed nanopore sequencing runs"
)]
pub struct Cli {
    /// Orchestrator config (`.json`, otherwise parsed as YAML)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Log level for this crate's events (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Run one scan cycle, wait for the pipelines it launched, then exit
    #[arg(long)]
    pub once: bool,

    /// Print the state of every known run and exit
    #[arg(long, conflicts_with_all = ["once", "retry"])]
    pub status: bool,

    /// Re-queue a failed run as a new attempt (requires allow_manual_retry) and exit
    #[arg(long, value_name = "RUN_ID", conflicts_with = "once")]
    pub retry: Option<String>,
}

/// Wait for Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// First signal stops new launches; a second one escalates to terminating running pipelines.
fn spawn_signal_listener(shutdown: CancellationToken, force: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!(event_type = "signal_handler_failed", error = %e);
            return;
        }
        shutdown.cancel();
        if wait_for_signal().await.is_ok() {
            force.cancel();
        }
    });
}

/// Take ownership of the output root, then open the store with restart recovery.
fn open_store(cfg: &OrchestratorConfig) -> Result<(RootLock, StateStore)> {
    let lock = RootLock::acquire(&cfg.analysis_output_dir)?;
    let (store, report) = StateStore::open(
        &cfg.analysis_output_dir,
        RecoveryPolicy {
            retry_interrupted: cfg.retry_interrupted,
            allow_manual_retry: cfg.allow_manual_retry,
        },
    )
    .with_context(|| {
        format!(
            "failed to open run state under {}",
            cfg.analysis_output_dir.display()
        )
    })?;
    info!(
        event_type = "state_recovered",
        loaded = report.loaded,
        interrupted = ?report.interrupted,
        requeued = ?report.requeued,
        orphaned = ?report.orphaned,
    );
    Ok((lock, store))
}

/// Returns the process exit code. Config errors surface as `ConfigError` inside the `anyhow`
/// chain so `main` can map them to their own code.
pub async fn run(args: Cli) -> Result<u8> {
    let cfg = OrchestratorConfig::load(&args.config)?;
    info!(
        event_type = "config_loaded",
        config_path = %args.config.display(),
        pipelines = cfg.pipelines.len(),
        max_concurrent_analyses = cfg.max_concurrent_analyses,
    );

    if args.status {
        let store = StateStore::open_read_only(&cfg.analysis_output_dir).with_context(|| {
            format!(
                "failed to read run state under {}",
                cfg.analysis_output_dir.display()
            )
        })?;
        for line in build_status_summary(&store.snapshot()).lines {
            println!("{line}");
        }
        return Ok(0);
    }

    // Held until the process is done with the store.
    let (_lock, store) = open_store(&cfg)?;

    if let Some(run_id) = args.retry.as_deref() {
        match store
            .retry(run_id)
            .with_context(|| format!("cannot retry {run_id}"))?
        {
            QueueOutcome::Queued => {
                let attempt = store.get(run_id).map(|s| s.attempt).unwrap_or_default();
                println!("{run_id}: queued as attempt {attempt}");
            }
            QueueOutcome::AlreadyQueued => println!("{run_id}: already claimed by another attempt"),
        }
        return Ok(0);
    }

    let notifier = Notifier::from_config(&cfg);
    if !notifier.is_enabled() {
        info!(event_type = "notifications_disabled");
    }
    let orchestrator = Orchestrator::new(
        &cfg,
        Arc::new(store),
        PipelineLauncher::new(LaunchSettings::from_config(&cfg)),
        notifier,
    )
    .context("invalid run_id_patterns")?;

    if args.once {
        return Ok(orchestrator.run_once().await);
    }

    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    spawn_signal_listener(shutdown.clone(), force.clone());
    Ok(orchestrator.run(shutdown, force).await)
}
