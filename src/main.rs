mod cli;
mod config;
mod engine;
mod error;
mod logging;
mod model;
mod notify;
mod orchestrator;
mod scanner;
mod storage;
mod text_summary;

use clap::Parser;
use std::process::ExitCode;

/// Exit code for an unusable configuration.
const EXIT_CONFIG: u8 = 2;
const EXIT_FATAL: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();
    if let Err(e) = logging::init(args.log_level.as_str()) {
        eprintln!("{e:#}");
    }

    match cli::run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = if e.downcast_ref::<error::ConfigError>().is_some() {
                EXIT_CONFIG
            } else {
                EXIT_FATAL
            };
            tracing::error!(event_type = "fatal_error", error = %format!("{e:#}"), exit_code = code);
            eprintln!("{e:#}");
            ExitCode::from(code)
        }
    }
}
