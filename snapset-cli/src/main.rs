//! # snapset
//!
//! Coordinator command line. Takes, removes, restores, lists and validates
//! snapshot sets spanning SAN LUNs, clustered NAS filesystems and node-local
//! logical volumes.
//!
//! Exit codes:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | plan failed |
//! | 2 | invalid usage |
//! | 3 | plan timed out |
//! | 4 | plan stopped, or a deployment plan is running |
//! | 5 | no such snapshot set |
//! | 6 | databases not in a state that allows a snapshot |
//! | 7 | storage vendor error |
//!
//! SIGINT or SIGTERM stops the run before its next step.

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use snapset_common::LogFormat;
use snapset_core::{CancelFlag, ExitCode};
use tracing::{error, info, warn};

mod app;
mod cli;
mod config;
mod output;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            let code = match e.downcast_ref::<snapset_core::Error>() {
                Some(err) => err.exit_code(),
                None => ExitCode::InvalidUsage,
            };
            error!(error = %e, exit_code = code.code(), "Command failed");
            eprintln!("snapset: {:#}", e);
            code
        }
    };
    process::exit(code.code());
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = Config::load(&args.config)?.with_cli_overrides(&args);

    let format: LogFormat = config.logging.format.parse()?;
    format.init(&config.logging.level)?;
    config.validate().context("Invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = args.command.name(),
        config = %args.config.display(),
        "Starting snapset"
    );

    let cancel = CancelFlag::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let coordinator = app::build_coordinator(&config, cancel).await?;

    let mut stdout = std::io::stdout().lock();
    let code = app::execute(&coordinator, &args.command, args.output, &mut stdout).await?;
    if code != ExitCode::Success {
        warn!(exit_code = code.code(), "Validation failed");
    }
    Ok(code)
}

async fn cancel_on_signal(cancel: CancelFlag) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            warn!("Received SIGTERM, stopping before the next step");
        }
        _ = sigint.recv() => {
            warn!("Received SIGINT, stopping before the next step");
        }
    }
    cancel.cancel();
}
