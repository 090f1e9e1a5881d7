//! # snapset Node Agent
//!
//! Runs on every node the coordinator snapshots and exposes the local
//! actions it needs over HTTP:
//!
//! - **lvm**: list, snapshot, remove and merge logical volumes
//! - **fs**: freeze and unfreeze a filesystem, with an automatic thaw
//! - **exec**: run a command, optionally as another user
//! - **graphdb**: checkpoint I/O limit, forced checkpoint, raft status
//! - **directory**: directory server backup, cleanup and restore
//!
//! On SIGTERM or SIGINT the agent stops accepting requests and thaws any
//! filesystem it still holds frozen before exiting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use snapset_common::LogFormat;
use snapset_core::cmd::SystemRunner;
use tracing::info;

use snapset_agent::config::{self, AgentConfig};
use snapset_agent::handlers::ActionHandler;
use snapset_agent::server::{self, AppState};

/// snapset node agent
#[derive(Parser, Debug)]
#[command(name = "snapset-agent", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SNAPSET_AGENT_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(long, env = "SNAPSET_AGENT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "SNAPSET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text or json), overrides the configuration file
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AgentConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen.to_string();
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    config.validate()?;

    let format: LogFormat = config.log_format.parse()?;
    format.init(&config.log_level)?;

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting snapset agent"
    );

    // Each action applies its own timeout; this one only bounds runaway tools.
    let runner =
        SystemRunner::new().with_timeout(Duration::from_secs(config.exec.max_timeout_secs));
    let handler = ActionHandler::new(Arc::new(config), Arc::new(runner));
    let state = Arc::new(AppState::new(handler));

    server::serve(addr, state.clone(), async {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "Shutdown signal handler failed");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    state.handler.thaw_all().await;
    info!("Agent stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}
