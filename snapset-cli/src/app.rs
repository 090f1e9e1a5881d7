//! Wiring of the coordinator and dispatch of one command.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use snapset_core::cmd::{CommandRunner, SystemRunner};
use snapset_core::{
    CancelFlag, CommandDecrypter, Coordinator, CreateOptions, Decrypter, Error, ExitCode,
    HttpTransport, MetadataStore, ModelReader, RestModelClient, Result, RpcClient,
    VendorDriverFactory,
};
use tracing::{debug, info};

use crate::cli::{Command, OutputFormat};
use crate::config::Config;
use crate::output;

/// Build a coordinator against the live deployment model, agents and
/// storage described by `config`.
pub async fn build_coordinator(config: &Config, cancel: CancelFlag) -> Result<Coordinator> {
    let settings = config.snapshot.clone();

    let runner: Arc<dyn CommandRunner> = Arc::new(
        SystemRunner::new().with_timeout(settings.timeouts.vendor_snap()),
    );
    let decrypter: Arc<dyn Decrypter> =
        Arc::new(CommandDecrypter::new(&config.decrypter.program, runner.clone()));

    let model = &settings.model;
    let password = if model.password_key.is_empty() {
        String::new()
    } else {
        decrypter.password(&model.password_key, &model.user).await?
    };
    let client = RestModelClient::new(
        &model.url,
        &model.user,
        password,
        Duration::from_secs(model.request_timeout_secs),
    )?;
    debug!(url = %model.url, user = %model.user, "Deployment model client ready");

    let transport = HttpTransport::new(&settings.rpc.scheme, settings.rpc.port)?;
    let rpc = RpcClient::new(Arc::new(transport), settings.timeouts.rpc_deadline());
    let factory = VendorDriverFactory::new(settings.clone(), runner, rpc);

    Ok(Coordinator::new(
        settings.clone(),
        ModelReader::new(Arc::new(client), settings),
        Arc::new(factory),
        decrypter,
        MetadataStore::new(&config.metadata.dir),
        cancel,
    ))
}

/// Run `command` and print its result. A failed validation is reported as
/// the exit code of its first offense.
pub async fn execute<W: Write>(
    coordinator: &Coordinator,
    command: &Command,
    format: OutputFormat,
    out: &mut W,
) -> Result<ExitCode> {
    match command {
        Command::Create {
            set,
            keep_on_failure,
        } => {
            let options = CreateOptions {
                keep_on_failure: *keep_on_failure,
            };
            let manifest = coordinator.create_snapshot(set, options).await?;
            output::manifest(out, format, &manifest)?;
            info!(set = %set, snapshots = manifest.len(), "Snapshot set created");
        }
        Command::Remove { set, force } => {
            let steps = coordinator.remove_snapshots(set, *force).await?;
            output::steps(out, format, &steps)?;
            info!(set = %set, "Snapshot set removed");
        }
        Command::Restore { set, force } => match coordinator.restore_snapshot(set, *force).await {
            Ok(steps) => {
                output::steps(out, format, &steps)?;
                info!(set = %set, "Snapshot set restored");
            }
            Err(e) => {
                if let Error::RestoreFailed { steps, offline, .. } = &e {
                    output::restore_failure(out, format, steps, offline)?;
                }
                return Err(e);
            }
        },
        Command::List { set, detailed } => {
            let reports = coordinator.list_snapshots(set).await?;
            output::reports(out, format, &reports, *detailed)?;
        }
        Command::Validate { set } => {
            let verdict = coordinator.validate_snapshots(set).await?;
            output::verdict(out, format, &verdict)?;
            if let Some(first) = verdict.offenders.first() {
                return Ok(ExitCode::from(first.kind));
            }
        }
    }
    Ok(ExitCode::Success)
}
