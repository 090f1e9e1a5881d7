//! Legacy-block SAN driver over the secure CLI.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::parse::{colon_blocks, percent, size_to_mb};
use super::{ArrayLun, DestroyOutcome, LunSnap, SanDriver, SanLogin};
use crate::cmd::{CmdError, CmdOutput, CommandLine, CommandRunner};
use crate::credentials::encode_password;
use crate::error::{DriverFault, Error, Result};
use crate::model::VendorFamily;
use crate::settings::SanSettings;

/// Snapshot name already in use.
const SNAP_EXISTS: &str = "0x716d8005";
/// Snapshot does not exist.
const SNAP_NOT_FOUND: &str = "0x716d8003";

static ERROR_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((0x[0-9a-fA-F]+)\)").expect("static regex"));

/// Drives a legacy-block array. Calls go to storage processor A and fall back
/// to B when A cannot be reached.
pub struct NaviSan {
    login: SanLogin,
    cli: String,
    node_snap_cli: String,
    description: String,
    runner: Arc<dyn CommandRunner>,
}

impl NaviSan {
    pub fn new(login: SanLogin, settings: &SanSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            login,
            cli: settings.legacy_cli.clone(),
            node_snap_cli: settings.node_snap_cli.clone(),
            description: settings.description.clone(),
            runner,
        }
    }

    fn command(&self, sp: &str, args: &[&str]) -> CommandLine {
        CommandLine::new(&self.cli)
            .args(["-h", sp, "-user", self.login.user.as_str()])
            .args(["-password", self.login.password.as_str()])
            .args(["-scope", self.login.scope.as_str()])
            .args(args.iter().copied())
    }

    /// Run against SP A, then SP B when A is unreachable.
    async fn run(&self, resource: &str, args: &[&str]) -> Result<String> {
        let mut targets = vec![self.login.spa.as_str()];
        if let Some(spb) = self.login.spb.as_deref() {
            targets.push(spb);
        }

        let mut last = None;
        for sp in targets {
            let cmd = self.command(sp, args);
            debug!(command = %cmd, "Running array command");
            match self.runner.output(&cmd).await {
                Ok(out) if out.success() && !reports_error(&out) => return Ok(out.stdout),
                Ok(out) => {
                    let fault = classify(resource, &out);
                    if !fault.retryable {
                        return Err(Error::Vendor(fault));
                    }
                    warn!(sp = %sp, error = %fault, "Storage processor unreachable");
                    last = Some(fault);
                }
                Err(CmdError::Timeout { secs, .. }) => {
                    last = Some(DriverFault::transient(
                        resource,
                        format!("no answer from {} in {}s", sp, secs),
                    ));
                }
                Err(e) => return Err(Error::vendor_fatal(resource, e.to_string())),
            }
        }
        Err(Error::Vendor(last.unwrap_or_else(|| {
            DriverFault::fatal(resource, "no storage processor configured")
        })))
    }
}

fn reports_error(out: &CmdOutput) -> bool {
    out.stdout.lines().any(|l| l.trim_start().starts_with("Error"))
}

fn classify(resource: &str, out: &CmdOutput) -> DriverFault {
    let text = out.combined();
    let message = text.trim().to_string();
    let unreachable = ["Could not connect", "connection refused", "timed out", "Unable to connect"]
        .iter()
        .any(|s| text.contains(s));
    let fault = if unreachable {
        DriverFault::transient(resource, message)
    } else {
        DriverFault::fatal(resource, message)
    };
    match ERROR_CODE.captures(&text).and_then(|c| c.get(1)) {
        Some(code) => fault.with_code(code.as_str().to_ascii_lowercase()),
        None => fault,
    }
}

fn has_code(err: &Error, code: &str) -> bool {
    matches!(err, Error::Vendor(fault) if fault.code.as_deref() == Some(code))
}

#[async_trait]
impl SanDriver for NaviSan {
    fn family(&self) -> VendorFamily {
        VendorFamily::LegacyBlock
    }

    fn array(&self) -> &str {
        &self.login.array
    }

    #[instrument(skip(self), fields(array = %self.login.array))]
    async fn enumerate(&self, pool: &str) -> Result<Vec<ArrayLun>> {
        let out = self
            .run(pool, &["lun", "-list", "-poolName", pool, "-userCap"])
            .await?;
        let luns = colon_blocks(&out)
            .into_iter()
            .filter_map(|block| {
                let id = block.get("LOGICAL UNIT NUMBER")?.clone();
                let name = block.get("Name")?.clone();
                let size_mb = block
                    .get("User Capacity (GBs)")
                    .and_then(|gb| size_to_mb(&format!("{}G", gb)))
                    .unwrap_or(0);
                Some(ArrayLun {
                    id,
                    name,
                    pool: pool.to_string(),
                    size_mb,
                })
            })
            .collect::<Vec<_>>();
        debug!(count = luns.len(), "Enumerated LUNs");
        Ok(luns)
    }

    async fn pool_subscription(&self, pool: &str) -> Result<f64> {
        let out = self
            .run(pool, &["storagepool", "-list", "-name", pool, "-prcntOS"])
            .await?;
        colon_blocks(&out)
            .iter()
            .find_map(|b| b.get("Percent Subscribed").and_then(|v| percent(v)))
            .ok_or_else(|| Error::vendor_fatal(pool, "no subscription figure in pool listing"))
    }

    async fn list_snaps(&self, prefix: &str) -> Result<Vec<LunSnap>> {
        let out = self.run(prefix, &["snap", "-list"]).await?;
        Ok(colon_blocks(&out)
            .into_iter()
            .filter_map(|block| {
                let name = block.get("Name")?.clone();
                if !name.starts_with(prefix) {
                    return None;
                }
                Some(LunSnap {
                    name,
                    lun_id: block.get("Source LUN(s)").cloned().unwrap_or_default(),
                    created: block.get("Creation time").cloned(),
                    state: block.get("State").cloned(),
                })
            })
            .collect())
    }

    async fn create_snap(&self, lun_id: &str, snap_name: &str) -> Result<()> {
        self.run(
            lun_id,
            &[
                "snap",
                "-create",
                "-res",
                lun_id,
                "-name",
                snap_name,
                "-descr",
                self.description.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(array = %self.login.array))]
    async fn restore(&self, lun_id: &str, snap_name: &str, backup_name: &str) -> Result<()> {
        self.run(
            lun_id,
            &[
                "snap",
                "-restore",
                "-id",
                snap_name,
                "-res",
                lun_id,
                "-bakName",
                backup_name,
                "-o",
            ],
        )
        .await?;
        info!("LUN restored");
        Ok(())
    }

    #[instrument(skip(self), fields(array = %self.login.array))]
    async fn destroy(&self, snap_name: &str) -> Result<DestroyOutcome> {
        match self
            .run(snap_name, &["snap", "-destroy", "-id", snap_name, "-o"])
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Destroyed),
            Err(err) if has_code(&err, SNAP_NOT_FOUND) => {
                debug!("Snapshot already absent");
                Ok(DestroyOutcome::AlreadyAbsent)
            }
            Err(err) => Err(err),
        }
    }

    fn snap_command(&self, lun_id: &str, snap_name: &str) -> CommandLine {
        let mut cmd = CommandLine::new(&self.node_snap_cli)
            .arg("create_snap")
            .arg(format!("--ip_spa={}", self.login.spa));
        if let Some(spb) = &self.login.spb {
            cmd = cmd.arg(format!("--ip_spb={}", spb));
        }
        cmd.arg(format!("--user={}", self.login.user))
            .arg(format!("--password={}", encode_password(&self.login.password)))
            .arg(format!("--scope={}", self.login.scope))
            .arg(format!("--lun_id={}", lun_id))
            .arg(format!("--snap_name={}", snap_name))
            .arg("--array=vnx")
            .arg(format!("--description={}", self.description))
            .arg("--enc=b64")
    }

    fn is_exists_error(&self, err: &Error) -> bool {
        has_code(err, SNAP_EXISTS)
    }
}
