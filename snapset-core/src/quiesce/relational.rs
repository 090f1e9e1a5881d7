//! Relational database: a global read lock held across the snap command.
//!
//! The SQL client's `system` command always exits zero, so the script
//! echoes the snap command's status as `SNAP_RC=<n>` and, for older
//! wrappers, the `FAILED_SNAP_COMMAND` sentinel. Output with neither marker
//! counts as success only when the array shows the snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::{Bracket, BracketOutcome, DbLun, GroupRef, Quiescer};
use crate::cluster::ClusterControl;
use crate::cmd::CommandLine;
use crate::credentials::Decrypter;
use crate::drivers::{existing_snap, SnapOutcome};
use crate::error::{DriverFault, Error, Result};
use crate::model::DatabaseKind;
use crate::rpc::RpcClient;
use crate::settings::DatabaseSettings;

const SENTINEL: &str = "FAILED_SNAP_COMMAND";

static SNAP_RC: Lazy<Regex> = Lazy::new(|| Regex::new(r"SNAP_RC=(\d+)").expect("static regex"));

/// Exit status of the snap command as reported in the session output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Exited(i32),
    /// Only the legacy sentinel was found.
    SentinelFailed,
    /// Neither marker was found.
    Unknown,
}

pub fn parse_session_status(output: &str) -> SessionStatus {
    if let Some(rc) = SNAP_RC
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
    {
        return SessionStatus::Exited(rc);
    }
    if output.contains(SENTINEL) {
        SessionStatus::SentinelFailed
    } else {
        SessionStatus::Unknown
    }
}

/// SQL script that locks, runs `snap` and unlocks.
fn lock_script(snap: &CommandLine) -> String {
    [
        "FLUSH TABLES WITH READ LOCK;".to_string(),
        format!(
            "system {}; rc=$?; echo SNAP_RC=$rc; [ $rc -eq 0 ] || echo {}",
            snap.to_shell(),
            SENTINEL
        ),
        "UNLOCK TABLES;".to_string(),
    ]
    .join("\n")
}

pub struct RelationalQuiescer {
    rpc: RpcClient,
    cluster: Arc<dyn ClusterControl>,
    decrypter: Arc<dyn Decrypter>,
    group: GroupRef,
    client: String,
    user: String,
    password_key: String,
}

impl RelationalQuiescer {
    pub fn new(
        rpc: RpcClient,
        cluster: Arc<dyn ClusterControl>,
        decrypter: Arc<dyn Decrypter>,
        group: GroupRef,
        databases: &DatabaseSettings,
    ) -> Self {
        Self {
            rpc,
            cluster,
            decrypter,
            group,
            client: databases.relational_client.clone(),
            user: databases.relational_user.clone(),
            password_key: databases.relational_password_key.clone(),
        }
    }

    #[instrument(skip(self, host, lun), fields(lun_id = %lun.lun_id, snap = %lun.snap_name))]
    async fn snap_locked(&self, host: &str, password: &str, lun: &DbLun) -> Result<SnapOutcome> {
        if let Some(outcome) = existing_snap(lun.san.as_ref(), &lun.lun_id, &lun.snap_name).await? {
            return Ok(outcome);
        }
        let snap = lun.san.snap_command(&lun.lun_id, &lun.snap_name);
        let session = CommandLine::new(&self.client)
            .args(["-u", self.user.as_str(), "-N", "-B", "-e"])
            .arg(lock_script(&snap))
            .env("MYSQL_PWD", password);
        let out = self.rpc.exec(host, session).await?;

        match parse_session_status(&out.stdout) {
            SessionStatus::Exited(0) => {}
            SessionStatus::Exited(rc) => {
                return Err(Error::Vendor(
                    DriverFault::fatal(&lun.lun_id, format!("snap command exited with {}", rc))
                        .with_code(rc.to_string()),
                ))
            }
            SessionStatus::SentinelFailed => {
                return Err(Error::vendor_fatal(&lun.lun_id, "snap command failed inside lock session"))
            }
            SessionStatus::Unknown => {
                warn!("No snap status in lock session output, checking the array");
                if existing_snap(lun.san.as_ref(), &lun.lun_id, &lun.snap_name)
                    .await?
                    .is_none()
                {
                    return Err(Error::vendor_fatal(
                        &lun.lun_id,
                        "lock session reported no snap status and no snapshot exists",
                    ));
                }
            }
        }
        info!("Snapshot taken under read lock");
        Ok(SnapOutcome::Created)
    }
}

#[async_trait]
impl Quiescer for RelationalQuiescer {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Relational
    }

    async fn open(&self, bracket: &mut Bracket) -> Result<()> {
        let host = self.group.active_host(self.cluster.as_ref()).await?;
        bracket.hosts = vec![host];
        Ok(())
    }

    /// The lock lives inside one client session per LUN, so there is
    /// nothing held between calls.
    async fn snap(&self, bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
        let host = bracket
            .hosts
            .first()
            .ok_or_else(|| Error::Internal("relational bracket not open".to_string()))?;
        let password = self.decrypter.password(&self.password_key, &self.user).await?;
        let mut outcome = Vec::with_capacity(luns.len());
        for lun in luns {
            let result = self.snap_locked(host, &password, lun).await?;
            outcome.push((lun.snap_name.clone(), result));
        }
        Ok(outcome)
    }

    async fn close(&self, _bracket: &Bracket) -> Result<()> {
        Ok(())
    }
}
