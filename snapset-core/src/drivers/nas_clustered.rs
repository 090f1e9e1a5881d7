//! Family A NAS driver: clustered NAS console reached over ssh.
//!
//! Snapshots are space-optimized rollbacks backed by a per-pool rollback
//! cache. Shares are served from `/vx/<fs>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::parse::{column_table, size_to_mb};
use super::{
    CacheInfo, DestroyOutcome, ExportMap, FsSnap, NasDriver, NasFs, NasLogin, SnapOutcome,
};
use crate::cmd::{CmdError, CmdOutput, CommandLine, CommandRunner};
use crate::error::{DriverFault, Error, Result};
use crate::model::{NfsExport, VendorFamily};
use crate::settings::NasSettings;

static ERROR_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(V-\d+-\d+(?:-\d+)?)\b").expect("static regex"));

const SHARE_ROOT: &str = "/vx/";

pub struct ClusteredNas {
    login: NasLogin,
    ssh: String,
    connect_timeout_secs: u64,
    state_attempts: u32,
    state_spacing: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl ClusteredNas {
    pub fn new(login: NasLogin, settings: &NasSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            login,
            ssh: settings.ssh.clone(),
            connect_timeout_secs: settings.ssh_connect_timeout_secs,
            state_attempts: settings.share_list_attempts.max(1),
            state_spacing: settings.retry_spacing(),
            runner,
        }
    }

    /// The console command wrapped in ssh. With a password the login goes
    /// through `sshpass -e`, which reads it from the environment.
    fn command(&self, console_cmd: &str) -> CommandLine {
        let target = format!("{}@{}", self.login.user, self.login.address);
        let ssh_args = [
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            target,
            console_cmd.to_string(),
        ];
        if self.login.password.is_empty() {
            CommandLine::new(&self.ssh)
                .arg("-o")
                .arg("BatchMode=yes")
                .args(ssh_args)
        } else {
            CommandLine::new("sshpass")
                .arg("-e")
                .arg(&self.ssh)
                .args(ssh_args)
                .env("SSHPASS", &self.login.password)
        }
    }

    async fn run(&self, resource: &str, console_cmd: &str) -> Result<String> {
        let cmd = self.command(console_cmd);
        debug!(console = %self.login.console, command = %console_cmd, "Running console command");
        match self.runner.output(&cmd).await {
            Ok(out) if out.success() && !reports_error(&out) => Ok(out.stdout),
            Ok(out) => Err(Error::Vendor(classify(resource, &out))),
            Err(CmdError::Timeout { secs, .. }) => Err(Error::vendor_transient(
                resource,
                format!("no answer from {} in {}s", self.login.address, secs),
            )),
            Err(e) => Err(Error::vendor_fatal(resource, e.to_string())),
        }
    }

    async fn filesystems(&self) -> Result<Vec<NasFs>> {
        let out = self.run("fs", "storage fs list").await?;
        Ok(column_table(&out)
            .into_iter()
            .filter_map(|row| {
                let name = row.get("FS")?.clone();
                Some(NasFs {
                    online: row.get("STATUS").map(String::as_str) == Some("online"),
                    size_mb: row.get("SIZE").and_then(|s| size_to_mb(s)),
                    name,
                })
            })
            .collect())
    }

    async fn rollbacks(&self) -> Result<Vec<FsSnap>> {
        let out = self.run("rollback", "storage rollback list").await?;
        Ok(column_table(&out)
            .into_iter()
            .filter_map(|row| {
                Some(FsSnap {
                    name: row.get("NAME")?.clone(),
                    filesystem: row.get("FILESYSTEM")?.clone(),
                })
            })
            .collect())
    }

    async fn wait_for_status(&self, fs: &str, online: bool) -> Result<()> {
        for attempt in 1..=self.state_attempts {
            let current = self
                .filesystems()
                .await?
                .into_iter()
                .find(|f| f.name == fs)
                .map(|f| f.online);
            if current == Some(online) {
                return Ok(());
            }
            debug!(fs = %fs, attempt, "Filesystem not yet in requested state");
            tokio::time::sleep(self.state_spacing).await;
        }
        Err(Error::vendor_transient(
            fs,
            format!("did not go {}", if online { "online" } else { "offline" }),
        ))
    }
}

fn reports_error(out: &CmdOutput) -> bool {
    out.combined().contains(" ERROR ")
}

fn classify(resource: &str, out: &CmdOutput) -> DriverFault {
    let text = out.combined();
    let message = text.trim().to_string();
    // ssh exits 255 when the connection itself failed.
    let fault = if out.status == 255 || text.contains("Connection timed out") {
        DriverFault::transient(resource, message)
    } else {
        DriverFault::fatal(resource, message)
    };
    match ERROR_CODE.captures(&text).and_then(|c| c.get(1)) {
        Some(code) => fault.with_code(code.as_str()),
        None => fault,
    }
}

fn mentions(err: &Error, needles: &[&str]) -> bool {
    match err {
        Error::Vendor(fault) => {
            let message = fault.message.to_ascii_lowercase();
            needles.iter().any(|n| message.contains(n))
        }
        _ => false,
    }
}

fn is_exists(err: &Error) -> bool {
    mentions(err, &["already exists"])
}

fn is_not_found(err: &Error) -> bool {
    mentions(err, &["does not exist", "not exist", "not found"])
}

fn in_pool(fs: &str, pool: &str) -> bool {
    fs.strip_prefix(pool)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Rows of `storage rollback cache list`:
/// `NAME  TOTAL(Mb)  USED(Mb) (%)  AVAIL(Mb) (%)  SDCNT`.
fn parse_caches(text: &str) -> Vec<CacheInfo> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let total_mb = fields.get(1)?.parse().ok()?;
            let used_mb = fields.get(2)?.parse().ok()?;
            Some(CacheInfo {
                name: fields[0].to_string(),
                total_mb,
                used_mb,
            })
        })
        .collect()
}

/// Lines of `nfs share show`: `/vx/<fs>  <client>  (<options>)`.
fn parse_shares(text: &str) -> Result<Vec<(String, NfsExport)>> {
    let mut shares = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let fs = match fields.first().and_then(|p| p.strip_prefix(SHARE_ROOT)) {
            Some(fs) => fs,
            None => continue,
        };
        if line.to_ascii_uppercase().contains("FAULTED") {
            return Err(Error::vendor_fatal(fs, "share is faulted"));
        }
        let client = fields.get(1).copied().unwrap_or("*");
        let options = fields
            .get(2)
            .map(|o| o.trim_start_matches('(').trim_end_matches(')'))
            .unwrap_or("");
        shares.push((fs.to_string(), NfsExport::new(client, options)));
    }
    Ok(shares)
}

#[async_trait]
impl NasDriver for ClusteredNas {
    fn family(&self) -> VendorFamily {
        VendorFamily::ClusteredNas
    }

    fn console(&self) -> &str {
        &self.login.console
    }

    async fn enumerate(&self, pool: &str) -> Result<Vec<NasFs>> {
        let all = self.filesystems().await?;
        Ok(all.into_iter().filter(|f| in_pool(&f.name, pool)).collect())
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn snap(&self, fs: &str, snap_name: &str, cache: Option<&str>) -> Result<SnapOutcome> {
        let cache = cache.ok_or_else(|| {
            Error::Internal(format!("rollback {} needs a cache", snap_name))
        })?;
        let existing = |snaps: Vec<FsSnap>| -> Result<Option<SnapOutcome>> {
            match snaps.into_iter().find(|s| s.name == snap_name) {
                Some(s) if s.filesystem == fs => Ok(Some(SnapOutcome::AlreadyPresent)),
                Some(s) => Err(Error::NameConflict(format!(
                    "{} exists on {}, expected {}",
                    snap_name, s.filesystem, fs
                ))),
                None => Ok(None),
            }
        };

        if let Some(outcome) = existing(self.rollbacks().await?)? {
            info!("Rollback already present");
            return Ok(outcome);
        }
        let cmd = format!(
            "storage rollback create space-optimized {} {} {}",
            snap_name, fs, cache
        );
        match self.run(fs, &cmd).await {
            Ok(_) => {
                info!("Rollback created");
                Ok(SnapOutcome::Created)
            }
            Err(err) if is_exists(&err) => match existing(self.rollbacks().await?)? {
                Some(outcome) => Ok(outcome),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn list_snaps(&self, pool: &str, prefix: &str) -> Result<Vec<FsSnap>> {
        Ok(self
            .rollbacks()
            .await?
            .into_iter()
            .filter(|s| s.name.starts_with(prefix) && in_pool(&s.filesystem, pool))
            .collect())
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn restore(&self, fs: &str, snap_name: &str) -> Result<()> {
        self.run(fs, &format!("storage rollback restore {} {}", fs, snap_name))
            .await?;
        info!("Filesystem restored");
        Ok(())
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn destroy(&self, fs: &str, snap_name: &str) -> Result<DestroyOutcome> {
        match self
            .run(fs, &format!("storage rollback destroy {} {}", snap_name, fs))
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Destroyed),
            Err(err) if is_not_found(&err) => Ok(DestroyOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }

    async fn list_caches(&self) -> Result<Vec<CacheInfo>> {
        let out = self.run("cache", "storage rollback cache list").await?;
        Ok(parse_caches(&out))
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn create_cache(&self, name: &str, size_mb: u64, pool: &str) -> Result<SnapOutcome> {
        if self.list_caches().await?.iter().any(|c| c.name == name) {
            info!("Rollback cache already present");
            return Ok(SnapOutcome::AlreadyPresent);
        }
        let cmd = format!("storage rollback cache create {} {}M {}", name, size_mb, pool);
        match self.run(name, &cmd).await {
            Ok(_) => {
                info!(size_mb, "Rollback cache created");
                Ok(SnapOutcome::Created)
            }
            Err(err) if is_exists(&err) => Ok(SnapOutcome::AlreadyPresent),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn destroy_cache(&self, name: &str) -> Result<DestroyOutcome> {
        match self
            .run(name, &format!("storage rollback cache destroy {}", name))
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Destroyed),
            Err(err) if is_not_found(&err) => Ok(DestroyOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }

    async fn offline(&self, fs: &str) -> Result<()> {
        self.run(fs, &format!("storage fs offline {}", fs)).await?;
        self.wait_for_status(fs, false).await
    }

    async fn online(&self, fs: &str) -> Result<()> {
        self.run(fs, &format!("storage fs online {}", fs)).await?;
        self.wait_for_status(fs, true).await
    }

    async fn list_exports(&self, pool: &str) -> Result<ExportMap> {
        let out = self.run("nfs", "nfs share show").await?;
        let mut exports = ExportMap::new();
        for (fs, export) in parse_shares(&out)? {
            if in_pool(&fs, pool) {
                exports.entry(fs).or_default().push(export);
            }
        }
        Ok(exports)
    }

    async fn add_export(&self, fs: &str, export: &NfsExport) -> Result<()> {
        let cmd = format!(
            "nfs share add {} {}{} {}",
            export.options, SHARE_ROOT, fs, export.client
        );
        match self.run(fs, &cmd).await {
            Ok(_) => Ok(()),
            Err(err) if is_exists(&err) => {
                debug!(fs = %fs, client = %export.client, "Share already present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn remove_export(&self, fs: &str, client: &str) -> Result<()> {
        let cmd = format!("nfs share delete {}{} {}", SHARE_ROOT, fs, client);
        match self.run(fs, &cmd).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                warn!(fs = %fs, client = %client, "Share already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(console = %self.login.console))]
    async fn destroy_fs(&self, fs: &str) -> Result<DestroyOutcome> {
        match self.run(fs, &format!("storage fs destroy {}", fs)).await {
            Ok(_) => {
                info!("Filesystem destroyed");
                Ok(DestroyOutcome::Destroyed)
            }
            Err(err) if is_not_found(&err) => Ok(DestroyOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedRunner;

    fn driver(runner: Arc<ScriptedRunner>) -> ClusteredNas {
        let login = NasLogin {
            console: "nas1".to_string(),
            address: "10.0.0.9".to_string(),
            user: "support".to_string(),
            password: "secret".to_string(),
        };
        let settings = NasSettings {
            retry_spacing_secs: 0,
            ..NasSettings::default()
        };
        ClusteredNas::new(login, &settings, runner)
    }

    const ROLLBACKS: &str = "\
NAME                 TYPE     FILESYSTEM   SNAPDATE
===================  =======  ===========  ==========
s1-enm1-data         spaceopt enm1-data    2024/01/02
s1-enm1-home         spaceopt enm1-home    2024/01/02
s1-other-data        spaceopt other-data   2024/01/02
";

    #[test]
    fn test_password_goes_through_environment() {
        let cmd = driver(Arc::new(ScriptedRunner::new())).command("storage fs list");
        assert_eq!(cmd.program, "sshpass");
        assert_eq!(cmd.env.get("SSHPASS").map(String::as_str), Some("secret"));
        assert!(!cmd.to_shell().contains("secret"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("storage fs list"));
    }

    #[tokio::test]
    async fn test_list_snaps_by_pool() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("storage rollback list", CmdOutput::ok(ROLLBACKS));
        let snaps = driver(runner).list_snaps("enm1", "s1-").await.unwrap();
        let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s1-enm1-data", "s1-enm1-home"]);
    }

    #[tokio::test]
    async fn test_snap_present_and_conflict() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("storage rollback list", CmdOutput::ok(ROLLBACKS));
        let nas = driver(runner.clone());
        assert_eq!(
            nas.snap("enm1-data", "s1-enm1-data", Some("enm1-cache")).await.unwrap(),
            SnapOutcome::AlreadyPresent
        );
        assert!(matches!(
            nas.snap("enm1-logs", "s1-enm1-data", Some("enm1-cache")).await,
            Err(Error::NameConflict(_))
        ));
        assert!(runner.calls().iter().all(|c| !c.contains("rollback create")));
    }

    #[tokio::test]
    async fn test_console_error_in_stdout_is_detected() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "storage rollback restore",
            CmdOutput::ok("SFS rollback ERROR V-288-1234 Filesystem enm1-data is online\n"),
        );
        let err = driver(runner).restore("enm1-data", "s1-enm1-data").await.unwrap_err();
        match err {
            Error::Vendor(fault) => assert_eq!(fault.code.as_deref(), Some("V-288-1234")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_caches_and_shares() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "storage rollback cache list",
            CmdOutput::ok(
                "CACHE NAME   TOTAL(Mb)  USED(Mb) (%)  AVAIL(Mb) (%)  SDCNT\n\
                 ==========   =========  ============  =============  =====\n\
                 enm1-cache   1024       820  (80)     204   (20)     3\n",
            ),
        );
        runner.on(
            "nfs share show",
            CmdOutput::ok(
                "/vx/enm1-data   10.0.0.1   (rw,no_root_squash)\n\
                 /vx/enm1-data   10.0.0.2   (rw,no_root_squash)\n\
                 /vx/other-data  10.0.0.1   (ro)\n",
            ),
        );
        let nas = driver(runner);

        let caches = nas.list_caches().await.unwrap();
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].used_percent(), 80.08);

        let exports = nas.list_exports("enm1").await.unwrap();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports["enm1-data"].len(), 2);
        assert_eq!(exports["enm1-data"][0].options, "rw,no_root_squash");
    }

    #[tokio::test]
    async fn test_faulted_share_is_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "nfs share show",
            CmdOutput::ok("/vx/enm1-data   10.0.0.1   (rw)   FAULTED\n"),
        );
        assert!(driver(runner).list_exports("enm1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_waits_for_status() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("storage fs offline", CmdOutput::ok(""));
        runner.on_sequence(
            "storage fs list",
            vec![
                CmdOutput::ok("FS          STATUS\nenm1-data   online\n"),
                CmdOutput::ok("FS          STATUS\nenm1-data   offline\n"),
            ],
        );
        driver(runner.clone()).offline("enm1-data").await.unwrap();
        let lists = runner.calls().iter().filter(|c| c.contains("storage fs list")).count();
        assert_eq!(lists, 2);
    }

    #[test]
    fn test_pool_membership() {
        assert!(in_pool("enm1-data", "enm1"));
        assert!(!in_pool("enm10-data", "enm1"));
        assert!(!in_pool("enm1", "enm1"));
    }
}
