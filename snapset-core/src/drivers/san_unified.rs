//! Unified-block SAN driver.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::parse::percent;
use super::uemcli::{bytes_to_mb, is_exists, is_not_found};
use super::{ArrayLun, DestroyOutcome, LunSnap, SanDriver, SanLogin, UemCli};
use crate::cmd::{CommandLine, CommandRunner};
use crate::credentials::encode_password;
use crate::error::{Error, Result};
use crate::model::VendorFamily;
use crate::settings::SanSettings;

pub struct UemSan {
    array: String,
    login: SanLogin,
    cli: UemCli,
    node_snap_cli: String,
    description: String,
}

impl UemSan {
    pub fn new(login: SanLogin, settings: &SanSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let cli = UemCli::new(
            &settings.unified_cli,
            &login.spa,
            &login.user,
            &login.password,
            runner,
        );
        Self {
            array: login.array.clone(),
            login,
            cli,
            node_snap_cli: settings.node_snap_cli.clone(),
            description: settings.description.clone(),
        }
    }
}

#[async_trait]
impl SanDriver for UemSan {
    fn family(&self) -> VendorFamily {
        VendorFamily::UnifiedBlock
    }

    fn array(&self) -> &str {
        &self.array
    }

    #[instrument(skip(self), fields(array = %self.array))]
    async fn enumerate(&self, pool: &str) -> Result<Vec<ArrayLun>> {
        let records = self.cli.show(pool, &["/stor/prov/luns/lun"]).await?;
        let luns = records
            .into_iter()
            .filter(|r| r.get("Pool").map(String::as_str) == Some(pool))
            .filter_map(|r| {
                Some(ArrayLun {
                    id: r.get("ID")?.clone(),
                    name: r.get("Name")?.clone(),
                    pool: pool.to_string(),
                    size_mb: r.get("Size").and_then(|s| bytes_to_mb(s)).unwrap_or(0),
                })
            })
            .collect::<Vec<_>>();
        debug!(count = luns.len(), "Enumerated LUNs");
        Ok(luns)
    }

    async fn pool_subscription(&self, pool: &str) -> Result<f64> {
        let records = self
            .cli
            .show(pool, &["/stor/config/pool", "-name", pool])
            .await?;
        records
            .iter()
            .find_map(|r| r.get("Subscription percent").and_then(|v| percent(v)))
            .ok_or_else(|| Error::vendor_fatal(pool, "no subscription figure in pool listing"))
    }

    async fn list_snaps(&self, prefix: &str) -> Result<Vec<LunSnap>> {
        let records = self.cli.show(prefix, &["/prot/snap"]).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| {
                let name = r.get("Name")?.clone();
                if !name.starts_with(prefix) {
                    return None;
                }
                Some(LunSnap {
                    name,
                    lun_id: r.get("Source").cloned().unwrap_or_default(),
                    created: r.get("Creation time").cloned(),
                    state: r.get("State").cloned(),
                })
            })
            .collect())
    }

    async fn create_snap(&self, lun_id: &str, snap_name: &str) -> Result<()> {
        self.cli
            .run(
                lun_id,
                &[
                    "/prot/snap",
                    "create",
                    "-name",
                    snap_name,
                    "-source",
                    lun_id,
                    "-descr",
                    self.description.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(array = %self.array))]
    async fn restore(&self, lun_id: &str, snap_name: &str, backup_name: &str) -> Result<()> {
        self.cli
            .run(
                lun_id,
                &["/prot/snap", "-name", snap_name, "restore", "-backupName", backup_name],
            )
            .await?;
        info!("LUN restored");
        Ok(())
    }

    #[instrument(skip(self), fields(array = %self.array))]
    async fn destroy(&self, snap_name: &str) -> Result<DestroyOutcome> {
        match self
            .cli
            .run(snap_name, &["/prot/snap", "-name", snap_name, "delete"])
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Destroyed),
            Err(err) if is_not_found(&err) => {
                debug!("Snapshot already absent");
                Ok(DestroyOutcome::AlreadyAbsent)
            }
            Err(err) => Err(err),
        }
    }

    fn snap_command(&self, lun_id: &str, snap_name: &str) -> CommandLine {
        CommandLine::new(&self.node_snap_cli)
            .arg("create_snap")
            .arg(format!("--ip_spa={}", self.login.spa))
            .arg(format!("--user={}", self.login.user))
            .arg(format!("--password={}", encode_password(&self.login.password)))
            .arg(format!("--scope={}", self.login.scope))
            .arg(format!("--lun_id={}", lun_id))
            .arg(format!("--snap_name={}", snap_name))
            .arg("--array=unity")
            .arg(format!("--description={}", self.description))
            .arg("--enc=b64")
    }

    fn is_exists_error(&self, err: &Error) -> bool {
        is_exists(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdOutput;
    use crate::drivers::SnapOutcome;
    use crate::mock::ScriptedRunner;

    fn driver(runner: Arc<ScriptedRunner>) -> UemSan {
        let login = SanLogin {
            array: "unity1".to_string(),
            spa: "10.0.0.5".to_string(),
            spb: None,
            user: "admin".to_string(),
            password: "secret".to_string(),
            scope: "0".to_string(),
        };
        UemSan::new(login, &SanSettings::default(), runner)
    }

    #[tokio::test]
    async fn test_enumerate_filters_pool() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "/stor/prov/luns/lun show",
            CmdOutput::ok(
                "1:    ID   = sv_1\n      Name = neo4jlun\n      Pool = pool1\n      Size = 107374182400 (100.0G)\n\n\
                 2:    ID   = sv_2\n      Name = other\n      Pool = pool2\n      Size = 1048576\n",
            ),
        );
        let luns = driver(runner).enumerate("pool1").await.unwrap();
        assert_eq!(luns.len(), 1);
        assert_eq!(luns[0].id, "sv_1");
        assert_eq!(luns[0].size_mb, 102_400);
    }

    #[tokio::test]
    async fn test_create_race_resolves_to_present() {
        let runner = Arc::new(ScriptedRunner::new());
        // First listing is empty, the create loses a race, the second listing
        // shows the snapshot on the intended LUN.
        runner.on_sequence(
            "/prot/snap show",
            vec![
                CmdOutput::ok(""),
                CmdOutput::ok("1:    ID   = 38654705680\n      Name = s1_sv_1\n      Source = sv_1\n"),
            ],
        );
        runner.on(
            "/prot/snap create",
            CmdOutput::failed(1, "Operation failed. Error code: 0x6000c1a\nName already exists."),
        );
        let outcome = driver(runner).snap("sv_1", "s1_sv_1").await.unwrap();
        assert_eq!(outcome, SnapOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_destroy_missing_is_absent() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "/prot/snap -name s1_sv_1 delete",
            CmdOutput::failed(1, "Operation failed. Error code: 0x7d13005\nThe snapshot does not exist."),
        );
        assert_eq!(
            driver(runner).destroy("s1_sv_1").await.unwrap(),
            DestroyOutcome::AlreadyAbsent
        );
    }
}
