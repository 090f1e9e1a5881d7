//! Legacy object database: the vendor backup tool splits the database and
//! runs the snap command while it is split.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{Bracket, BracketOutcome, DbLun, GroupRef, Quiescer};
use crate::cluster::ClusterControl;
use crate::cmd::CommandLine;
use crate::drivers::{existing_snap, SnapOutcome};
use crate::error::{Error, Result};
use crate::model::DatabaseKind;
use crate::rpc::RpcClient;
use crate::settings::DatabaseSettings;

pub struct ObjectQuiescer {
    rpc: RpcClient,
    cluster: Arc<dyn ClusterControl>,
    group: GroupRef,
    backup_tool: String,
    db_name: String,
    os_user: String,
}

impl ObjectQuiescer {
    pub fn new(
        rpc: RpcClient,
        cluster: Arc<dyn ClusterControl>,
        group: GroupRef,
        databases: &DatabaseSettings,
    ) -> Self {
        Self {
            rpc,
            cluster,
            group,
            backup_tool: databases.object_backup_tool.clone(),
            db_name: databases.object_db_name.clone(),
            os_user: databases.object_os_user.clone(),
        }
    }

    fn split_command(&self, snap: &CommandLine) -> CommandLine {
        CommandLine::new(&self.backup_tool)
            .arg("-cmd")
            .arg(snap.to_shell())
            .arg("-split")
            .arg(&self.db_name)
    }
}

#[async_trait]
impl Quiescer for ObjectQuiescer {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Object
    }

    async fn open(&self, bracket: &mut Bracket) -> Result<()> {
        let host = self.group.active_host(self.cluster.as_ref()).await?;
        bracket.hosts = vec![host];
        Ok(())
    }

    #[instrument(skip_all, fields(db = %self.db_name))]
    async fn snap(&self, bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
        let host = bracket
            .hosts
            .first()
            .ok_or_else(|| Error::Internal("object database bracket not open".to_string()))?;
        let mut outcome = Vec::with_capacity(luns.len());
        for lun in luns {
            if let Some(existing) = existing_snap(lun.san.as_ref(), &lun.lun_id, &lun.snap_name).await? {
                outcome.push((lun.snap_name.clone(), existing));
                continue;
            }
            let snap = lun.san.snap_command(&lun.lun_id, &lun.snap_name);
            self.rpc
                .exec_as(host, self.split_command(&snap), Some(self.os_user.clone()))
                .await?;
            info!(lun_id = %lun.lun_id, snap = %lun.snap_name, "Snapshot taken with database split");
            outcome.push((lun.snap_name.clone(), SnapOutcome::Created));
        }
        Ok(outcome)
    }

    async fn close(&self, _bracket: &Bracket) -> Result<()> {
        Ok(())
    }
}
