//! Directory server: exported to a side location, then its service group
//! is held offline while the LUN is snapped.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{snap_luns, Bracket, BracketOutcome, DbLun, GroupRef, Quiescer};
use crate::agent_api::AgentRequest;
use crate::cluster::ClusterControl;
use crate::error::Result;
use crate::model::DatabaseKind;
use crate::rpc::RpcClient;
use crate::settings::DatabaseSettings;

pub struct DirectoryQuiescer {
    rpc: RpcClient,
    cluster: Arc<dyn ClusterControl>,
    group: GroupRef,
    backup_dir: String,
    log_dir: String,
}

impl DirectoryQuiescer {
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
            backup_dir: databases.directory_backup_dir.clone(),
            log_dir: databases.directory_log_dir.clone(),
        }
    }
}

#[async_trait]
impl Quiescer for DirectoryQuiescer {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Directory
    }

    #[instrument(skip_all, fields(group = %self.group.group))]
    async fn open(&self, bracket: &mut Bracket) -> Result<()> {
        bracket.hosts = self.group.hosts.clone();
        let request = AgentRequest::DirectoryBackup {
            backup_dir: self.backup_dir.clone(),
            log_dir: self.log_dir.clone(),
        };
        self.rpc
            .fan_out::<()>(&self.group.hosts, &request)
            .await
            .complete()?;
        info!(backup_dir = %self.backup_dir, "Directory exported");

        for system in self.group.online_hosts(self.cluster.as_ref()).await? {
            self.cluster
                .offline(&self.group.cluster, &self.group.group, &system)
                .await?;
            bracket.offline.push(system);
        }
        Ok(())
    }

    async fn snap(&self, _bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
        snap_luns(luns).await
    }

    #[instrument(skip_all, fields(group = %self.group.group))]
    async fn close(&self, bracket: &Bracket) -> Result<()> {
        let mut first_err = None;
        for system in &bracket.offline {
            if let Err(e) = self
                .cluster
                .online(&self.group.cluster, &self.group.group, system)
                .await
            {
                warn!(system = %system, error = %e, "Failed to bring directory group back online");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(group = %self.group.group))]
    async fn after_restore(&self) -> Result<()> {
        let request = AgentRequest::DirectoryRestore {
            backup_dir: self.backup_dir.clone(),
        };
        self.rpc
            .fan_out::<()>(&self.group.hosts, &request)
            .await
            .complete()?;
        info!("Directory re-imported");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let request = AgentRequest::DirectoryCleanup {
            backup_dir: self.backup_dir.clone(),
            log_dir: self.log_dir.clone(),
        };
        self.rpc
            .fan_out::<()>(&self.group.hosts, &request)
            .await
            .complete()?;
        Ok(())
    }
}
