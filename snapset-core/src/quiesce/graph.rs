//! Graph database cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{snap_luns, Bracket, BracketOutcome, DbLun, GroupRef, Quiescer};
use crate::agent_api::{AgentRequest, RaftRole, RaftStatus};
use crate::cluster::ClusterControl;
use crate::error::{Error, Result};
use crate::model::DatabaseKind;
use crate::rpc::RpcClient;
use crate::settings::{DatabaseSettings, TimeoutSettings};

pub struct GraphQuiescer {
    rpc: RpcClient,
    cluster: Arc<dyn ClusterControl>,
    group: GroupRef,
    data_mount: String,
    iops_limit: u32,
    checkpoint_attempts: u32,
    checkpoint_spacing: Duration,
    max_raft_lag: u64,
    safety_net: Duration,
}

impl GraphQuiescer {
    pub fn new(
        rpc: RpcClient,
        cluster: Arc<dyn ClusterControl>,
        group: GroupRef,
        databases: &DatabaseSettings,
        timeouts: &TimeoutSettings,
    ) -> Self {
        Self {
            rpc,
            cluster,
            group,
            data_mount: databases.graph_data_mount.clone(),
            iops_limit: databases.graph_iops_limit,
            checkpoint_attempts: databases.graph_checkpoint_attempts.max(1),
            checkpoint_spacing: Duration::from_secs(databases.graph_checkpoint_spacing_secs),
            max_raft_lag: databases.graph_max_raft_lag,
            safety_net: timeouts.safety_net(),
        }
    }

    /// Multi-node deployments run the database as a raft cluster.
    fn clustered(&self) -> bool {
        self.group.hosts.len() > 1
    }

    async fn set_iops_limit(&self, hosts: &[String], limit: Option<u32>) -> Result<()> {
        self.rpc
            .fan_out::<()>(hosts, &AgentRequest::GraphSetIopsLimit { limit })
            .await
            .complete()?;
        Ok(())
    }

    /// Force a checkpoint on every member, throttled, retrying with the
    /// throttle reset in between.
    async fn checkpoint(&self, hosts: &[String], bracket: &mut Bracket) -> Result<()> {
        let mut attempt = 1;
        loop {
            self.set_iops_limit(hosts, Some(self.iops_limit)).await?;
            bracket.throttled = hosts.to_vec();

            let result = self
                .rpc
                .fan_out::<()>(hosts, &AgentRequest::GraphCheckpoint)
                .await
                .complete();
            match result {
                Ok(_) => {
                    info!(attempt, "Checkpoint complete");
                    return Ok(());
                }
                Err(e) if attempt < self.checkpoint_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.checkpoint_attempts,
                        error = %e,
                        "Checkpoint failed, resetting I/O limit before retrying"
                    );
                    if let Err(reset) = self.set_iops_limit(hosts, None).await {
                        warn!(error = %reset, "Failed to reset checkpoint I/O limit");
                    }
                    bracket.throttled.clear();
                    tokio::time::sleep(self.checkpoint_spacing).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Largest distance between the leader's committed index and a member's.
pub fn raft_lag<'a>(statuses: impl IntoIterator<Item = (&'a String, &'a RaftStatus)>) -> Result<u64> {
    let statuses: Vec<_> = statuses.into_iter().collect();
    let leader = statuses
        .iter()
        .find(|(_, s)| s.role == RaftRole::Leader)
        .ok_or_else(|| Error::InvalidState("graph database cluster has no leader".to_string()))?;
    Ok(statuses
        .iter()
        .map(|(_, s)| leader.1.committed_index.saturating_sub(s.committed_index))
        .max()
        .unwrap_or(0))
}

#[async_trait]
impl Quiescer for GraphQuiescer {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Graph
    }

    #[instrument(skip(self), fields(group = %self.group.group))]
    async fn preflight(&self) -> Result<()> {
        if !self.clustered() {
            return Ok(());
        }
        let hosts = self.group.online_hosts(self.cluster.as_ref()).await?;
        let statuses = self
            .rpc
            .fan_out::<RaftStatus>(&hosts, &AgentRequest::GraphRaftStatus)
            .await
            .complete()?;
        let lag = raft_lag(&statuses)?;
        if lag > self.max_raft_lag {
            return Err(Error::InvalidState(format!(
                "graph database raft lag {} exceeds {}",
                lag, self.max_raft_lag
            )));
        }
        info!(lag, "Raft lag within limit");
        Ok(())
    }

    #[instrument(skip_all, fields(group = %self.group.group))]
    async fn open(&self, bracket: &mut Bracket) -> Result<()> {
        let hosts = self.group.online_hosts(self.cluster.as_ref()).await?;
        if hosts.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} is not online on any system",
                self.group.group
            )));
        }
        bracket.hosts = hosts.clone();

        self.checkpoint(&hosts, bracket).await?;

        if !self.clustered() {
            info!("Single instance, data directory not frozen");
            return Ok(());
        }
        let request = AgentRequest::FsFreeze {
            mount_point: self.data_mount.clone(),
            safety_net_secs: self.safety_net.as_secs(),
        };
        let frozen = self.rpc.fan_out::<()>(&hosts, &request).await;
        bracket.frozen = frozen.replies.keys().cloned().collect();
        frozen.complete()?;
        info!(
            mount = %self.data_mount,
            safety_net_secs = self.safety_net.as_secs(),
            "Data directory frozen"
        );
        Ok(())
    }

    async fn snap(&self, _bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
        snap_luns(luns).await
    }

    #[instrument(skip_all, fields(group = %self.group.group))]
    async fn close(&self, bracket: &Bracket) -> Result<()> {
        let mut first_err = None;
        if !bracket.frozen.is_empty() {
            let request = AgentRequest::FsUnfreeze {
                mount_point: self.data_mount.clone(),
            };
            match self.rpc.fan_out::<()>(&bracket.frozen, &request).await.complete() {
                Ok(_) => info!("Data directory unfrozen"),
                Err(e) => first_err = Some(e),
            }
        }
        if !bracket.throttled.is_empty() {
            if let Err(e) = self.set_iops_limit(&bracket.throttled, None).await {
                warn!(error = %e, "Failed to reset checkpoint I/O limit");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::agent_api::AgentReply;
    use crate::cluster::GroupState;
    use crate::mock::{MockCluster, MockTransport};
    use crate::quiesce::run_bracket;

    const GROUP: &str = "Grp_CS_db_cluster_neo4j_clustered_service";

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("db-{}", i)).collect()
    }

    fn quiescer(transport: Arc<MockTransport>, members: usize) -> GraphQuiescer {
        let cluster = Arc::new(MockCluster::new());
        for host in hosts(members) {
            cluster.set_state("db_cluster", GROUP, &host, GroupState::Online);
        }
        GraphQuiescer::new(
            RpcClient::new(transport, Duration::from_secs(60)),
            cluster,
            GroupRef {
                cluster: "db_cluster".to_string(),
                group: GROUP.to_string(),
                hosts: hosts(members),
            },
            &DatabaseSettings::default(),
            &TimeoutSettings::default(),
        )
    }

    fn status(role: RaftRole, committed_index: u64) -> RaftStatus {
        RaftStatus {
            role,
            committed_index,
        }
    }

    #[test]
    fn test_raft_lag() {
        let mut statuses = BTreeMap::new();
        statuses.insert("db-1".to_string(), status(RaftRole::Follower, 900));
        statuses.insert("db-2".to_string(), status(RaftRole::Leader, 1000));
        statuses.insert("db-3".to_string(), status(RaftRole::Follower, 1000));
        assert_eq!(raft_lag(&statuses).unwrap(), 100);

        statuses.remove("db-2");
        assert!(matches!(raft_lag(&statuses), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_preflight_fails_on_lag() {
        let transport = Arc::new(MockTransport::new());
        transport.reply("db-1", "graphdb/raft_status", AgentReply::success(status(RaftRole::Leader, 60_001)));
        transport.reply("db-2", "graphdb/raft_status", AgentReply::success(status(RaftRole::Follower, 1)));
        let err = quiescer(transport, 2).preflight().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_retries_reset_throttle() {
        let transport = Arc::new(MockTransport::new());
        transport.reply_all("graphdb/set_iops_limit", AgentReply::success(()));
        transport.reply_all("fs/freeze", AgentReply::success(()));
        transport.reply_all("fs/unfreeze", AgentReply::success(()));
        transport.reply_sequence(
            "db-1",
            "graphdb/checkpoint",
            vec![AgentReply::failure("checkpoint busy"), AgentReply::success(())],
        );
        transport.reply("db-2", "graphdb/checkpoint", AgentReply::success(()));

        let q = quiescer(transport.clone(), 2);
        run_bracket(&q, &[], Duration::from_secs(600)).await.unwrap();

        let limits: Vec<Option<u32>> = transport
            .requests("db-1")
            .into_iter()
            .filter_map(|r| match r {
                AgentRequest::GraphSetIopsLimit { limit } => Some(limit),
                _ => None,
            })
            .collect();
        assert_eq!(limits, vec![Some(5000), None, Some(5000), None]);
    }

    #[tokio::test]
    async fn test_single_instance_skips_freeze() {
        let transport = Arc::new(MockTransport::new());
        transport.reply_all("graphdb/set_iops_limit", AgentReply::success(()));
        transport.reply_all("graphdb/checkpoint", AgentReply::success(()));

        let q = quiescer(transport.clone(), 1);
        run_bracket(&q, &[], Duration::from_secs(600)).await.unwrap();
        assert!(transport
            .requests("db-1")
            .iter()
            .all(|r| !matches!(r, AgentRequest::FsFreeze { .. })));
    }
}
