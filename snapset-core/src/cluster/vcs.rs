//! Cluster manager commands run on a cluster member through its agent.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{ClusterControl, FreezeState, GroupState, GroupStates};
use crate::cmd::CommandLine;
use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use crate::settings::TimeoutSettings;

const HAGRP: &str = "/opt/VRTSvcs/bin/hagrp";
const HACONF: &str = "/opt/VRTSvcs/bin/haconf";

pub struct VcsCluster {
    rpc: RpcClient,
    /// Member hostnames per cluster name; commands go to the first that answers.
    members: BTreeMap<String, Vec<String>>,
    transition_timeout: Duration,
    poll: Duration,
}

impl VcsCluster {
    pub fn new(
        rpc: RpcClient,
        members: BTreeMap<String, Vec<String>>,
        timeouts: &TimeoutSettings,
    ) -> Self {
        Self {
            rpc,
            members,
            transition_timeout: timeouts.cluster_transition(),
            poll: timeouts.state_poll(),
        }
    }

    async fn run(&self, cluster: &str, program: &str, args: &[&str]) -> Result<String> {
        let hosts = self
            .members
            .get(cluster)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Cluster(format!("no members known for cluster {}", cluster)))?;

        let mut last = None;
        for host in hosts {
            let cmd = CommandLine::new(program).args(args.iter().copied());
            match self.rpc.exec(host, cmd).await {
                Ok(out) => return Ok(out.stdout),
                Err(e @ (Error::RpcTimeout { .. } | Error::RpcUnreachable { .. })) => {
                    warn!(host = %host, error = %e, "Cluster member unreachable, trying next");
                    last = Some(e);
                }
                Err(Error::Remote { message, .. }) => {
                    return Err(Error::Cluster(format!("{} {}: {}", program, args.join(" "), message)))
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Cluster(format!("no member of {} answered", cluster))))
    }

    async fn value(&self, cluster: &str, group: &str, attribute: &str) -> Result<String> {
        let out = self
            .run(cluster, HAGRP, &["-value", group, attribute])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Run `hagrp args` with the cluster configuration writable. A
    /// configuration this call opened is made read-only again whatever the
    /// outcome; one that was already writable is left as found.
    async fn with_writable_config(&self, cluster: &str, args: &[&str]) -> Result<()> {
        let opened = match self.run(cluster, HACONF, &["-makerw"]).await {
            Ok(_) => true,
            Err(e) if e.to_string().contains("already writable") => {
                debug!("Cluster configuration already writable");
                false
            }
            Err(e) => return Err(e),
        };
        let changed = self.run(cluster, HAGRP, args).await;
        if opened {
            let closed = self.run(cluster, HACONF, &["-dump", "-makero"]).await;
            changed?;
            closed?;
        } else {
            changed?;
        }
        Ok(())
    }
}

/// Rows of `hagrp -state <group>`: `<group> State <system> |<STATE>|`.
fn parse_states(group: &str, text: &str) -> GroupStates {
    text.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [g, "State", system, value, ..] if *g == group => {
                    Some((system.to_string(), GroupState::parse(value)))
                }
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl ClusterControl for VcsCluster {
    async fn state_of(&self, cluster: &str, group: &str) -> Result<GroupStates> {
        let out = self.run(cluster, HAGRP, &["-state", group]).await?;
        let states = parse_states(group, &out);
        debug!(group = %group, states = ?states, "Group state");
        Ok(states)
    }

    async fn frozen(&self, cluster: &str, group: &str) -> Result<FreezeState> {
        Ok(FreezeState {
            persistent: self.value(cluster, group, "Frozen").await? == "1",
            temporary: self.value(cluster, group, "TFrozen").await? == "1",
        })
    }

    #[instrument(skip(self))]
    async fn freeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()> {
        let current = self.frozen(cluster, group).await?;
        if (persistent && current.persistent) || (!persistent && current.temporary) {
            debug!("Group already frozen");
            return Ok(());
        }
        if persistent {
            self.with_writable_config(cluster, &["-freeze", group, "-persistent"])
                .await?;
        } else {
            self.run(cluster, HAGRP, &["-freeze", group]).await?;
        }
        info!("Group frozen");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unfreeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()> {
        let current = self.frozen(cluster, group).await?;
        if (persistent && !current.persistent) || (!persistent && !current.temporary) {
            debug!("Group not frozen");
            return Ok(());
        }
        if persistent {
            self.with_writable_config(cluster, &["-unfreeze", group, "-persistent"])
                .await?;
        } else {
            self.run(cluster, HAGRP, &["-unfreeze", group]).await?;
        }
        info!("Group unfrozen");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn offline(&self, cluster: &str, group: &str, system: &str) -> Result<()> {
        self.run(cluster, HAGRP, &["-offline", group, "-sys", system])
            .await?;
        self.wait_for_state(cluster, group, system, GroupState::Offline, self.transition_timeout)
            .await?;
        info!("Group offline");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn online(&self, cluster: &str, group: &str, system: &str) -> Result<()> {
        self.run(cluster, HAGRP, &["-online", group, "-sys", system])
            .await?;
        self.wait_for_state(cluster, group, system, GroupState::Online, self.transition_timeout)
            .await?;
        info!("Group online");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn switch(&self, cluster: &str, group: &str, from: &str, to: &str) -> Result<()> {
        let states = self.state_of(cluster, group).await?;
        if states.get(from) != Some(&GroupState::Online) {
            return Err(Error::Cluster(format!("{} is not online on {}", group, from)));
        }
        self.run(cluster, HAGRP, &["-switch", group, "-to", to]).await?;
        self.wait_for_state(cluster, group, to, GroupState::Online, self.transition_timeout)
            .await?;
        info!("Group switched");
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}
