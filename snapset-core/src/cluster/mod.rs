//! Cluster orchestration.
//!
//! Service-group state discovery and controlled transitions. Every
//! transition is followed by a wait for the requested state.

mod vcs;

pub use vcs::VcsCluster;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// State of a service group on one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Online,
    Offline,
    Partial,
    Faulted,
    Unknown,
}

impl GroupState {
    /// Parse a cluster manager value such as `|ONLINE|` or `|OFFLINE|FAULTED|`.
    pub fn parse(value: &str) -> Self {
        let flags: Vec<&str> = value
            .split('|')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect();
        if flags.iter().any(|f| f.eq_ignore_ascii_case("FAULTED")) {
            Self::Faulted
        } else if flags.iter().any(|f| f.eq_ignore_ascii_case("PARTIAL")) {
            Self::Partial
        } else if flags.iter().any(|f| f.eq_ignore_ascii_case("ONLINE")) {
            Self::Online
        } else if flags.iter().any(|f| f.eq_ignore_ascii_case("OFFLINE")) {
            Self::Offline
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Partial => "partial",
            Self::Faulted => "faulted",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-system state of one group.
pub type GroupStates = BTreeMap<String, GroupState>;

/// Freeze flags of one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeState {
    pub persistent: bool,
    pub temporary: bool,
}

impl FreezeState {
    pub fn any(&self) -> bool {
        self.persistent || self.temporary
    }
}

/// Controls service groups of the clusters in the deployment.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    // =========================================================================
    // Discovery
    // =========================================================================

    /// State of `group` on every system of `cluster`.
    async fn state_of(&self, cluster: &str, group: &str) -> Result<GroupStates>;

    async fn frozen(&self, cluster: &str, group: &str) -> Result<FreezeState>;

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Freeze a group. A persistent freeze holds the configuration write lock
    /// for the duration of the change.
    async fn freeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()>;

    async fn unfreeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()>;

    /// Take `group` offline on `system` and wait until it is.
    async fn offline(&self, cluster: &str, group: &str, system: &str) -> Result<()>;

    /// Bring `group` online on `system` and wait until it is.
    async fn online(&self, cluster: &str, group: &str, system: &str) -> Result<()>;

    /// Move a failover group from one system to another.
    async fn switch(&self, cluster: &str, group: &str, from: &str, to: &str) -> Result<()>;

    /// Poll interval of [`wait_for_state`](Self::wait_for_state).
    fn poll_interval(&self) -> Duration;

    async fn wait_for_state(
        &self,
        cluster: &str,
        group: &str,
        system: &str,
        state: GroupState,
        timeout: Duration,
    ) -> Result<()> {
        let poll = self.poll_interval();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.state_of(cluster, group).await?;
            if current.get(system) == Some(&state) {
                return Ok(());
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(Error::ClusterTransitionTimeout {
                    group: group.to_string(),
                    system: system.to_string(),
                    state: state.to_string(),
                });
            }
            debug!(group = %group, system = %system, wanted = %state, "Waiting for group state");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Systems on which the group is online.
pub fn online_systems(states: &GroupStates) -> Vec<String> {
    states
        .iter()
        .filter(|(_, s)| **s == GroupState::Online)
        .map(|(system, _)| system.clone())
        .collect()
}
