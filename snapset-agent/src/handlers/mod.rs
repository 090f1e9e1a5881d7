//! Action handlers.
//!
//! [`ActionHandler`] routes each [`AgentRequest`] to the handler for its
//! agent and wraps the outcome in an [`AgentReply`]. Every external tool runs
//! through the shared [`CommandRunner`] with a per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use snapset_core::agent_api::{AgentReply, AgentRequest};
use snapset_core::cmd::{CmdError, CmdOutput, CommandLine, CommandRunner};
use tracing::{debug, error, info};

mod directory;
mod exec;
mod freeze;
mod graphdb;
mod lvm;

use freeze::FreezeRegistry;

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

/// Runs agent actions against the local host.
pub struct ActionHandler {
    config: Arc<AgentConfig>,
    runner: Arc<dyn CommandRunner>,
    frozen: FreezeRegistry,
}

impl ActionHandler {
    pub fn new(config: Arc<AgentConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            frozen: FreezeRegistry::default(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Mount points currently frozen by this agent.
    pub async fn frozen(&self) -> Vec<String> {
        self.frozen.mount_points().await
    }

    /// Thaw everything this agent froze. Used on shutdown.
    pub async fn thaw_all(&self) {
        for mount_point in self.frozen().await {
            if let Err(e) = freeze::unfreeze(self, &mount_point).await {
                error!(mount_point = %mount_point, error = %e, "Failed to thaw on shutdown");
            }
        }
    }

    /// Handle one request and build its reply.
    pub async fn handle(&self, request: AgentRequest) -> AgentReply {
        let label = request.label();
        debug!(action = %label, "Handling request");

        let result = match request {
            // =========================================================================
            // LVM
            // =========================================================================
            AgentRequest::LvmList { tag } => reply(lvm::list(self, tag.as_deref()).await),
            AgentRequest::LvmSnapshot {
                origin_path,
                name,
                tag,
                percent,
            } => reply(lvm::snapshot(self, &origin_path, &name, &tag, percent).await),
            AgentRequest::LvmRemove { path } => reply(lvm::remove(self, &path).await),
            AgentRequest::LvmMerge { path } => reply(lvm::merge(self, &path).await),

            // =========================================================================
            // Filesystem freeze
            // =========================================================================
            AgentRequest::FsFreeze {
                mount_point,
                safety_net_secs,
            } => reply(freeze::freeze(self, &mount_point, safety_net_secs).await),
            AgentRequest::FsUnfreeze { mount_point } => {
                reply(freeze::unfreeze(self, &mount_point).await)
            }

            // =========================================================================
            // Command execution
            // =========================================================================
            AgentRequest::Exec {
                command,
                user,
                timeout_secs,
            } => reply(exec::run(self, command, user, timeout_secs).await),

            // =========================================================================
            // Graph database
            // =========================================================================
            AgentRequest::GraphSetIopsLimit { limit } => {
                reply(graphdb::set_iops_limit(self, limit).await)
            }
            AgentRequest::GraphCheckpoint => reply(graphdb::checkpoint(self).await),
            AgentRequest::GraphRaftStatus => reply(graphdb::raft_status(self).await),

            // =========================================================================
            // Directory server
            // =========================================================================
            AgentRequest::DirectoryBackup {
                backup_dir,
                log_dir,
            } => reply(directory::backup(self, &backup_dir, &log_dir).await),
            AgentRequest::DirectoryCleanup {
                backup_dir,
                log_dir,
            } => reply(directory::cleanup(&backup_dir, &log_dir).await),
            AgentRequest::DirectoryRestore { backup_dir } => {
                reply(directory::restore(self, &backup_dir).await)
            }
        };

        if result.ok {
            info!(action = %label, "Action completed");
        }
        result
    }

    /// Run `cmd`, killing it after `secs`. Output is returned whatever the
    /// exit status.
    async fn run(&self, cmd: &CommandLine, secs: u64) -> AgentResult<CmdOutput> {
        let output = tokio::time::timeout(Duration::from_secs(secs), self.runner.output(cmd))
            .await
            .map_err(|_| CmdError::Timeout {
                command: cmd.to_string(),
                secs,
            })??;
        Ok(output)
    }

    /// Run `cmd` and fail unless it exits zero.
    async fn run_success(&self, cmd: &CommandLine, secs: u64) -> AgentResult<CmdOutput> {
        let output = self.run(cmd, secs).await?;
        if !output.success() {
            return Err(CmdError::Failed {
                command: cmd.to_string(),
                output,
            }
            .into());
        }
        Ok(output)
    }
}

fn reply<T: Serialize>(result: AgentResult<T>) -> AgentReply {
    match result {
        Ok(data) => AgentReply::success(data),
        Err(e) => {
            error!(code = e.code(), category = %e.category(), error = %e, "Action failed");
            AgentReply::failure(e.to_reply_message())
        }
    }
}

/// Rejects a request whose body names a different agent or action than the
/// URL it was posted to.
pub fn check_route(agent: &str, action: &str, request: &AgentRequest) -> AgentResult<()> {
    if request.agent() == agent && request.action() == action {
        return Ok(());
    }
    Err(AgentError::RouteMismatch {
        path: format!("{}/{}", agent, action),
        body: request.label(),
    })
}
