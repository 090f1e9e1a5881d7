//! Filesystem freeze and thaw.
//!
//! A freeze arms a safety net: unless the same mount point is unfrozen first,
//! it is thawed automatically once the requested delay has passed. A
//! coordinator that dies between freeze and unfreeze therefore cannot leave
//! a database filesystem blocked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use snapset_core::cmd::{CommandLine, CommandRunner};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::lvm::read_mounts;
use super::ActionHandler;
use crate::error::{AgentError, AgentResult};

const FREEZE_TIMEOUT_SECS: u64 = 60;

/// Mount points frozen by this agent, each with its pending auto-thaw.
#[derive(Clone, Default)]
pub struct FreezeRegistry {
    inner: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl FreezeRegistry {
    pub async fn mount_points(&self) -> Vec<String> {
        let mut points: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        points.sort();
        points
    }

    /// Record `mount_point` as frozen, replacing any earlier auto-thaw.
    async fn arm(&self, mount_point: &str, auto_thaw: JoinHandle<()>) {
        let previous = self
            .inner
            .lock()
            .await
            .insert(mount_point.to_string(), auto_thaw);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Forget `mount_point`, cancelling its auto-thaw. True if it was frozen.
    async fn disarm(&self, mount_point: &str) -> bool {
        match self.inner.lock().await.remove(mount_point) {
            Some(auto_thaw) => {
                auto_thaw.abort();
                true
            }
            None => false,
        }
    }
}

fn fsfreeze(handler: &ActionHandler, flag: &str, mount_point: &str) -> CommandLine {
    CommandLine::new(&handler.config().freeze.fsfreeze).args([flag, mount_point])
}

pub(super) async fn freeze(
    handler: &ActionHandler,
    mount_point: &str,
    safety_net_secs: u64,
) -> AgentResult<()> {
    let max = handler.config().freeze.max_safety_net_secs;
    if safety_net_secs == 0 || safety_net_secs > max {
        return Err(AgentError::InvalidRequest(format!(
            "safety net of {}s is outside 1..={}s",
            safety_net_secs, max
        )));
    }

    let mounted = read_mounts(handler)
        .await
        .iter()
        .any(|m| m.mount_point == mount_point);
    if !mounted {
        return Err(AgentError::NotMounted {
            mount_point: mount_point.to_string(),
        });
    }

    if handler.frozen.mount_points().await.iter().any(|m| m == mount_point) {
        info!(mount_point = %mount_point, "Already frozen, re-arming auto-thaw");
    } else {
        let cmd = fsfreeze(handler, "--freeze", mount_point);
        handler.run_success(&cmd, FREEZE_TIMEOUT_SECS).await?;
    }

    let auto_thaw = spawn_auto_thaw(
        handler.runner.clone(),
        handler.frozen.clone(),
        fsfreeze(handler, "--unfreeze", mount_point),
        mount_point.to_string(),
        safety_net_secs,
    );
    handler.frozen.arm(mount_point, auto_thaw).await;

    info!(
        mount_point = %mount_point,
        safety_net_secs = safety_net_secs,
        "Filesystem frozen"
    );
    Ok(())
}

pub(super) async fn unfreeze(handler: &ActionHandler, mount_point: &str) -> AgentResult<()> {
    let was_frozen = handler.frozen.disarm(mount_point).await;
    let cmd = fsfreeze(handler, "--unfreeze", mount_point);
    let out = handler.run(&cmd, FREEZE_TIMEOUT_SECS).await?;

    if out.success() {
        info!(mount_point = %mount_point, "Filesystem thawed");
        return Ok(());
    }
    if !was_frozen {
        // fsfreeze refuses to thaw a filesystem that is not frozen.
        warn!(
            mount_point = %mount_point,
            stderr = %out.stderr.trim(),
            "Filesystem was not frozen"
        );
        return Ok(());
    }
    Err(AgentError::tool_failed("fsfreeze", out.combined().trim()))
}

/// Thaw `mount_point` after `secs` unless cancelled first.
fn spawn_auto_thaw(
    runner: Arc<dyn CommandRunner>,
    registry: FreezeRegistry,
    thaw: CommandLine,
    mount_point: String,
    secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;

        // Forget the entry first so an unfreeze arriving now sees it thawed.
        registry.inner.lock().await.remove(&mount_point);
        warn!(mount_point = %mount_point, "Safety net expired, thawing filesystem");
        match runner.output(&thaw).await {
            Ok(out) if out.success() => info!(mount_point = %mount_point, "Auto-thaw completed"),
            Ok(out) => error!(
                mount_point = %mount_point,
                stderr = %out.stderr.trim(),
                "Auto-thaw failed"
            ),
            Err(e) => error!(mount_point = %mount_point, error = %e, "Auto-thaw failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::handler_with;
    use crate::config::AgentConfig;
    use snapset_core::agent_api::AgentRequest;
    use snapset_core::cmd::CmdOutput;

    fn config(dir: &tempfile::TempDir) -> AgentConfig {
        let path = dir.path().join("mounts");
        std::fs::write(&path, "/dev/mapper/vg_db-data /data xfs rw 0 0\n").unwrap();
        let mut config = AgentConfig::default();
        config.lvm.mounts_file = path.display().to_string();
        config
    }

    fn freeze_request(secs: u64) -> AgentRequest {
        AgentRequest::FsFreeze {
            mount_point: "/data".to_string(),
            safety_net_secs: secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_net_thaws() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config(&dir));
        runner.on("fsfreeze", CmdOutput::ok(""));

        assert!(handler.handle(freeze_request(60)).await.ok);
        assert_eq!(handler.frozen().await, vec!["/data"]);

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(handler.frozen().await.is_empty());
        assert_eq!(
            runner.calls(),
            vec![
                "/sbin/fsfreeze --freeze /data",
                "/sbin/fsfreeze --unfreeze /data"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfreeze_cancels_safety_net() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config(&dir));
        runner.on("fsfreeze", CmdOutput::ok(""));

        assert!(handler.handle(freeze_request(60)).await.ok);
        let reply = handler
            .handle(AgentRequest::FsUnfreeze {
                mount_point: "/data".to_string(),
            })
            .await;
        assert!(reply.ok);

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        tokio::task::yield_now().await;

        let thaws = runner
            .calls()
            .iter()
            .filter(|c| c.contains("--unfreeze"))
            .count();
        assert_eq!(thaws, 1);
    }

    #[tokio::test]
    async fn test_refreeze_does_not_call_fsfreeze_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config(&dir));
        runner.on("fsfreeze", CmdOutput::ok(""));

        assert!(handler.handle(freeze_request(60)).await.ok);
        assert!(handler.handle(freeze_request(60)).await.ok);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_freeze_rejects_unmounted_path() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config(&dir));

        let reply = handler
            .handle(AgentRequest::FsFreeze {
                mount_point: "/srv".to_string(),
                safety_net_secs: 60,
            })
            .await;
        assert!(!reply.ok);
        assert!(reply.error.unwrap().starts_with("SNAG-3001"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unfreeze_of_thawed_filesystem_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config(&dir));
        runner.on(
            "fsfreeze",
            CmdOutput::failed(1, "fsfreeze: /data: unfreeze failed: Invalid argument"),
        );

        let reply = handler
            .handle(AgentRequest::FsUnfreeze {
                mount_point: "/data".to_string(),
            })
            .await;
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn test_safety_net_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _runner) = handler_with(config(&dir));
        assert!(!handler.handle(freeze_request(0)).await.ok);
        assert!(!handler.handle(freeze_request(100_000)).await.ok);
    }
}
