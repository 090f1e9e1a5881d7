//! Directory server backup, cleanup and restore.

use std::io::ErrorKind;
use std::path::Path;

use snapset_core::cmd::CommandLine;
use tracing::info;

use super::ActionHandler;
use crate::error::{AgentError, AgentResult};

fn require_absolute(dir: &str) -> AgentResult<()> {
    let path = Path::new(dir);
    if path.is_absolute() && path.parent().is_some() {
        Ok(())
    } else {
        Err(AgentError::InvalidRequest(format!(
            "'{}' is not an absolute directory below /",
            dir
        )))
    }
}

pub(super) async fn backup(
    handler: &ActionHandler,
    backup_dir: &str,
    log_dir: &str,
) -> AgentResult<()> {
    require_absolute(backup_dir)?;
    require_absolute(log_dir)?;
    let config = &handler.config().directory;
    let cmd = CommandLine::new(&config.backup_script).args([backup_dir, log_dir]);
    handler.run_success(&cmd, config.timeout_secs).await?;
    info!(backup_dir = %backup_dir, "Directory backup written");
    Ok(())
}

/// Delete the backup and log directories. Missing ones are fine.
pub(super) async fn cleanup(backup_dir: &str, log_dir: &str) -> AgentResult<()> {
    for dir in [backup_dir, log_dir] {
        require_absolute(dir)?;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => info!(dir = %dir, "Removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::tool_failed("remove", format!("{}: {}", dir, e))),
        }
    }
    Ok(())
}

pub(super) async fn restore(handler: &ActionHandler, backup_dir: &str) -> AgentResult<()> {
    require_absolute(backup_dir)?;
    let config = &handler.config().directory;
    let cmd = CommandLine::new(&config.restore_script).arg(backup_dir);
    handler.run_success(&cmd, config.timeout_secs).await?;
    info!(backup_dir = %backup_dir, "Directory restored from backup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::handler;
    use snapset_core::agent_api::AgentRequest;
    use snapset_core::cmd::CmdOutput;

    #[tokio::test]
    async fn test_backup_runs_script() {
        let (handler, runner) = handler();
        runner.on("opendj_backup", CmdOutput::ok(""));

        let reply = handler
            .handle(AgentRequest::DirectoryBackup {
                backup_dir: "/ericsson/opendj_backup/s1".to_string(),
                log_dir: "/ericsson/opendj_backup/s1_logs".to_string(),
            })
            .await;
        assert!(reply.ok, "{:?}", reply.error);
        assert_eq!(
            runner.calls(),
            vec!["/opt/opendj/bin/opendj_backup.sh /ericsson/opendj_backup/s1 /ericsson/opendj_backup/s1_logs"]
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_dirs() {
        let root = tempfile::tempdir().unwrap();
        let backup = root.path().join("s1");
        std::fs::create_dir_all(backup.join("userRoot")).unwrap();
        let logs = root.path().join("s1_logs");

        let (handler, _runner) = handler();
        let reply = handler
            .handle(AgentRequest::DirectoryCleanup {
                backup_dir: backup.display().to_string(),
                log_dir: logs.display().to_string(),
            })
            .await;
        assert!(reply.ok, "{:?}", reply.error);
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_relative_dir_rejected() {
        let (handler, runner) = handler();
        let reply = handler
            .handle(AgentRequest::DirectoryRestore {
                backup_dir: "backups/s1".to_string(),
            })
            .await;
        assert!(!reply.ok);
        assert!(runner.calls().is_empty());
    }
}
