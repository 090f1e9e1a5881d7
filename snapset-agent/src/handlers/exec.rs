//! Command execution.
//!
//! The exit status is part of the reply, not an error: only a command that
//! cannot be started or that runs past its timeout fails the action.

use snapset_core::cmd::{CmdOutput, CommandLine};
use tracing::{info, warn};

use super::ActionHandler;
use crate::error::{AgentError, AgentResult};

pub(super) async fn run(
    handler: &ActionHandler,
    command: CommandLine,
    user: Option<String>,
    timeout_secs: Option<u64>,
) -> AgentResult<CmdOutput> {
    if command.program.is_empty() {
        return Err(AgentError::InvalidRequest("empty command".to_string()));
    }
    let timeout = handler.config().exec_timeout(timeout_secs);
    let cmd = match user.as_deref() {
        Some(user) if !user.is_empty() => as_user(handler, user, command),
        _ => command,
    };

    info!(command = %cmd, timeout_secs = timeout, "Executing command");
    let out = handler.run(&cmd, timeout).await?;
    if out.success() {
        info!(command = %cmd, "Command completed");
    } else {
        warn!(command = %cmd, exit_code = out.status, "Command exited non-zero");
    }
    Ok(out)
}

/// Wrap `command` in `runuser`; the environment is passed through.
fn as_user(handler: &ActionHandler, user: &str, command: CommandLine) -> CommandLine {
    let mut wrapped = CommandLine::new(&handler.config().exec.runuser)
        .args(["-u", user, "--"])
        .arg(command.program)
        .args(command.args);
    wrapped.env = command.env;
    wrapped
}

#[cfg(test)]
mod tests {
    use super::super::test_support::handler;
    use snapset_core::agent_api::AgentRequest;
    use snapset_core::cmd::{CmdOutput, CommandLine};

    #[tokio::test]
    async fn test_non_zero_exit_is_reported_not_failed() {
        let (handler, runner) = handler();
        runner.on("mysqladmin", CmdOutput::failed(1, "Access denied"));

        let reply = handler
            .handle(AgentRequest::Exec {
                command: CommandLine::new("mysqladmin").arg("flush-tables"),
                user: None,
                timeout_secs: Some(30),
            })
            .await;
        let out: CmdOutput = reply.decode().unwrap();
        assert_eq!(out.status, 1);
        assert_eq!(out.stderr, "Access denied");
    }

    #[tokio::test]
    async fn test_runs_as_user() {
        let (handler, runner) = handler();
        runner.on("runuser", CmdOutput::ok("done\n"));

        let reply = handler
            .handle(AgentRequest::Exec {
                command: CommandLine::new("/opt/db/bin/flush").arg("--all"),
                user: Some("dbadmin".to_string()),
                timeout_secs: None,
            })
            .await;
        assert!(reply.ok);
        assert_eq!(
            runner.calls(),
            vec!["/sbin/runuser -u dbadmin -- /opt/db/bin/flush --all"]
        );
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let (handler, runner) = handler();
        let reply = handler
            .handle(AgentRequest::Exec {
                command: CommandLine::new(""),
                user: None,
                timeout_secs: None,
            })
            .await;
        assert!(!reply.ok);
        assert!(runner.calls().is_empty());
    }
}
