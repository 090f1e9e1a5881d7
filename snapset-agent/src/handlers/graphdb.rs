//! Graph database actions through `cypher-shell`.

use snapset_core::agent_api::{RaftRole, RaftStatus};
use snapset_core::cmd::CommandLine;
use tracing::info;

use super::ActionHandler;
use crate::error::{AgentError, AgentResult};

const CHECKPOINT_QUERY: &str = "CALL db.checkpoint();";
const IOPS_SETTING: &str = "dbms.checkpoint.iops.limit";

fn cypher(handler: &ActionHandler, query: &str) -> CommandLine {
    let graph = &handler.config().graphdb;
    let mut cmd = CommandLine::new(&graph.cypher_shell).args([
        "-a",
        graph.address.as_str(),
        "-u",
        graph.user.as_str(),
    ]);
    if !graph.password.is_empty() {
        cmd = cmd.args(["-p", graph.password.as_str()]);
    }
    cmd.args(["--format", "plain", query])
}

/// Run `query` and return the value lines of the plain output, header
/// dropped.
async fn query(handler: &ActionHandler, query: &str) -> AgentResult<Vec<String>> {
    let cmd = cypher(handler, query);
    let out = handler
        .run_success(&cmd, handler.config().graphdb.timeout_secs)
        .await?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip(1)
        .map(|l| l.trim_matches('"').to_string())
        .collect())
}

fn first_value(rows: &[String], what: &str) -> AgentResult<String> {
    rows.first()
        .cloned()
        .ok_or_else(|| AgentError::bad_output("cypher-shell", format!("no {} returned", what)))
}

pub(super) async fn set_iops_limit(handler: &ActionHandler, limit: Option<u32>) -> AgentResult<()> {
    // An empty value resets the setting to its configured default.
    let value = limit.map(|l| l.to_string()).unwrap_or_default();
    let statement = format!(
        "CALL dbms.setConfigValue(\"{}\", \"{}\");",
        IOPS_SETTING, value
    );
    query(handler, &statement).await?;
    info!(limit = ?limit, "Checkpoint IOPS limit set");
    Ok(())
}

pub(super) async fn checkpoint(handler: &ActionHandler) -> AgentResult<()> {
    query(handler, CHECKPOINT_QUERY).await?;
    info!("Checkpoint completed");
    Ok(())
}

pub(super) async fn raft_status(handler: &ActionHandler) -> AgentResult<RaftStatus> {
    let graph = &handler.config().graphdb;
    let role = first_value(&query(handler, &graph.role_query).await?, "role")?;
    let index = first_value(&query(handler, &graph.index_query).await?, "committed index")?;

    let committed_index = index.parse::<u64>().map_err(|e| {
        AgentError::bad_output("cypher-shell", format!("committed index '{}': {}", index, e))
    })?;
    Ok(RaftStatus {
        role: parse_role(&role),
        committed_index,
    })
}

fn parse_role(role: &str) -> RaftRole {
    match role.to_ascii_uppercase().as_str() {
        "LEADER" => RaftRole::Leader,
        "FOLLOWER" => RaftRole::Follower,
        "READ_REPLICA" | "READ-REPLICA" => RaftRole::ReadReplica,
        _ => RaftRole::Unknown,
    }
}
