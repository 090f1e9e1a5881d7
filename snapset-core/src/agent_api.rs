//! Wire types of the node agent.
//!
//! Requests are POSTed as JSON to `/v1/agents/{agent}/{action}`; every reply
//! is an [`AgentReply`] envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cmd::CommandLine;

/// One action on a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentRequest {
    /// List logical volumes, optionally only those carrying `tag`.
    LvmList { tag: Option<String> },
    LvmSnapshot {
        origin_path: String,
        name: String,
        tag: String,
        percent: u8,
    },
    LvmRemove { path: String },
    /// Merge a snapshot back into its origin.
    LvmMerge { path: String },

    FsFreeze {
        mount_point: String,
        /// Thaw automatically after this many seconds unless unfrozen first.
        safety_net_secs: u64,
    },
    FsUnfreeze { mount_point: String },

    Exec {
        command: CommandLine,
        /// Run as this user instead of the agent's.
        user: Option<String>,
        timeout_secs: Option<u64>,
    },

    /// Throttle checkpoint I/O; `None` restores the database default.
    GraphSetIopsLimit { limit: Option<u32> },
    GraphCheckpoint,
    GraphRaftStatus,

    DirectoryBackup { backup_dir: String, log_dir: String },
    DirectoryCleanup { backup_dir: String, log_dir: String },
    DirectoryRestore { backup_dir: String },
}

impl AgentRequest {
    /// Agent that serves the request.
    pub fn agent(&self) -> &'static str {
        match self {
            Self::LvmList { .. }
            | Self::LvmSnapshot { .. }
            | Self::LvmRemove { .. }
            | Self::LvmMerge { .. } => "lvm",
            Self::FsFreeze { .. } | Self::FsUnfreeze { .. } => "fs",
            Self::Exec { .. } => "exec",
            Self::GraphSetIopsLimit { .. } | Self::GraphCheckpoint | Self::GraphRaftStatus => {
                "graphdb"
            }
            Self::DirectoryBackup { .. }
            | Self::DirectoryCleanup { .. }
            | Self::DirectoryRestore { .. } => "directory",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::LvmList { .. } => "list",
            Self::LvmSnapshot { .. } => "snapshot",
            Self::LvmRemove { .. } => "remove",
            Self::LvmMerge { .. } => "merge",
            Self::FsFreeze { .. } => "freeze",
            Self::FsUnfreeze { .. } => "unfreeze",
            Self::Exec { .. } => "run",
            Self::GraphSetIopsLimit { .. } => "set_iops_limit",
            Self::GraphCheckpoint => "checkpoint",
            Self::GraphRaftStatus => "raft_status",
            Self::DirectoryBackup { .. } => "backup",
            Self::DirectoryCleanup { .. } => "cleanup",
            Self::DirectoryRestore { .. } => "restore",
        }
    }

    /// `agent/action`, for logs.
    pub fn label(&self) -> String {
        format!("{}/{}", self.agent(), self.action())
    }
}

/// Reply envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub ok: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentReply {
    pub fn success<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                ok: true,
                data,
                error: None,
            },
            Err(e) => Self::failure(format!("unserializable reply: {}", e)),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, String> {
        if !self.ok {
            return Err(self.error.unwrap_or_else(|| "unknown agent error".to_string()));
        }
        serde_json::from_value(self.data).map_err(|e| format!("bad agent reply: {}", e))
    }
}

/// Raft role and committed index reported by one graph database member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub committed_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Leader,
    Follower,
    ReadReplica,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = AgentRequest::FsFreeze {
            mount_point: "/data".to_string(),
            safety_net_secs: 60,
        };
        assert_eq!(req.label(), "fs/freeze");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "fs_freeze");
        assert_eq!(json["safety_net_secs"], 60);
        let back: AgentRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_reply_decode() {
        let reply = AgentReply::success(RaftStatus {
            role: RaftRole::Leader,
            committed_index: 10,
        });
        let status: RaftStatus = reply.decode().unwrap();
        assert_eq!(status.role, RaftRole::Leader);

        let err = AgentReply::failure("boom").decode::<()>().unwrap_err();
        assert_eq!(err, "boom");
    }
}
