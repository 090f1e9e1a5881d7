//! # Agent Errors
//!
//! Every failure an action can hit. Errors travel back to the coordinator
//! as the `error` string of a failed reply, prefixed with their code so a
//! log line on either side identifies the failing stage:
//!
//! | Range     | Category                    |
//! |-----------|-----------------------------|
//! | 1000-1999 | Request errors              |
//! | 2000-2999 | Tool execution errors       |
//! | 3000-3999 | Filesystem freeze errors    |
//! | 4000-4999 | Tool output errors          |

use std::fmt;

use snapset_core::cmd::CmdError;
use thiserror::Error;

/// Error code type alias
pub type ErrorCode = u16;

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request for {body} was posted to /v1/agents/{path}")]
    RouteMismatch { path: String, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Command(#[from] CmdError),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("{mount_point} is not a mounted filesystem")]
    NotMounted { mount_point: String },

    #[error("could not parse {tool} output: {message}")]
    BadOutput { tool: String, message: String },
}

/// Error category for grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Request,
    Execution,
    Freeze,
    Output,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Request => write!(f, "Request"),
            ErrorCategory::Execution => write!(f, "Execution"),
            ErrorCategory::Freeze => write!(f, "Freeze"),
            ErrorCategory::Output => write!(f, "Output"),
        }
    }
}

impl AgentError {
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn bad_output(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadOutput {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RouteMismatch { .. } => 1001,
            Self::InvalidRequest(_) => 1002,
            Self::Command(CmdError::Spawn { .. }) => 2001,
            Self::Command(CmdError::Failed { .. }) => 2002,
            Self::Command(CmdError::Timeout { .. }) => 2003,
            Self::ToolFailed { .. } => 2004,
            Self::NotMounted { .. } => 3001,
            Self::BadOutput { .. } => 4001,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            1000..=1999 => ErrorCategory::Request,
            2000..=2999 => ErrorCategory::Execution,
            3000..=3999 => ErrorCategory::Freeze,
            _ => ErrorCategory::Output,
        }
    }

    /// The `error` text of a failed reply.
    pub fn to_reply_message(&self) -> String {
        format!("SNAG-{:04}: {}", self.code(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_categories() {
        let err = AgentError::NotMounted {
            mount_point: "/data".to_string(),
        };
        assert_eq!(err.code(), 3001);
        assert_eq!(err.category(), ErrorCategory::Freeze);
        assert_eq!(
            err.to_reply_message(),
            "SNAG-3001: /data is not a mounted filesystem"
        );

        let err = AgentError::Command(CmdError::Timeout {
            command: "lvs".to_string(),
            secs: 5,
        });
        assert_eq!(err.category(), ErrorCategory::Execution);
        assert!(err.to_reply_message().starts_with("SNAG-2003"));
    }
}
