//! Error types for the snapshot coordinator.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::cmd::CmdError;
use crate::executor::StepRecord;

/// Coarse classification of every failure the coordinator can surface.
///
/// Reports and exit codes are keyed on the kind, not on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ModelUnavailable,
    InvalidStateForSnapshot,
    PreflightCapacity,
    VendorTransient,
    VendorFatal,
    RpcTimeout,
    RpcPartial,
    ClusterTransitionTimeout,
    SnapshotInvalid,
    NameConflict,
    MissingExpected,
    OrphanSnapshot,
    NoNamedSet,
    PlanTimeout,
    PlanStopped,
    InvalidUsage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelUnavailable => "model-unavailable",
            Self::InvalidStateForSnapshot => "invalid-state-for-snapshot",
            Self::PreflightCapacity => "preflight-capacity",
            Self::VendorTransient => "vendor-transient",
            Self::VendorFatal => "vendor-fatal",
            Self::RpcTimeout => "rpc-timeout",
            Self::RpcPartial => "rpc-partial",
            Self::ClusterTransitionTimeout => "cluster-transition-timeout",
            Self::SnapshotInvalid => "snapshot-invalid",
            Self::NameConflict => "name-conflict",
            Self::MissingExpected => "missing-expected",
            Self::OrphanSnapshot => "orphan-snapshot",
            Self::NoNamedSet => "no-named-set",
            Self::PlanTimeout => "plan-timeout",
            Self::PlanStopped => "plan-stopped",
            Self::InvalidUsage => "invalid-usage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit codes used by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    PlanFailed = 1,
    InvalidUsage = 2,
    PlanTimeout = 3,
    PlanStopped = 4,
    NoNamedSet = 5,
    InvalidState = 6,
    VendorError = 7,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<ErrorKind> for ExitCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidUsage => ExitCode::InvalidUsage,
            ErrorKind::PlanTimeout => ExitCode::PlanTimeout,
            ErrorKind::PlanStopped => ExitCode::PlanStopped,
            ErrorKind::NoNamedSet => ExitCode::NoNamedSet,
            ErrorKind::InvalidStateForSnapshot => ExitCode::InvalidState,
            ErrorKind::VendorTransient | ErrorKind::VendorFatal => ExitCode::VendorError,
            _ => ExitCode::PlanFailed,
        }
    }
}

/// Details attached to every storage driver failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFault {
    /// Vendor error code, when the CLI reported one.
    pub code: Option<String>,
    /// LUN id, filesystem, cache or volume the call was about.
    pub resource: String,
    /// Whether the same call may succeed if repeated.
    pub retryable: bool,
    pub message: String,
}

impl DriverFault {
    pub fn fatal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            resource: resource.into(),
            retryable: false,
            message: message.into(),
        }
    }

    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            resource: resource.into(),
            retryable: true,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for DriverFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.resource, code, self.message),
            None => write!(f, "{}: {}", self.resource, self.message),
        }
    }
}

/// Errors that can occur while planning or executing snapshot operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The deployment model could not be read after retrying.
    #[error("Deployment model unavailable: {0}")]
    ModelUnavailable(String),

    /// Live cluster state does not allow a consistent snapshot.
    #[error("Invalid state for snapshot: {0}")]
    InvalidState(String),

    /// Pool subscription or rollback cache capacity check failed.
    #[error("Preflight capacity check failed: {0}")]
    PreflightCapacity(String),

    /// A vendor CLI call failed.
    #[error("Vendor error on {0}")]
    Vendor(DriverFault),

    /// No reply from an agent before the deadline.
    #[error("RPC to {host} timed out after {secs}s")]
    RpcTimeout { host: String, secs: u64 },

    /// The agent could not be reached at all.
    #[error("RPC to {host} failed: {message}")]
    RpcUnreachable { host: String, message: String },

    /// The agent answered but the action failed on the node.
    #[error("Agent action {action} failed on {host}: {message}")]
    Remote {
        host: String,
        action: String,
        message: String,
    },

    /// Some hosts answered a fan-out call and some did not.
    #[error("RPC answered by {} host(s), failed on {}", answered.len(), format_failures(failed))]
    RpcPartial {
        answered: Vec<String>,
        failed: BTreeMap<String, String>,
    },

    /// A service group did not reach the requested state in time.
    #[error("Timed out waiting for {group} to go {state} on {system}")]
    ClusterTransitionTimeout {
        group: String,
        system: String,
        state: String,
    },

    /// A cluster command failed outright.
    #[error("Cluster operation failed: {0}")]
    Cluster(String),

    /// A snapshot exists but can no longer be used.
    #[error("Snapshot invalid: {0}")]
    SnapshotInvalid(String),

    /// A snapshot with the canonical name belongs to a different resource.
    #[error("Snapshot name conflict: {0}")]
    NameConflict(String),

    /// An expected snapshot is missing.
    #[error("Expected snapshot missing: {0}")]
    MissingExpected(String),

    /// A snapshot carries the set prefix but no member resource.
    #[error("Orphan snapshot: {0}")]
    OrphanSnapshot(String),

    /// No record of the requested snapshot set.
    #[error("No snapshot set named {0}")]
    NoNamedSet(String),

    /// A step exceeded its deadline.
    #[error("Step {step} exceeded its {secs}s deadline")]
    PlanTimeout { step: String, secs: u64 },

    /// A restore stopped partway. Carries the steps that ran and the NAS
    /// filesystems it left offline without their exports.
    #[error("Restore failed: {source}{}", format_offline(offline))]
    RestoreFailed {
        source: Box<Error>,
        steps: Vec<StepRecord>,
        offline: Vec<String>,
    },

    /// The run was cancelled between steps.
    #[error("Cancelled before step {0}")]
    Cancelled(String),

    /// The deployment manager is executing a plan.
    #[error("A deployment plan is currently running, wait for it to complete")]
    PlanRunning,

    /// Invalid snapshot set name.
    #[error("Invalid snapshot set name: {0}")]
    InvalidName(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A local command failed.
    #[error(transparent)]
    Cmd(#[from] CmdError),

    /// Reading or writing set metadata failed.
    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_failures(failed: &BTreeMap<String, String>) -> String {
    failed
        .iter()
        .map(|(host, err)| format!("{} ({})", host, err))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_offline(offline: &[String]) -> String {
    if offline.is_empty() {
        return String::new();
    }
    format!(", filesystems left offline: {}", offline.join(", "))
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RestoreFailed { source, .. } => source.kind(),
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::InvalidState(_) => ErrorKind::InvalidStateForSnapshot,
            Self::PreflightCapacity(_) => ErrorKind::PreflightCapacity,
            Self::Vendor(fault) if fault.retryable => ErrorKind::VendorTransient,
            Self::Vendor(_) => ErrorKind::VendorFatal,
            Self::RpcTimeout { .. } | Self::RpcUnreachable { .. } => ErrorKind::RpcTimeout,
            Self::Remote { .. } => ErrorKind::VendorFatal,
            Self::RpcPartial { .. } => ErrorKind::RpcPartial,
            Self::ClusterTransitionTimeout { .. } => ErrorKind::ClusterTransitionTimeout,
            Self::Cluster(_) => ErrorKind::VendorFatal,
            Self::SnapshotInvalid(_) => ErrorKind::SnapshotInvalid,
            Self::NameConflict(_) => ErrorKind::NameConflict,
            Self::MissingExpected(_) => ErrorKind::MissingExpected,
            Self::OrphanSnapshot(_) => ErrorKind::OrphanSnapshot,
            Self::NoNamedSet(_) => ErrorKind::NoNamedSet,
            Self::PlanTimeout { .. } => ErrorKind::PlanTimeout,
            Self::Cancelled(_) | Self::PlanRunning => ErrorKind::PlanStopped,
            Self::InvalidName(_) | Self::InvalidConfig(_) => ErrorKind::InvalidUsage,
            Self::Cmd(_) => ErrorKind::VendorFatal,
            Self::Metadata(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the executor may repeat the step that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Vendor(fault) => fault.retryable,
            Self::RpcTimeout { .. } | Self::RpcUnreachable { .. } => true,
            Self::Cmd(CmdError::Timeout { .. }) => true,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.kind())
    }

    pub fn vendor_fatal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vendor(DriverFault::fatal(resource, message))
    }

    pub fn vendor_transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vendor(DriverFault::transient(resource, message))
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;
