//! Agent configuration.
//!
//! Loaded from `/etc/snapset/agent.yaml` (or the path given with `--config`).
//! Every field has a default, so an empty or missing file yields a working
//! agent bound to port 8740.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapset/agent.yaml";

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the HTTP API listens on.
    pub listen: String,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log format: "json" or "text"
    pub log_format: String,

    pub exec: ExecConfig,
    pub lvm: LvmConfig,
    pub freeze: FreezeConfig,
    pub graphdb: GraphDbConfig,
    pub directory: DirectoryConfig,
}

/// Limits for `exec/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Applied when the request carries no timeout.
    pub default_timeout_secs: u64,
    /// Requested timeouts are capped to this.
    pub max_timeout_secs: u64,
    /// Used to switch user for requests that name one.
    pub runuser: String,
}

/// LVM and block device tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmConfig {
    pub lvs: String,
    pub lvcreate: String,
    pub lvremove: String,
    pub lvconvert: String,
    pub blkid: String,
    /// Mount table consulted for mount points.
    pub mounts_file: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeConfig {
    pub fsfreeze: String,
    /// Upper bound on the automatic thaw delay a request may ask for.
    pub max_safety_net_secs: u64,
}

/// Graph database access through `cypher-shell`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphDbConfig {
    pub cypher_shell: String,
    pub address: String,
    pub user: String,
    pub password: String,
    /// Returns a single `role` column.
    pub role_query: String,
    /// Returns a single committed raft index column.
    pub index_query: String,
    pub timeout_secs: u64,
}

/// Directory server backup scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub backup_script: String,
    pub restore_script: String,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8740".to_string(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            exec: ExecConfig::default(),
            lvm: LvmConfig::default(),
            freeze: FreezeConfig::default(),
            graphdb: GraphDbConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            max_timeout_secs: 3600,
            runuser: "/sbin/runuser".to_string(),
        }
    }
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            lvs: "/sbin/lvs".to_string(),
            lvcreate: "/sbin/lvcreate".to_string(),
            lvremove: "/sbin/lvremove".to_string(),
            lvconvert: "/sbin/lvconvert".to_string(),
            blkid: "/sbin/blkid".to_string(),
            mounts_file: "/proc/mounts".to_string(),
            timeout_secs: 120,
        }
    }
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            fsfreeze: "/sbin/fsfreeze".to_string(),
            max_safety_net_secs: 300,
        }
    }
}

impl Default for GraphDbConfig {
    fn default() -> Self {
        Self {
            cypher_shell: "/opt/neo4j/bin/cypher-shell".to_string(),
            address: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            role_query: "CALL dbms.cluster.role(\"neo4j\") YIELD role RETURN role;".to_string(),
            index_query: "CALL dbms.queryJmx(\"neo4j.metrics:name=neo4j.causal_clustering.core.commit_index\") \
                          YIELD attributes RETURN attributes.Value.value;"
                .to_string(),
            timeout_secs: 600,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backup_script: "/opt/opendj/bin/opendj_backup.sh".to_string(),
            restore_script: "/opt/opendj/bin/opendj_restore.sh".to_string(),
            timeout_secs: 1800,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist. A file that exists but cannot be parsed is an
    /// error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;

        info!(path = %path.display(), listen = %config.listen, "Loaded configuration");
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "listen".to_string(),
                message: format!("'{}' is not a socket address", self.listen),
            });
        }

        if self.exec.default_timeout_secs == 0
            || self.exec.default_timeout_secs > self.exec.max_timeout_secs
        {
            return Err(ConfigError::InvalidValue {
                field: "exec.default_timeout_secs".to_string(),
                message: "must be between 1 and exec.max_timeout_secs".to_string(),
            });
        }

        if self.freeze.max_safety_net_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "freeze.max_safety_net_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                message: format!("must be one of: {:?}", valid_levels),
            });
        }

        Ok(())
    }

    /// Effective timeout for an exec request.
    pub fn exec_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .filter(|secs| *secs > 0)
            .unwrap_or(self.exec.default_timeout_secs)
            .min(self.exec.max_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8740");
        assert_eq!(config.exec.default_timeout_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();

        config.listen = "not-an-address".to_string();
        assert!(config.validate().is_err());
        config.listen = "127.0.0.1:9000".to_string();

        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
        config.log_level = "debug".to_string();

        config.exec.default_timeout_secs = config.exec.max_timeout_secs + 1;
        assert!(config.validate().is_err());
        config.exec.default_timeout_secs = 60;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exec_timeout_capped() {
        let config = AgentConfig::default();
        assert_eq!(config.exec_timeout(None), 600);
        assert_eq!(config.exec_timeout(Some(0)), 600);
        assert_eq!(config.exec_timeout(Some(30)), 30);
        assert_eq!(config.exec_timeout(Some(99_999)), 3600);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "listen: 127.0.0.1:9999\ngraphdb:\n  password: s3cret\n").unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.graphdb.password, "s3cret");
        assert_eq!(config.graphdb.user, "neo4j");
        assert_eq!(config.lvm.lvs, "/sbin/lvs");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AgentConfig::load("/nonexistent/agent.yaml").unwrap();
        assert_eq!(config.listen, "0.0.0.0:8740");
    }
}
