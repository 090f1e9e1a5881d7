//! Tunables for the snapshot coordinator.
//!
//! Top-level sections of the coordinator's YAML configuration;
//! every field has a default so an empty section is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All coordinator tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSettings,
    pub rpc: RpcSettings,
    pub executor: ExecutorSettings,
    pub timeouts: TimeoutSettings,
    pub databases: DatabaseSettings,
    pub san: SanSettings,
    pub nas: NasSettings,
    pub lvm: LvmSettings,
    /// Set name that selects the legacy NAS naming (`L_{fs}_`).
    pub default_set: String,
}

impl Settings {
    pub fn is_default_set(&self, set: &str) -> bool {
        !self.default_set.is_empty() && self.default_set == set
    }
}

/// Deployment manager REST model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub url: String,
    pub user: String,
    /// Decrypter key for the model user's password.
    pub password_key: String,
    /// Reads per request before the model is reported unavailable.
    pub attempts: u32,
    pub backoff_secs: u64,
    pub request_timeout_secs: u64,
    /// Item whose `value` property names the deployment type.
    pub deployment_type_path: String,
    /// Deployment types matching this pattern are rack deployments.
    pub rack_deployment_pattern: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            url: "https://localhost:9999".to_string(),
            user: "litp-admin".to_string(),
            password_key: "litp".to_string(),
            attempts: 3,
            backoff_secs: 5,
            request_timeout_secs: 60,
            deployment_type_path: "/software/items/config_manager/global_properties/enm_deployment_type"
                .to_string(),
            rack_deployment_pattern: ".*_On_Rack_Servers".to_string(),
        }
    }
}

/// Node agent RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub scheme: String,
    pub port: u16,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8740,
        }
    }
}

/// Concurrency and retry policy of the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Fan-out for enumeration and listing calls.
    pub listing_concurrency: usize,
    /// Fan-out for destructive calls against one array or console.
    pub destructive_concurrency: usize,
    /// Attempts per retryable step, first attempt included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            listing_concurrency: 10,
            destructive_concurrency: 1,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl ExecutorSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Deadlines per operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub cluster_transition_secs: u64,
    pub vendor_snap_secs: u64,
    pub safety_net_secs: u64,
    pub rpc_deadline_secs: u64,
    /// Poll interval while waiting for a service group state.
    pub state_poll_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            cluster_transition_secs: 60,
            vendor_snap_secs: 600,
            safety_net_secs: 60,
            rpc_deadline_secs: 60,
            state_poll_secs: 2,
        }
    }
}

impl TimeoutSettings {
    pub fn cluster_transition(&self) -> Duration {
        Duration::from_secs(self.cluster_transition_secs)
    }

    pub fn vendor_snap(&self) -> Duration {
        Duration::from_secs(self.vendor_snap_secs)
    }

    pub fn safety_net(&self) -> Duration {
        Duration::from_secs(self.safety_net_secs)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_secs(self.rpc_deadline_secs)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_secs(self.state_poll_secs.max(1))
    }
}

/// Which LUNs back which database, and how each database is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Cluster that hosts the database service groups.
    pub db_cluster: String,
    /// The graph database owns the application data (else the object database).
    pub graph_authoritative: bool,

    pub graph_luns: Vec<String>,
    pub rack_graph_luns: Vec<String>,
    pub relational_luns: Vec<String>,
    pub object_luns: Vec<String>,
    pub directory_luns: Vec<String>,
    /// LUN name patterns that never participate.
    pub exclude_patterns: Vec<String>,

    pub graph_group_pattern: String,
    pub relational_group_pattern: String,
    pub object_group_pattern: String,
    pub directory_group_pattern: String,

    pub graph_checkpoint_attempts: u32,
    pub graph_checkpoint_spacing_secs: u64,
    pub graph_iops_limit: u32,
    pub graph_max_raft_lag: u64,
    /// Mount point of the graph database data directory, frozen around the snap.
    pub graph_data_mount: String,

    pub relational_user: String,
    /// Decrypter key for the relational user's password.
    pub relational_password_key: String,
    pub relational_client: String,

    pub object_backup_tool: String,
    pub object_db_name: String,
    pub object_os_user: String,

    pub directory_backup_dir: String,
    pub directory_log_dir: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            db_cluster: "db_cluster".to_string(),
            graph_authoritative: true,
            graph_luns: vec![
                "neo4jlun".to_string(),
                "neo4j_2".to_string(),
                "neo4j_3".to_string(),
                "neo4j_4".to_string(),
            ],
            rack_graph_luns: vec![
                "neo4j_1".to_string(),
                "neo4j_2".to_string(),
                "neo4j_3".to_string(),
            ],
            relational_luns: vec!["mysql".to_string()],
            object_luns: vec!["versantdb".to_string()],
            directory_luns: vec!["opendj".to_string()],
            exclude_patterns: vec![".*SFS.*".to_string(), ".*elasticsearch.*".to_string()],
            graph_group_pattern: ".*neo4j_clustered_service".to_string(),
            relational_group_pattern: ".*mysql_clustered_service".to_string(),
            object_group_pattern: ".*versant_clustered_service".to_string(),
            directory_group_pattern: ".*opendj_clustered_service".to_string(),
            graph_checkpoint_attempts: 5,
            graph_checkpoint_spacing_secs: 30,
            graph_iops_limit: 5000,
            graph_max_raft_lag: 50_000,
            graph_data_mount: "/ericsson/neo4j_data".to_string(),
            relational_user: "root".to_string(),
            relational_password_key: "idm_mysql_admin_password".to_string(),
            relational_client: "/opt/mysql/bin/mysql".to_string(),
            object_backup_tool: "/ericsson/versant/bin/vjbackup".to_string(),
            object_db_name: "dps_integration".to_string(),
            object_os_user: "versant".to_string(),
            directory_backup_dir: "/var/tmp/opendj_backup".to_string(),
            directory_log_dir: "/var/tmp/opendj_backup_log".to_string(),
        }
    }
}

/// SAN vendor CLI details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanSettings {
    /// CLI for the legacy-block family.
    pub legacy_cli: String,
    /// CLI for the unified-block family.
    pub unified_cli: String,
    /// Snap wrapper installed on database nodes.
    pub node_snap_cli: String,
    pub scope: String,
    pub description: String,
    /// Prefix of the vendor's automatic "backup before restore" snaps.
    pub restore_backup_prefix: String,
}

impl Default for SanSettings {
    fn default() -> Self {
        Self {
            legacy_cli: "/opt/Navisphere/bin/naviseccli".to_string(),
            unified_cli: "/usr/bin/uemcli".to_string(),
            node_snap_cli: "/opt/snapset/bin/sancli".to_string(),
            scope: "0".to_string(),
            description: "Snapset_Snapshot".to_string(),
            restore_backup_prefix: "snapset_restore_bkup".to_string(),
        }
    }
}

/// NAS console details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NasSettings {
    pub ssh: String,
    pub ssh_connect_timeout_secs: u64,
    /// Cache usage (percent) at which validation fails.
    pub cache_usage_threshold: f64,
    /// Service suffixes whose filesystems are retired when the service is gone.
    pub removal_services: Vec<String>,
    pub export_attempts: u32,
    pub share_list_attempts: u32,
    pub retry_spacing_secs: u64,
}

impl Default for NasSettings {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            ssh_connect_timeout_secs: 30,
            cache_usage_threshold: 80.0,
            removal_services: vec![
                "sdncontroller".to_string(),
                "solr".to_string(),
                "solrautoID".to_string(),
            ],
            export_attempts: 3,
            share_list_attempts: 5,
            retry_spacing_secs: 2,
        }
    }
}

impl NasSettings {
    pub fn retry_spacing(&self) -> Duration {
        Duration::from_secs(self.retry_spacing_secs)
    }
}

/// Local volume snapshot details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmSettings {
    /// Tag added to every snapshot LV.
    pub tag: String,
    /// Volume group the management host was kickstarted into.
    pub ms_root_vg: String,
    /// Snapshot size for un-modeled kickstart volumes, percent of origin.
    pub kickstart_snap_percent: u8,
}

impl Default for LvmSettings {
    fn default() -> Self {
        Self {
            tag: "snapset_snapshot".to_string(),
            ms_root_vg: "vg_root".to_string(),
            kickstart_snap_percent: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.executor.listing_concurrency, 10);
        assert_eq!(settings.executor.destructive_concurrency, 1);
        assert_eq!(settings.timeouts.safety_net(), Duration::from_secs(60));
        assert_eq!(settings.databases.graph_max_raft_lag, 50_000);
        assert_eq!(settings.nas.cache_usage_threshold, 80.0);
        assert_eq!(settings.model.attempts, 3);
        assert_eq!(settings.rpc.port, 8740);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
executor:
  max_attempts: 5
databases:
  graph_authoritative: false
default_set: Snapshot
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.executor.max_attempts, 5);
        assert_eq!(settings.executor.listing_concurrency, 10);
        assert!(!settings.databases.graph_authoritative);
        assert!(settings.is_default_set("Snapshot"));
        assert!(!settings.is_default_set("s1"));
    }
}
