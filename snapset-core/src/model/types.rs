//! Typed view of the deployment model.
//!
//! Items live in flat vectors owned by [`Model`](super::Model); parents and
//! children refer to each other through the index handles defined here.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);
    };
}

handle!(ProviderId);
handle!(PoolId);
handle!(LunId);
handle!(FsId);
handle!(ClusterId);
handle!(NodeId);
handle!(GroupId);

/// SAN or NAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    San,
    Nas,
}

/// Vendor family of a storage provider. Drivers are chosen on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorFamily {
    /// Block array driven through the legacy secure CLI.
    LegacyBlock,
    /// Block array driven through the unified CLI.
    UnifiedBlock,
    /// Clustered NAS that needs a rollback cache (Family A).
    ClusteredNas,
    /// Unified NAS without rollback caches (Family B).
    UnifiedNas,
}

impl VendorFamily {
    pub fn kind(self) -> ProviderKind {
        match self {
            Self::LegacyBlock | Self::UnifiedBlock => ProviderKind::San,
            Self::ClusteredNas | Self::UnifiedNas => ProviderKind::Nas,
        }
    }

    /// Map the model's `san_type` / `nas_type` property onto a family.
    pub fn from_model(item_type: &str, type_property: &str) -> Option<Self> {
        let t = type_property.to_ascii_lowercase();
        match item_type {
            "san-emc" if t.starts_with("vnx") => Some(Self::LegacyBlock),
            "san-emc" if t.starts_with("unity") => Some(Self::UnifiedBlock),
            "sfs-service" if t.is_empty() || t == "veritas" => Some(Self::ClusteredNas),
            "sfs-service" if t.starts_with("unity") => Some(Self::UnifiedNas),
            _ => None,
        }
    }
}

impl fmt::Display for VendorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LegacyBlock => "legacy-block",
            Self::UnifiedBlock => "unified-block",
            Self::ClusteredNas => "clustered-nas",
            Self::UnifiedNas => "unified-nas",
        };
        f.write_str(s)
    }
}

/// A SAN array or NAS console.
#[derive(Debug, Clone)]
pub struct StorageProvider {
    pub name: String,
    pub family: VendorFamily,
    pub primary_ip: String,
    pub secondary_ip: Option<String>,
    pub user: String,
    /// Opaque key handed to the decrypter.
    pub password_key: String,
    pub login_scope: Option<String>,
    pub pools: Vec<PoolId>,
}

impl StorageProvider {
    pub fn kind(&self) -> ProviderKind {
        self.family.kind()
    }
}

#[derive(Debug, Clone)]
pub struct StoragePool {
    pub provider: ProviderId,
    pub name: String,
}

/// The database a LUN backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Graph,
    Relational,
    Object,
    Directory,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 4] = [
        DatabaseKind::Graph,
        DatabaseKind::Relational,
        DatabaseKind::Object,
        DatabaseKind::Directory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Relational => "relational",
            Self::Object => "object",
            Self::Directory => "directory",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A modeled LUN. The array-side id is resolved by the SAN driver.
#[derive(Debug, Clone)]
pub struct Lun {
    pub pool: PoolId,
    pub name: String,
    pub size_mb: u64,
    /// Percent of capacity reserved for snapshots; 0 means not snapped.
    pub snap_size: u8,
    /// Set when the name matches a database LUN alias.
    pub database: Option<DatabaseKind>,
    /// Nodes the LUN is presented to.
    pub nodes: Vec<NodeId>,
}

/// An NFS export of a NAS filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NfsExport {
    pub client: String,
    pub options: String,
}

impl NfsExport {
    pub fn new(client: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            options: options.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NasFilesystem {
    pub pool: PoolId,
    pub name: String,
    pub size_mb: u64,
    pub snap_size: u8,
    /// Exports declared in the model.
    pub exports: Vec<NfsExport>,
}

/// A local logical volume that is snapped with LVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub vg: String,
    pub lv: String,
    pub path: String,
    pub snap_size: u8,
    pub mount_point: Option<String>,
    /// False for kickstart volumes found on the host but absent from the model.
    pub modeled: bool,
}

/// Volumes to snap per host, per volume group.
pub type LocalVolumeMap =
    std::collections::BTreeMap<String, std::collections::BTreeMap<String, Vec<LocalVolume>>>;

#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub groups: Vec<GroupId>,
}

#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub item_id: String,
    pub hostname: String,
    pub cluster: ClusterId,
    /// Model item state (`Applied`, `Initial`, ...).
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Failover,
    Parallel,
}

#[derive(Debug, Clone)]
pub struct ServiceGroup {
    pub item_id: String,
    /// Name of the group in the cluster manager.
    pub cluster_name: String,
    pub cluster: ClusterId,
    pub kind: GroupKind,
    pub nodes: Vec<NodeId>,
}

/// Parse a model size such as `10G`, `100M` or `2T` into MiB.
pub fn parse_size_mb(size: &str) -> Option<u64> {
    let size = size.trim();
    let split = size.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = size.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit.to_ascii_uppercase().as_str() {
        "M" | "MB" => Some(value),
        "G" | "GB" => Some(value * 1024),
        "T" | "TB" => Some(value * 1024 * 1024),
        _ => None,
    }
}
