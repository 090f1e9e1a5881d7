//! Storage drivers.
//!
//! Three capability traits, one per tier:
//!
//! ```text
//!   SanDriver   block LUNs          NaviSan (legacy-block), UemSan (unified-block)
//!   NasDriver   NAS filesystems     ClusteredNas (Family A), UnifiedNas (Family B)
//!   VolDriver   node-local LVM      RpcVolDriver (through the node agent)
//! ```
//!
//! Drivers hold no session between calls. Creating a snapshot that already
//! exists for the intended resource, or destroying one that is already gone,
//! succeeds. Every failure is an [`Error::Vendor`] carrying a
//! [`DriverFault`](crate::error::DriverFault).

mod nas_clustered;
mod nas_unified;
pub mod parse;
mod san_legacy;
mod san_unified;
mod uemcli;
mod vol;

pub use nas_clustered::ClusteredNas;
pub use nas_unified::UnifiedNas;
pub use san_legacy::NaviSan;
pub use san_unified::UemSan;
pub use uemcli::UemCli;
pub use vol::{parse_lvs, LvRecord, RpcVolDriver, LVS_FIELDS};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cmd::CommandLine;
use crate::error::{Error, Result};
use crate::model::{LocalVolume, NfsExport, VendorFamily};

/// Result of a snapshot call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapOutcome {
    Created,
    /// The canonical snapshot already existed on the intended resource.
    AlreadyPresent,
}

/// Result of a destroy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestroyOutcome {
    Destroyed,
    AlreadyAbsent,
}

/// Login details for a SAN array, password already decrypted.
#[derive(Debug, Clone)]
pub struct SanLogin {
    pub array: String,
    pub spa: String,
    pub spb: Option<String>,
    pub user: String,
    pub password: String,
    pub scope: String,
}

/// Login details for a NAS console, password already decrypted.
#[derive(Debug, Clone)]
pub struct NasLogin {
    pub console: String,
    pub address: String,
    pub user: String,
    pub password: String,
}

// =============================================================================
// SAN
// =============================================================================

/// A LUN as the array reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayLun {
    pub id: String,
    pub name: String,
    pub pool: String,
    pub size_mb: u64,
}

/// A LUN snapshot as the array reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunSnap {
    pub name: String,
    pub lun_id: String,
    pub created: Option<String>,
    pub state: Option<String>,
}

#[async_trait]
pub trait SanDriver: Send + Sync {
    fn family(&self) -> VendorFamily;

    /// Array name, used as the serialization key for destructive calls.
    fn array(&self) -> &str;

    /// LUNs of one storage pool.
    async fn enumerate(&self, pool: &str) -> Result<Vec<ArrayLun>>;

    /// Subscribed capacity of a pool in percent.
    async fn pool_subscription(&self, pool: &str) -> Result<f64>;

    /// Snapshots whose name starts with `prefix`.
    async fn list_snaps(&self, prefix: &str) -> Result<Vec<LunSnap>>;

    /// The vendor snap call, without any existence check.
    async fn create_snap(&self, lun_id: &str, snap_name: &str) -> Result<()>;

    /// Roll `lun_id` back to `snap_name`; the vendor keeps the replaced
    /// content as `backup_name`.
    async fn restore(&self, lun_id: &str, snap_name: &str, backup_name: &str) -> Result<()>;

    async fn destroy(&self, snap_name: &str) -> Result<DestroyOutcome>;

    /// Command that takes the snapshot from a database node, for quiescers
    /// that wrap the snap in a database session.
    fn snap_command(&self, lun_id: &str, snap_name: &str) -> CommandLine;

    /// Whether `err` is the vendor's "snapshot name already in use".
    fn is_exists_error(&self, _err: &Error) -> bool {
        false
    }

    async fn find_snap(&self, snap_name: &str) -> Result<Option<LunSnap>> {
        Ok(self
            .list_snaps(snap_name)
            .await?
            .into_iter()
            .find(|s| s.name == snap_name))
    }

    /// Pre-existing check, then the vendor snap call.
    #[instrument(skip(self), fields(array = %self.array()))]
    async fn snap(&self, lun_id: &str, snap_name: &str) -> Result<SnapOutcome> {
        if let Some(existing) = self.find_snap(snap_name).await? {
            return existing_outcome(&existing, lun_id);
        }
        match self.create_snap(lun_id, snap_name).await {
            Ok(()) => {
                info!("Snapshot created");
                Ok(SnapOutcome::Created)
            }
            Err(err) if self.is_exists_error(&err) => match self.find_snap(snap_name).await? {
                Some(existing) => existing_outcome(&existing, lun_id),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

/// Pre-existing check on its own, for snaps taken outside [`SanDriver::snap`].
pub async fn existing_snap(
    san: &dyn SanDriver,
    lun_id: &str,
    snap_name: &str,
) -> Result<Option<SnapOutcome>> {
    match san.find_snap(snap_name).await? {
        Some(existing) => existing_outcome(&existing, lun_id).map(Some),
        None => Ok(None),
    }
}

fn existing_outcome(existing: &LunSnap, lun_id: &str) -> Result<SnapOutcome> {
    if existing.lun_id == lun_id {
        info!(snap = %existing.name, "Snapshot already present");
        Ok(SnapOutcome::AlreadyPresent)
    } else {
        Err(Error::NameConflict(format!(
            "{} exists on LUN {}, expected LUN {}",
            existing.name, existing.lun_id, lun_id
        )))
    }
}

// =============================================================================
// NAS
// =============================================================================

/// A filesystem as the NAS reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NasFs {
    pub name: String,
    pub online: bool,
    pub size_mb: Option<u64>,
}

/// A filesystem snapshot as the NAS reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsSnap {
    pub name: String,
    pub filesystem: String,
}

/// A rollback cache and its usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub name: String,
    pub total_mb: u64,
    pub used_mb: u64,
}

impl CacheInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total_mb == 0 {
            return 100.0;
        }
        let pct = self.used_mb as f64 / self.total_mb as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }
}

/// Exports of one filesystem.
pub type ExportMap = std::collections::BTreeMap<String, Vec<NfsExport>>;

#[async_trait]
pub trait NasDriver: Send + Sync {
    fn family(&self) -> VendorFamily;

    /// Console name, used as the serialization key for destructive calls.
    fn console(&self) -> &str;

    /// Whether snapshots need a rollback cache (Family A).
    fn uses_rollback_cache(&self) -> bool {
        self.family() == VendorFamily::ClusteredNas
    }

    /// Filesystems of one pool.
    async fn enumerate(&self, pool: &str) -> Result<Vec<NasFs>>;

    async fn snap(&self, fs: &str, snap_name: &str, cache: Option<&str>) -> Result<SnapOutcome>;

    /// Snapshots of `pool`'s filesystems whose name starts with `prefix`.
    async fn list_snaps(&self, pool: &str, prefix: &str) -> Result<Vec<FsSnap>>;

    async fn restore(&self, fs: &str, snap_name: &str) -> Result<()>;

    async fn destroy(&self, fs: &str, snap_name: &str) -> Result<DestroyOutcome>;

    async fn list_caches(&self) -> Result<Vec<CacheInfo>>;

    async fn create_cache(&self, name: &str, size_mb: u64, pool: &str) -> Result<SnapOutcome>;

    async fn destroy_cache(&self, name: &str) -> Result<DestroyOutcome>;

    async fn offline(&self, fs: &str) -> Result<()>;

    async fn online(&self, fs: &str) -> Result<()>;

    /// Exports of `pool`'s filesystems, by filesystem.
    async fn list_exports(&self, pool: &str) -> Result<ExportMap>;

    async fn add_export(&self, fs: &str, export: &NfsExport) -> Result<()>;

    async fn remove_export(&self, fs: &str, client: &str) -> Result<()>;

    async fn destroy_fs(&self, fs: &str) -> Result<DestroyOutcome>;
}

// =============================================================================
// Local volumes
// =============================================================================

#[async_trait]
pub trait VolDriver: Send + Sync {
    /// Logical volumes on `host`, optionally only those tagged `tag`.
    async fn enumerate(&self, host: &str, tag: Option<&str>) -> Result<Vec<LvRecord>>;

    async fn snap(&self, host: &str, volume: &LocalVolume, snap_name: &str) -> Result<SnapOutcome>;

    /// Merge the snapshot at `snap_path` back into its origin.
    async fn restore(&self, host: &str, snap_path: &str) -> Result<()>;

    async fn destroy(&self, host: &str, snap_path: &str) -> Result<DestroyOutcome>;
}

/// Rollback cache size for a pool: `ceil(sum(size * snap_size / 100))` GiB,
/// never below 256 MiB.
pub fn rollback_cache_size_mb(filesystems: impl IntoIterator<Item = (u64, u8)>) -> u64 {
    const FLOOR_MB: u64 = 256;
    let required_mb: f64 = filesystems
        .into_iter()
        .map(|(size_mb, snap_size)| size_mb as f64 * snap_size as f64 / 100.0)
        .sum();
    let gib = (required_mb / 1024.0).ceil() as u64;
    (gib * 1024).max(FLOOR_MB)
}
