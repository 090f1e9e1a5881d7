//! What a step does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::drivers::{DestroyOutcome, NasDriver, SanDriver, SnapOutcome, VolDriver};
use crate::error::{DriverFault, Error, Result};
use crate::model::{LocalVolume, NfsExport};
use crate::quiesce::{run_brackets, Participant, Quiescer};
use crate::retry::{retry_future, Backoff};

/// Result of a step that ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    Done,
    Created,
    AlreadyPresent,
    Destroyed,
    AlreadyAbsent,
    /// Not started: an earlier step of the stage failed, or nothing to do.
    Skipped,
}

impl From<SnapOutcome> for StepOutcome {
    fn from(outcome: SnapOutcome) -> Self {
        match outcome {
            SnapOutcome::Created => Self::Created,
            SnapOutcome::AlreadyPresent => Self::AlreadyPresent,
        }
    }
}

impl From<DestroyOutcome> for StepOutcome {
    fn from(outcome: DestroyOutcome) -> Self {
        match outcome {
            DestroyOutcome::Destroyed => Self::Destroyed,
            DestroyOutcome::AlreadyAbsent => Self::AlreadyAbsent,
        }
    }
}

#[derive(Clone)]
pub enum Action {
    /// Quiesce every participating database, nested in the given order, and
    /// snap their LUNs while all brackets are open.
    Bracket {
        participants: Vec<Participant>,
        snap_deadline: Duration,
    },
    LunSnap {
        san: Arc<dyn SanDriver>,
        lun_id: String,
        snap_name: String,
    },
    LunDestroy {
        san: Arc<dyn SanDriver>,
        snap_name: String,
    },
    /// Roll a LUN back; the vendor's backup snapshot is removed before and
    /// after, also when the restore fails.
    LunRestore {
        san: Arc<dyn SanDriver>,
        lun_id: String,
        snap_name: String,
        backup_name: String,
    },
    /// Destroy every leftover vendor backup snapshot starting with `prefix`.
    BackupCleanup {
        san: Arc<dyn SanDriver>,
        prefix: String,
    },
    CacheCreate {
        nas: Arc<dyn NasDriver>,
        pool: String,
        name: String,
        size_mb: u64,
    },
    /// Destroy a pool's rollback cache once no snapshot of the pool uses it.
    CacheRelease {
        nas: Arc<dyn NasDriver>,
        pool: String,
        name: String,
    },
    FsSnap {
        nas: Arc<dyn NasDriver>,
        fs: String,
        snap_name: String,
        cache: Option<String>,
    },
    FsDestroy {
        nas: Arc<dyn NasDriver>,
        fs: String,
        snap_name: String,
    },
    FsUnexport {
        nas: Arc<dyn NasDriver>,
        fs: String,
        clients: Vec<String>,
    },
    FsOffline {
        nas: Arc<dyn NasDriver>,
        fs: String,
    },
    FsRestore {
        nas: Arc<dyn NasDriver>,
        fs: String,
        snap_name: String,
    },
    FsOnline {
        nas: Arc<dyn NasDriver>,
        fs: String,
    },
    /// Re-apply exports and verify them against the share listing.
    FsExport {
        nas: Arc<dyn NasDriver>,
        pool: String,
        fs: String,
        exports: Vec<NfsExport>,
        attempts: u32,
        spacing: Duration,
    },
    /// Delete the exports of a filesystem no service uses, then the filesystem.
    FsRetire {
        nas: Arc<dyn NasDriver>,
        pool: String,
        fs: String,
    },
    VolSnap {
        vol: Arc<dyn VolDriver>,
        host: String,
        volume: LocalVolume,
        snap_name: String,
    },
    VolRestore {
        vol: Arc<dyn VolDriver>,
        host: String,
        snap_path: String,
    },
    VolDestroy {
        vol: Arc<dyn VolDriver>,
        host: String,
        snap_path: String,
    },
    AfterRestore {
        quiescer: Arc<dyn Quiescer>,
    },
    Cleanup {
        quiescer: Arc<dyn Quiescer>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bracket { .. } => "bracket",
            Self::LunSnap { .. } => "lun-snap",
            Self::LunDestroy { .. } => "lun-destroy",
            Self::LunRestore { .. } => "lun-restore",
            Self::BackupCleanup { .. } => "backup-cleanup",
            Self::CacheCreate { .. } => "cache-create",
            Self::CacheRelease { .. } => "cache-release",
            Self::FsSnap { .. } => "fs-snap",
            Self::FsDestroy { .. } => "fs-destroy",
            Self::FsUnexport { .. } => "fs-unexport",
            Self::FsOffline { .. } => "fs-offline",
            Self::FsRestore { .. } => "fs-restore",
            Self::FsOnline { .. } => "fs-online",
            Self::FsExport { .. } => "fs-export",
            Self::FsRetire { .. } => "fs-retire",
            Self::VolSnap { .. } => "vol-snap",
            Self::VolRestore { .. } => "vol-restore",
            Self::VolDestroy { .. } => "vol-destroy",
            Self::AfterRestore { .. } => "after-restore",
            Self::Cleanup { .. } => "cleanup",
        }
    }

    /// The resource the action is about.
    pub fn resource(&self) -> String {
        match self {
            Self::Bracket { participants, .. } => participants
                .iter()
                .map(|p| p.quiescer.database().as_str())
                .collect::<Vec<_>>()
                .join(","),
            Self::AfterRestore { quiescer } | Self::Cleanup { quiescer } => {
                quiescer.database().to_string()
            }
            Self::LunSnap { lun_id, .. } | Self::LunRestore { lun_id, .. } => lun_id.clone(),
            Self::LunDestroy { snap_name, .. } => snap_name.clone(),
            Self::BackupCleanup { prefix, .. } => prefix.clone(),
            Self::CacheCreate { name, .. } | Self::CacheRelease { name, .. } => name.clone(),
            Self::FsSnap { fs, .. }
            | Self::FsDestroy { fs, .. }
            | Self::FsUnexport { fs, .. }
            | Self::FsOffline { fs, .. }
            | Self::FsRestore { fs, .. }
            | Self::FsOnline { fs, .. }
            | Self::FsExport { fs, .. }
            | Self::FsRetire { fs, .. } => fs.clone(),
            Self::VolSnap { host, volume, .. } => format!("{}:{}/{}", host, volume.vg, volume.lv),
            Self::VolRestore { host, snap_path, .. } | Self::VolDestroy { host, snap_path, .. } => {
                format!("{}:{}", host, snap_path)
            }
        }
    }

    /// Serialization key: array, NAS console, host or database.
    pub fn key(&self) -> String {
        match self {
            Self::Bracket { .. } => "db:quiesce".to_string(),
            Self::AfterRestore { quiescer } | Self::Cleanup { quiescer } => {
                format!("db:{}", quiescer.database())
            }
            Self::LunSnap { san, .. }
            | Self::LunDestroy { san, .. }
            | Self::LunRestore { san, .. }
            | Self::BackupCleanup { san, .. } => format!("san:{}", san.array()),
            Self::CacheCreate { nas, .. }
            | Self::CacheRelease { nas, .. }
            | Self::FsSnap { nas, .. }
            | Self::FsDestroy { nas, .. }
            | Self::FsUnexport { nas, .. }
            | Self::FsOffline { nas, .. }
            | Self::FsRestore { nas, .. }
            | Self::FsOnline { nas, .. }
            | Self::FsExport { nas, .. }
            | Self::FsRetire { nas, .. } => format!("nas:{}", nas.console()),
            Self::VolSnap { host, .. } | Self::VolRestore { host, .. } | Self::VolDestroy { host, .. } => {
                format!("host:{}", host)
            }
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.name(), self.resource())
    }

    pub async fn run(&self) -> Result<StepOutcome> {
        match self {
            Self::Bracket {
                participants,
                snap_deadline,
            } => {
                let outcome = run_brackets(participants, *snap_deadline).await?;
                let created = outcome.iter().any(|(_, o)| *o == SnapOutcome::Created);
                Ok(if created || outcome.is_empty() {
                    StepOutcome::Created
                } else {
                    StepOutcome::AlreadyPresent
                })
            }
            Self::LunSnap {
                san,
                lun_id,
                snap_name,
            } => Ok(san.snap(lun_id, snap_name).await?.into()),
            Self::LunDestroy { san, snap_name } => Ok(san.destroy(snap_name).await?.into()),
            Self::LunRestore {
                san,
                lun_id,
                snap_name,
                backup_name,
            } => {
                san.destroy(backup_name).await?;
                let restored = san.restore(lun_id, snap_name, backup_name).await;
                let cleaned = san.destroy(backup_name).await;
                restored?;
                if let Err(e) = cleaned {
                    warn!(backup = %backup_name, error = %e, "Failed to remove restore backup snapshot");
                }
                info!(lun_id = %lun_id, snap = %snap_name, "LUN restored");
                Ok(StepOutcome::Done)
            }
            Self::BackupCleanup { san, prefix } => {
                let leftovers = san.list_snaps(prefix).await?;
                for snap in &leftovers {
                    san.destroy(&snap.name).await?;
                }
                if leftovers.is_empty() {
                    Ok(StepOutcome::AlreadyAbsent)
                } else {
                    info!(count = leftovers.len(), "Removed restore backup snapshots");
                    Ok(StepOutcome::Destroyed)
                }
            }
            Self::CacheCreate {
                nas,
                pool,
                name,
                size_mb,
            } => Ok(nas.create_cache(name, *size_mb, pool).await?.into()),
            Self::CacheRelease { nas, pool, name } => {
                let remaining = nas.list_snaps(pool, "").await?;
                if !remaining.is_empty() {
                    debug!(cache = %name, snaps = remaining.len(), "Rollback cache still in use");
                    return Ok(StepOutcome::Skipped);
                }
                Ok(nas.destroy_cache(name).await?.into())
            }
            Self::FsSnap {
                nas,
                fs,
                snap_name,
                cache,
            } => Ok(nas.snap(fs, snap_name, cache.as_deref()).await?.into()),
            Self::FsDestroy { nas, fs, snap_name } => Ok(nas.destroy(fs, snap_name).await?.into()),
            Self::FsUnexport { nas, fs, clients } => {
                for client in clients {
                    nas.remove_export(fs, client).await?;
                }
                Ok(StepOutcome::Done)
            }
            Self::FsOffline { nas, fs } => {
                nas.offline(fs).await?;
                Ok(StepOutcome::Done)
            }
            Self::FsRestore { nas, fs, snap_name } => {
                nas.restore(fs, snap_name).await?;
                Ok(StepOutcome::Done)
            }
            Self::FsOnline { nas, fs } => {
                nas.online(fs).await?;
                Ok(StepOutcome::Done)
            }
            Self::FsExport {
                nas,
                pool,
                fs,
                exports,
                attempts,
                spacing,
            } => {
                let policy = Backoff::fixed((*attempts).max(1), *spacing)
                    .retry_all()
                    .label("nfs export");
                retry_future(|_| apply_exports(nas.as_ref(), pool, fs, exports), policy).await?;
                info!(fs = %fs, exports = exports.len(), "Exports re-applied");
                Ok(StepOutcome::Done)
            }
            Self::FsRetire { nas, pool, fs } => {
                let exports = nas.list_exports(pool).await?;
                for export in exports.get(fs).into_iter().flatten() {
                    nas.remove_export(fs, &export.client).await?;
                }
                Ok(nas.destroy_fs(fs).await?.into())
            }
            Self::VolSnap {
                vol,
                host,
                volume,
                snap_name,
            } => Ok(vol.snap(host, volume, snap_name).await?.into()),
            Self::VolRestore {
                vol,
                host,
                snap_path,
            } => {
                vol.restore(host, snap_path).await?;
                Ok(StepOutcome::Done)
            }
            Self::VolDestroy {
                vol,
                host,
                snap_path,
            } => Ok(vol.destroy(host, snap_path).await?.into()),
            Self::AfterRestore { quiescer } => {
                quiescer.after_restore().await?;
                Ok(StepOutcome::Done)
            }
            Self::Cleanup { quiescer } => {
                quiescer.cleanup().await?;
                Ok(StepOutcome::Done)
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Add every export, then check the share listing has them all.
async fn apply_exports(
    nas: &dyn NasDriver,
    pool: &str,
    fs: &str,
    exports: &[NfsExport],
) -> Result<()> {
    for export in exports {
        nas.add_export(fs, export).await?;
    }
    let listed = nas.list_exports(pool).await?;
    let current = listed.get(fs).map(Vec::as_slice).unwrap_or_default();
    let missing: Vec<&str> = exports
        .iter()
        .filter(|e| !current.contains(e))
        .map(|e| e.client.as_str())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::Vendor(DriverFault::transient(
        fs,
        format!("exports to {} not listed after re-apply", missing.join(", ")),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mock::{MockNas, MockSan};
    use crate::model::VendorFamily;

    #[tokio::test]
    async fn test_lun_restore_removes_backup_on_failure() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "data1", "7", 1024);
        san.insert_snap("7", "snapset_restore_bkup_7");
        let action = Action::LunRestore {
            san: san.clone(),
            lun_id: "7".to_string(),
            snap_name: "s1_7".to_string(),
            backup_name: "snapset_restore_bkup_7".to_string(),
        };
        // no s1_7 snapshot: the restore itself fails
        assert!(action.run().await.is_err());
        assert!(san.find_snap("snapset_restore_bkup_7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_release_waits_for_last_snapshot() {
        let nas = Arc::new(MockNas::new("nas1", VendorFamily::ClusteredNas));
        nas.add_fs("pool1", "pool1-fs1", 1024);
        nas.create_cache("pool1-cache", 1024, "pool1").await.unwrap();
        nas.snap("pool1-fs1", "s1-pool1-fs1", Some("pool1-cache")).await.unwrap();

        let release = Action::CacheRelease {
            nas: nas.clone(),
            pool: "pool1".to_string(),
            name: "pool1-cache".to_string(),
        };
        assert_eq!(release.run().await.unwrap(), StepOutcome::Skipped);

        nas.destroy("pool1-fs1", "s1-pool1-fs1").await.unwrap();
        assert_eq!(release.run().await.unwrap(), StepOutcome::Destroyed);
        assert!(nas.list_caches().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_is_verified() {
        let nas = Arc::new(MockNas::new("nas1", VendorFamily::ClusteredNas));
        nas.add_fs("pool1", "pool1-fs1", 1024);
        nas.drop_exports_of("10.0.0.2");
        let action = Action::FsExport {
            nas: nas.clone(),
            pool: "pool1".to_string(),
            fs: "pool1-fs1".to_string(),
            exports: vec![
                NfsExport::new("10.0.0.1", "rw,no_root_squash"),
                NfsExport::new("10.0.0.2", "rw,no_root_squash"),
            ],
            attempts: 3,
            spacing: Duration::from_secs(2),
        };
        let err = action.run().await.unwrap_err();
        assert!(err.to_string().contains("10.0.0.2"));
        let adds = nas
            .events()
            .iter()
            .filter(|e| e.starts_with("export pool1-fs1 10.0.0.1"))
            .count();
        assert_eq!(adds, 3);
    }
}
