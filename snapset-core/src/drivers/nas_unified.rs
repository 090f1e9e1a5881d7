//! Family B NAS driver on the unified CLI.
//!
//! Filesystem snapshots need no rollback cache and restore online, so the
//! cache and offline/online calls are no-ops here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::parse::Record;
use super::uemcli::{bytes_to_mb, is_exists, is_not_found};
use super::{
    CacheInfo, DestroyOutcome, ExportMap, FsSnap, NasDriver, NasFs, NasLogin, SnapOutcome, UemCli,
};
use crate::cmd::CommandRunner;
use crate::error::{Error, Result};
use crate::model::{NfsExport, VendorFamily};

const ROOT_OPTIONS: &str = "rw,no_root_squash";
const RW_OPTIONS: &str = "rw";

pub struct UnifiedNas {
    console: String,
    cli: UemCli,
}

/// One NFS share and the hosts it grants access to.
struct Share {
    id: String,
    root_hosts: Vec<String>,
    rw_hosts: Vec<String>,
}

impl UnifiedNas {
    pub fn new(login: NasLogin, cli_path: &str, runner: Arc<dyn CommandRunner>) -> Self {
        let cli = UemCli::new(cli_path, &login.address, &login.user, &login.password, runner);
        Self {
            console: login.console,
            cli,
        }
    }

    /// Filesystem records keyed by name.
    async fn filesystems(&self) -> Result<BTreeMap<String, Record>> {
        let records = self.cli.show("fs", &["/stor/prov/fs"]).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| Some((r.get("Name")?.clone(), r)))
            .collect())
    }

    async fn fs_id(&self, fs: &str) -> Result<Option<String>> {
        Ok(self
            .filesystems()
            .await?
            .get(fs)
            .and_then(|r| r.get("ID").cloned()))
    }

    async fn snapshots(&self) -> Result<Vec<FsSnap>> {
        let by_id: BTreeMap<String, String> = self
            .filesystems()
            .await?
            .into_iter()
            .filter_map(|(name, r)| Some((r.get("ID")?.clone(), name)))
            .collect();
        let records = self.cli.show("snap", &["/prot/snap"]).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| {
                let filesystem = by_id.get(r.get("Source")?)?.clone();
                Some(FsSnap {
                    name: r.get("Name")?.clone(),
                    filesystem,
                })
            })
            .collect())
    }

    /// Shares keyed by filesystem name.
    async fn shares(&self) -> Result<BTreeMap<String, Share>> {
        let by_id: BTreeMap<String, String> = self
            .filesystems()
            .await?
            .into_iter()
            .filter_map(|(name, r)| Some((r.get("ID")?.clone(), name)))
            .collect();
        let records = self.cli.show("nfs", &["/stor/prov/fs/nfs"]).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| {
                let fs = by_id.get(r.get("File system")?)?.clone();
                Some((
                    fs,
                    Share {
                        id: r.get("ID")?.clone(),
                        root_hosts: host_list(r.get("Root hosts")),
                        rw_hosts: host_list(r.get("Read/write hosts")),
                    },
                ))
            })
            .collect())
    }

    async fn set_hosts(&self, fs: &str, share: &Share) -> Result<()> {
        let root = share.root_hosts.join(",");
        let rw = share.rw_hosts.join(",");
        self.cli
            .run(
                fs,
                &[
                    "/stor/prov/fs/nfs",
                    "-id",
                    share.id.as_str(),
                    "set",
                    "-rootHosts",
                    root.as_str(),
                    "-rwHosts",
                    rw.as_str(),
                ],
            )
            .await?;
        Ok(())
    }
}

fn host_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn in_pool(fs: &str, pool: &str) -> bool {
    fs.strip_prefix(pool)
        .is_some_and(|rest| rest.starts_with('-'))
}

#[async_trait]
impl NasDriver for UnifiedNas {
    fn family(&self) -> VendorFamily {
        VendorFamily::UnifiedNas
    }

    fn console(&self) -> &str {
        &self.console
    }

    async fn enumerate(&self, pool: &str) -> Result<Vec<NasFs>> {
        Ok(self
            .filesystems()
            .await?
            .into_iter()
            .filter(|(name, _)| in_pool(name, pool))
            .map(|(name, r)| NasFs {
                name,
                online: true,
                size_mb: r.get("Size").and_then(|s| bytes_to_mb(s)),
            })
            .collect())
    }

    #[instrument(skip(self, _cache), fields(console = %self.console))]
    async fn snap(&self, fs: &str, snap_name: &str, _cache: Option<&str>) -> Result<SnapOutcome> {
        let existing = |snaps: Vec<FsSnap>| -> Result<Option<SnapOutcome>> {
            match snaps.into_iter().find(|s| s.name == snap_name) {
                Some(s) if s.filesystem == fs => Ok(Some(SnapOutcome::AlreadyPresent)),
                Some(s) => Err(Error::NameConflict(format!(
                    "{} exists on {}, expected {}",
                    snap_name, s.filesystem, fs
                ))),
                None => Ok(None),
            }
        };
        if let Some(outcome) = existing(self.snapshots().await?)? {
            info!("Snapshot already present");
            return Ok(outcome);
        }
        let fs_id = self
            .fs_id(fs)
            .await?
            .ok_or_else(|| Error::vendor_fatal(fs, "filesystem not found"))?;
        match self
            .cli
            .run(
                fs,
                &["/prot/snap", "create", "-name", snap_name, "-source", fs_id.as_str()],
            )
            .await
        {
            Ok(_) => {
                info!("Snapshot created");
                Ok(SnapOutcome::Created)
            }
            Err(err) if is_exists(&err) => match existing(self.snapshots().await?)? {
                Some(outcome) => Ok(outcome),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn list_snaps(&self, pool: &str, prefix: &str) -> Result<Vec<FsSnap>> {
        Ok(self
            .snapshots()
            .await?
            .into_iter()
            .filter(|s| s.name.starts_with(prefix) && in_pool(&s.filesystem, pool))
            .collect())
    }

    #[instrument(skip(self), fields(console = %self.console))]
    async fn restore(&self, fs: &str, snap_name: &str) -> Result<()> {
        self.cli
            .run(fs, &["/prot/snap", "-name", snap_name, "restore"])
            .await?;
        info!("Filesystem restored");
        Ok(())
    }

    #[instrument(skip(self), fields(console = %self.console))]
    async fn destroy(&self, fs: &str, snap_name: &str) -> Result<DestroyOutcome> {
        match self
            .cli
            .run(fs, &["/prot/snap", "-name", snap_name, "delete"])
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Destroyed),
            Err(err) if is_not_found(&err) => Ok(DestroyOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }

    async fn list_caches(&self) -> Result<Vec<CacheInfo>> {
        Ok(Vec::new())
    }

    async fn create_cache(&self, name: &str, _size_mb: u64, _pool: &str) -> Result<SnapOutcome> {
        debug!(cache = %name, "No rollback cache on this family");
        Ok(SnapOutcome::AlreadyPresent)
    }

    async fn destroy_cache(&self, _name: &str) -> Result<DestroyOutcome> {
        Ok(DestroyOutcome::AlreadyAbsent)
    }

    async fn offline(&self, _fs: &str) -> Result<()> {
        Ok(())
    }

    async fn online(&self, _fs: &str) -> Result<()> {
        Ok(())
    }

    async fn list_exports(&self, pool: &str) -> Result<ExportMap> {
        let mut exports = ExportMap::new();
        for (fs, share) in self.shares().await? {
            if !in_pool(&fs, pool) {
                continue;
            }
            let entry = exports.entry(fs).or_default();
            entry.extend(share.root_hosts.iter().map(|h| NfsExport::new(h, ROOT_OPTIONS)));
            entry.extend(share.rw_hosts.iter().map(|h| NfsExport::new(h, RW_OPTIONS)));
        }
        Ok(exports)
    }

    async fn add_export(&self, fs: &str, export: &NfsExport) -> Result<()> {
        let root = export.options.contains("no_root_squash");
        match self.shares().await?.remove(fs) {
            Some(mut share) => {
                let hosts = if root {
                    &mut share.root_hosts
                } else {
                    &mut share.rw_hosts
                };
                if hosts.contains(&export.client) {
                    return Ok(());
                }
                hosts.push(export.client.clone());
                self.set_hosts(fs, &share).await
            }
            None => {
                let fs_id = self
                    .fs_id(fs)
                    .await?
                    .ok_or_else(|| Error::vendor_fatal(fs, "filesystem not found"))?;
                let flag = if root { "-rootHosts" } else { "-rwHosts" };
                self.cli
                    .run(
                        fs,
                        &[
                            "/stor/prov/fs/nfs",
                            "create",
                            "-name",
                            fs,
                            "-fs",
                            fs_id.as_str(),
                            "-path",
                            "/",
                            flag,
                            export.client.as_str(),
                        ],
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn remove_export(&self, fs: &str, client: &str) -> Result<()> {
        let mut share = match self.shares().await?.remove(fs) {
            Some(share) => share,
            None => return Ok(()),
        };
        let before = share.root_hosts.len() + share.rw_hosts.len();
        share.root_hosts.retain(|h| h != client);
        share.rw_hosts.retain(|h| h != client);
        if share.root_hosts.len() + share.rw_hosts.len() == before {
            return Ok(());
        }
        if share.root_hosts.is_empty() && share.rw_hosts.is_empty() {
            self.cli
                .run(fs, &["/stor/prov/fs/nfs", "-id", share.id.as_str(), "delete"])
                .await?;
            return Ok(());
        }
        self.set_hosts(fs, &share).await
    }

    #[instrument(skip(self), fields(console = %self.console))]
    async fn destroy_fs(&self, fs: &str) -> Result<DestroyOutcome> {
        let fs_id = match self.fs_id(fs).await? {
            Some(id) => id,
            None => return Ok(DestroyOutcome::AlreadyAbsent),
        };
        match self
            .cli
            .run(fs, &["/stor/prov/fs", "-id", fs_id.as_str(), "delete"])
            .await
        {
            Ok(_) => {
                info!("Filesystem destroyed");
                Ok(DestroyOutcome::Destroyed)
            }
            Err(err) if is_not_found(&err) => Ok(DestroyOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }
}
