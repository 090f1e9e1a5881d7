//! Which resources a set is made of.
//!
//! Membership is computed from the model on every run and resolved against
//! the arrays, so canonical names always carry the array-side LUN id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::Tier;
use crate::cluster::{online_systems, FreezeState, GroupState, GroupStates};
use crate::context::Context;
use crate::drivers::{ArrayLun, NasDriver, SanDriver};
use crate::error::{Error, Result};
use crate::metadata::ManifestEntry;
use crate::model::{DatabaseKind, GroupKind, LocalVolume, NfsExport, ProviderKind};
use crate::naming::SnapNames;
use crate::quiesce::DbLun;

#[derive(Clone)]
pub struct MemberLun {
    pub name: String,
    /// Array-side id.
    pub lun_id: String,
    pub pool: String,
    pub database: Option<DatabaseKind>,
    pub snap_name: String,
    pub san: Arc<dyn SanDriver>,
}

impl MemberLun {
    pub fn db_lun(&self) -> DbLun {
        DbLun {
            name: self.name.clone(),
            lun_id: self.lun_id.clone(),
            snap_name: self.snap_name.clone(),
            san: self.san.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MemberFs {
    pub name: String,
    pub pool: String,
    pub snap_name: String,
    pub size_mb: u64,
    pub snap_size: u8,
    /// Exports declared in the model.
    pub exports: Vec<NfsExport>,
    pub nas: Arc<dyn NasDriver>,
}

#[derive(Debug, Clone)]
pub struct MemberVolume {
    pub host: String,
    pub volume: LocalVolume,
    pub snap_name: String,
}

impl MemberVolume {
    pub fn snap_path(&self) -> String {
        format!("/dev/{}/{}", self.volume.vg, self.snap_name)
    }
}

/// A filesystem whose service has left the model.
#[derive(Clone)]
pub struct RetiredFs {
    pub name: String,
    pub pool: String,
    pub nas: Arc<dyn NasDriver>,
}

/// Resources of one set.
#[derive(Clone)]
pub struct Membership {
    pub authoritative: DatabaseKind,
    pub luns: Vec<MemberLun>,
    pub filesystems: Vec<MemberFs>,
    pub volumes: Vec<MemberVolume>,
    pub retired: Vec<RetiredFs>,
}

impl Membership {
    /// Resolve the model's snappable resources for `names`' set.
    ///
    /// The database that is not authoritative keeps its LUNs out of the set,
    /// and so does the relational database when its service group is absent.
    #[instrument(skip_all, fields(set = %names.set(), authoritative = %authoritative))]
    pub async fn resolve(
        ctx: &Context,
        names: &SnapNames,
        authoritative: DatabaseKind,
    ) -> Result<Self> {
        let model = &ctx.model;
        let relational_deployed = ctx.group_ref(DatabaseKind::Relational)?.is_some();

        let mut array_luns: BTreeMap<(String, String), Vec<ArrayLun>> = BTreeMap::new();
        let mut luns = Vec::new();
        for id in model.list_snappable_luns() {
            let lun = model.lun(id);
            let excluded = match lun.database {
                Some(DatabaseKind::Object) => authoritative == DatabaseKind::Graph,
                Some(DatabaseKind::Graph) => authoritative == DatabaseKind::Object,
                Some(DatabaseKind::Relational) => !relational_deployed,
                _ => false,
            };
            if excluded {
                debug!(lun = %lun.name, "LUN not part of the set");
                continue;
            }

            let pool = &model.pool(lun.pool).name;
            let san = ctx.san_of_pool(lun.pool)?;
            let key = (san.array().to_string(), pool.clone());
            if !array_luns.contains_key(&key) {
                let listed = san.enumerate(pool).await?;
                array_luns.insert(key.clone(), listed);
            }
            let array_lun = array_luns
                .get(&key)
                .and_then(|listed| listed.iter().find(|l| l.name == lun.name))
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "LUN {} not found in pool {} on {}",
                        lun.name,
                        pool,
                        san.array()
                    ))
                })?;
            luns.push(MemberLun {
                name: lun.name.clone(),
                lun_id: array_lun.id.clone(),
                pool: pool.clone(),
                database: lun.database,
                snap_name: names.lun(&array_lun.id),
                san,
            });
        }

        let mut retired = Vec::new();
        let mut retired_names = BTreeSet::new();
        for provider in model.list_storage_providers() {
            if model.provider(provider).kind() != ProviderKind::Nas {
                continue;
            }
            let nas = ctx.nas(provider)?;
            for pool in model.pools_of(provider) {
                for fs in model.filesystems_for_removal(*pool) {
                    retired_names.insert(fs.clone());
                    retired.push(RetiredFs {
                        name: fs,
                        pool: model.pool(*pool).name.clone(),
                        nas: nas.clone(),
                    });
                }
            }
        }

        let mut filesystems = Vec::new();
        for id in model.list_snappable_filesystems() {
            let fs = model.filesystem(id);
            if retired_names.contains(&fs.name) {
                debug!(fs = %fs.name, "Filesystem is for removal, not snapped");
                continue;
            }
            filesystems.push(MemberFs {
                name: fs.name.clone(),
                pool: model.pool(fs.pool).name.clone(),
                snap_name: names.nas(&fs.name),
                size_mb: fs.size_mb,
                snap_size: fs.snap_size,
                exports: fs.exports.clone(),
                nas: ctx.nas_of_pool(fs.pool)?,
            });
        }

        let ms_live = ctx.vol.enumerate(model.ms_hostname(), None).await?;
        let mut volumes = Vec::new();
        for (host, groups) in model.list_snappable_local_volumes(&ms_live)? {
            for (vg, lvs) in groups {
                for volume in lvs {
                    volumes.push(MemberVolume {
                        host: host.clone(),
                        snap_name: names.volume(&vg, &volume.lv),
                        volume,
                    });
                }
            }
        }

        info!(
            luns = luns.len(),
            filesystems = filesystems.len(),
            volumes = volumes.len(),
            retired = retired.len(),
            "Set membership resolved"
        );
        Ok(Self {
            authoritative,
            luns,
            filesystems,
            volumes,
            retired,
        })
    }

    /// LUNs of a database.
    pub fn database_luns(&self, kind: DatabaseKind) -> Vec<&MemberLun> {
        self.luns
            .iter()
            .filter(|l| l.database == Some(kind))
            .collect()
    }

    /// Pools the set touches.
    pub fn pools(&self) -> Vec<String> {
        let pools: BTreeSet<&String> = self
            .luns
            .iter()
            .map(|l| &l.pool)
            .chain(self.filesystems.iter().map(|f| &f.pool))
            .collect();
        pools.into_iter().cloned().collect()
    }

    /// NAS pools with at least one member filesystem, with their driver.
    pub fn nas_pools(&self) -> Vec<(String, Arc<dyn NasDriver>)> {
        let mut pools: Vec<(String, Arc<dyn NasDriver>)> = Vec::new();
        for fs in &self.filesystems {
            if !pools.iter().any(|(p, n)| *p == fs.pool && n.console() == fs.nas.console()) {
                pools.push((fs.pool.clone(), fs.nas.clone()));
            }
        }
        pools
    }

    /// Hosts with member volumes.
    pub fn volume_hosts(&self) -> Vec<String> {
        let hosts: BTreeSet<&String> = self.volumes.iter().map(|v| &v.host).collect();
        hosts.into_iter().cloned().collect()
    }

    /// Every snapshot the set is made of, sorted.
    pub fn manifest(&self, quiesced: &[DatabaseKind]) -> Vec<ManifestEntry> {
        let mut entries: Vec<ManifestEntry> = self
            .luns
            .iter()
            .map(|l| ManifestEntry {
                tier: match l.database {
                    Some(kind) if quiesced.contains(&kind) => Tier::Database,
                    _ => Tier::San,
                },
                resource: l.name.clone(),
                snap_name: l.snap_name.clone(),
                location: l.san.array().to_string(),
            })
            .chain(self.filesystems.iter().map(|f| ManifestEntry {
                tier: Tier::Nas,
                resource: f.name.clone(),
                snap_name: f.snap_name.clone(),
                location: f.nas.console().to_string(),
            }))
            .chain(self.volumes.iter().map(|v| ManifestEntry {
                tier: Tier::Volume,
                resource: format!("{}/{}", v.volume.vg, v.volume.lv),
                snap_name: v.snap_name.clone(),
                location: v.host.clone(),
            }))
            .collect();
        entries.sort();
        entries
    }
}

// =============================================================================
// Authoritative database
// =============================================================================

/// Live state of a database service group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupObservation {
    pub kind: GroupKind,
    pub states: GroupStates,
    pub frozen: FreezeState,
}

impl GroupObservation {
    pub fn is_active(&self) -> bool {
        !online_systems(&self.states).is_empty()
    }

    fn any_offline(&self) -> bool {
        self.states.values().any(|s| *s != GroupState::Online)
    }
}

/// Decide which of the graph and object databases owns the application
/// data, failing when live state contradicts `graph_flag`.
///
/// A database whose service group is not deployed skips every rule that
/// involves it.
pub fn authoritative_db(
    graph: Option<&GroupObservation>,
    object: Option<&GroupObservation>,
    graph_flag: bool,
) -> Result<DatabaseKind> {
    let invalid = |msg: &str| -> Result<DatabaseKind> { Err(Error::InvalidState(msg.to_string())) };

    if graph_flag {
        if let Some(object) = object {
            if object.is_active() {
                return invalid("graph database is authoritative but the object database is online");
            }
            if !object.frozen.persistent {
                return invalid("object database is offline but not persistently frozen");
            }
        }
        if let Some(graph) = graph {
            if !graph.is_active() {
                return invalid("graph database is authoritative but offline on every node");
            }
            if graph.kind == GroupKind::Parallel && graph.any_offline() {
                return invalid("graph database is not online on every node");
            }
        }
        Ok(DatabaseKind::Graph)
    } else {
        if let Some(object) = object {
            if !object.is_active() {
                return invalid("object database is authoritative but not online");
            }
        }
        if let Some(graph) = graph {
            if graph.is_active() {
                return invalid("object database is authoritative but the graph database is online");
            }
            if !graph.frozen.persistent {
                return invalid("graph database is offline but not persistently frozen");
            }
        }
        Ok(DatabaseKind::Object)
    }
}
