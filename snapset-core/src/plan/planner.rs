//! Builds create, restore and remove plans from a set's membership.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::{Action, Membership, Plan, PlanBuilder, PlanKind, PlanState, Tier};
use crate::context::Context;
use crate::drivers::rollback_cache_size_mb;
use crate::error::Result;
use crate::model::{DatabaseKind, NfsExport, ProviderKind};
use crate::naming::{cache_name, restore_backup_name, SnapNames};
use crate::quiesce::{Participant, Quiescer};
use crate::settings::Settings;

/// Order in which quiesce brackets open.
const BRACKET_ORDER: [DatabaseKind; 4] = [
    DatabaseKind::Directory,
    DatabaseKind::Graph,
    DatabaseKind::Object,
    DatabaseKind::Relational,
];

pub struct Planner<'a> {
    ctx: &'a Context,
    settings: &'a Settings,
    names: &'a SnapNames,
}

impl<'a> Planner<'a> {
    pub fn new(ctx: &'a Context, names: &'a SnapNames) -> Self {
        Self {
            ctx,
            settings: &ctx.settings,
            names,
        }
    }

    /// Databases of `quiescers` that get a bracket: the directory server,
    /// the authoritative one of graph and object, and the relational one.
    pub fn brackets(
        membership: &Membership,
        quiescers: &[Arc<dyn Quiescer>],
    ) -> Vec<Arc<dyn Quiescer>> {
        BRACKET_ORDER
            .iter()
            .filter(|kind| match kind {
                DatabaseKind::Graph | DatabaseKind::Object => **kind == membership.authoritative,
                _ => true,
            })
            .filter_map(|kind| quiescers.iter().find(|q| q.database() == *kind).cloned())
            .collect()
    }

    /// Quiesce brackets, then LUNs, NAS caches and snaps, then volumes.
    ///
    /// `brackets` nest in the given order inside a single step, so they close
    /// in reverse open order; database LUNs without a bracket are snapped
    /// with the other LUNs.
    #[instrument(skip_all, fields(set = %self.names.set()))]
    pub fn create(&self, membership: &Membership, brackets: &[Arc<dyn Quiescer>]) -> Plan {
        let timeouts = &self.settings.timeouts;
        let mut plan = PlanBuilder::new(PlanKind::Create, self.names.set().clone());

        plan.stage("quiesce", Tier::Database, PlanState::Quiescing, true);
        let mut bracketed = Vec::new();
        let mut participants = Vec::new();
        for quiescer in brackets {
            let kind = quiescer.database();
            let luns: Vec<_> = membership
                .database_luns(kind)
                .into_iter()
                .map(|l| l.db_lun())
                .collect();
            if luns.is_empty() {
                debug!(db = %kind, "No LUNs to bracket");
                continue;
            }
            bracketed.push(kind);
            participants.push(Participant {
                quiescer: quiescer.clone(),
                luns,
            });
        }
        if !participants.is_empty() {
            let undo = participants
                .iter()
                .flat_map(|p| &p.luns)
                .map(|l| Action::LunDestroy {
                    san: l.san.clone(),
                    snap_name: l.snap_name.clone(),
                })
                .collect();
            plan.step(
                Action::Bracket {
                    participants,
                    snap_deadline: timeouts.vendor_snap(),
                },
                undo,
                None,
                false,
            );
        }

        plan.stage("lun snapshots", Tier::San, PlanState::Snapping, true);
        for lun in &membership.luns {
            if matches!(lun.database, Some(kind) if bracketed.contains(&kind)) {
                continue;
            }
            plan.step(
                Action::LunSnap {
                    san: lun.san.clone(),
                    lun_id: lun.lun_id.clone(),
                    snap_name: lun.snap_name.clone(),
                },
                vec![Action::LunDestroy {
                    san: lun.san.clone(),
                    snap_name: lun.snap_name.clone(),
                }],
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("rollback caches", Tier::Nas, PlanState::Snapping, true);
        for (pool, nas) in membership.nas_pools() {
            if !nas.uses_rollback_cache() {
                continue;
            }
            let size_mb = rollback_cache_size_mb(
                membership
                    .filesystems
                    .iter()
                    .filter(|f| f.pool == pool && f.nas.console() == nas.console())
                    .map(|f| (f.size_mb, f.snap_size)),
            );
            let name = cache_name(&pool);
            plan.step(
                Action::CacheCreate {
                    nas: nas.clone(),
                    pool: pool.clone(),
                    name: name.clone(),
                    size_mb,
                },
                vec![Action::CacheRelease { nas, pool, name }],
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("nas snapshots", Tier::Nas, PlanState::Snapping, true);
        for fs in &membership.filesystems {
            let cache = fs.nas.uses_rollback_cache().then(|| cache_name(&fs.pool));
            plan.step(
                Action::FsSnap {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                    snap_name: fs.snap_name.clone(),
                    cache,
                },
                vec![Action::FsDestroy {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                    snap_name: fs.snap_name.clone(),
                }],
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("volume snapshots", Tier::Volume, PlanState::Snapping, true);
        for member in &membership.volumes {
            plan.step(
                Action::VolSnap {
                    vol: self.ctx.vol.clone(),
                    host: member.host.clone(),
                    volume: member.volume.clone(),
                    snap_name: member.snap_name.clone(),
                },
                vec![Action::VolDestroy {
                    vol: self.ctx.vol.clone(),
                    host: member.host.clone(),
                    snap_path: member.snap_path(),
                }],
                Some(timeouts.rpc_deadline()),
                true,
            );
        }

        let plan = plan.finish();
        info!(steps = plan.step_count(), "Create plan built");
        plan
    }

    /// Volumes, then NAS filesystems, then LUNs, then database re-import.
    ///
    /// `exports` are the exports recorded at create time; filesystems without
    /// a record fall back to the exports declared in the model.
    #[instrument(skip_all, fields(set = %self.names.set()))]
    pub fn restore(
        &self,
        membership: &Membership,
        exports: &BTreeMap<String, Vec<NfsExport>>,
        directory: Option<Arc<dyn Quiescer>>,
    ) -> Plan {
        let timeouts = &self.settings.timeouts;
        let nas_settings = &self.settings.nas;
        let mut plan = PlanBuilder::new(PlanKind::Restore, self.names.set().clone());

        plan.stage("volume restore", Tier::Volume, PlanState::Snapping, true);
        for member in &membership.volumes {
            plan.step(
                Action::VolRestore {
                    vol: self.ctx.vol.clone(),
                    host: member.host.clone(),
                    snap_path: member.snap_path(),
                },
                Vec::new(),
                Some(timeouts.rpc_deadline()),
                true,
            );
        }

        let offline_first: Vec<_> = membership
            .filesystems
            .iter()
            .filter(|f| f.nas.uses_rollback_cache())
            .collect();
        let export_list = |fs: &str, declared: &[NfsExport]| -> Vec<NfsExport> {
            exports
                .get(fs)
                .cloned()
                .unwrap_or_else(|| declared.to_vec())
        };

        plan.stage("nas unexport", Tier::Nas, PlanState::Snapping, true);
        for fs in &offline_first {
            let clients: Vec<String> = export_list(&fs.name, &fs.exports)
                .into_iter()
                .map(|e| e.client)
                .collect();
            if clients.is_empty() {
                continue;
            }
            plan.step(
                Action::FsUnexport {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                    clients,
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("nas offline", Tier::Nas, PlanState::Snapping, true);
        for fs in &offline_first {
            plan.step(
                Action::FsOffline {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("nas restore", Tier::Nas, PlanState::Snapping, true);
        for fs in &membership.filesystems {
            plan.step(
                Action::FsRestore {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                    snap_name: fs.snap_name.clone(),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("nas online", Tier::Nas, PlanState::Snapping, true);
        for fs in &offline_first {
            plan.step(
                Action::FsOnline {
                    nas: fs.nas.clone(),
                    fs: fs.name.clone(),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("nas export", Tier::Nas, PlanState::Snapping, true);
        for fs in &offline_first {
            let wanted = export_list(&fs.name, &fs.exports);
            if wanted.is_empty() {
                continue;
            }
            plan.step(
                Action::FsExport {
                    nas: fs.nas.clone(),
                    pool: fs.pool.clone(),
                    fs: fs.name.clone(),
                    exports: wanted,
                    attempts: nas_settings.export_attempts,
                    spacing: nas_settings.retry_spacing(),
                },
                Vec::new(),
                None,
                false,
            );
        }

        plan.stage("lun restore", Tier::San, PlanState::Snapping, true);
        for lun in &membership.luns {
            plan.step(
                Action::LunRestore {
                    san: lun.san.clone(),
                    lun_id: lun.lun_id.clone(),
                    snap_name: lun.snap_name.clone(),
                    backup_name: restore_backup_name(
                        &self.settings.san.restore_backup_prefix,
                        &lun.lun_id,
                    ),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("database re-import", Tier::Database, PlanState::Snapping, true);
        if let Some(quiescer) = directory {
            plan.step(Action::AfterRestore { quiescer }, Vec::new(), None, false);
        }

        let plan = plan.finish();
        info!(steps = plan.step_count(), "Restore plan built");
        plan
    }

    /// Destroy whatever of the set the tiers still report.
    ///
    /// Listing the live state keeps a repeated remove a no-op.
    #[instrument(skip_all, fields(set = %self.names.set()))]
    pub async fn remove(
        &self,
        membership: &Membership,
        directory: Option<Arc<dyn Quiescer>>,
    ) -> Result<Plan> {
        let ctx = self.ctx;
        let timeouts = &self.settings.timeouts;
        let names = self.names;
        let mut plan = PlanBuilder::new(PlanKind::Remove, names.set().clone());

        plan.stage("volume snapshots", Tier::Volume, PlanState::Snapping, true);
        let prefix = names.volume_prefix();
        for host in membership.volume_hosts() {
            let listed = ctx.vol.enumerate(&host, Some(&self.settings.lvm.tag)).await?;
            for lv in listed
                .into_iter()
                .filter(|lv| lv.is_snapshot() && lv.name.starts_with(&prefix))
            {
                plan.step(
                    Action::VolDestroy {
                        vol: ctx.vol.clone(),
                        host: host.clone(),
                        snap_path: lv.path,
                    },
                    Vec::new(),
                    Some(timeouts.rpc_deadline()),
                    true,
                );
            }
        }

        let nas_prefix = names.nas_prefix();
        let mut nas_pools = Vec::new();
        for provider in ctx.model.list_storage_providers() {
            if ctx.model.provider(provider).kind() != ProviderKind::Nas {
                continue;
            }
            let nas = ctx.nas(provider)?;
            for pool in ctx.model.pools_of(provider) {
                nas_pools.push((ctx.model.pool(*pool).name.clone(), nas.clone()));
            }
        }

        plan.stage("nas snapshots", Tier::Nas, PlanState::Snapping, true);
        for (pool, nas) in &nas_pools {
            for snap in nas.list_snaps(pool, &nas_prefix).await? {
                if names.fs_of(&snap.name).is_none() {
                    continue;
                }
                plan.step(
                    Action::FsDestroy {
                        nas: nas.clone(),
                        fs: snap.filesystem,
                        snap_name: snap.name,
                    },
                    Vec::new(),
                    Some(timeouts.vendor_snap()),
                    true,
                );
            }
        }

        plan.stage("rollback caches", Tier::Nas, PlanState::Snapping, true);
        for (pool, nas) in &nas_pools {
            if !nas.uses_rollback_cache() {
                continue;
            }
            let name = cache_name(pool);
            if !nas.list_caches().await?.iter().any(|c| c.name == name) {
                continue;
            }
            plan.step(
                Action::CacheRelease {
                    nas: nas.clone(),
                    pool: pool.clone(),
                    name,
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("retired filesystems", Tier::Nas, PlanState::Snapping, true);
        for fs in &membership.retired {
            let present = fs.nas.enumerate(&fs.pool).await?.iter().any(|f| f.name == fs.name);
            if !present {
                continue;
            }
            plan.step(
                Action::FsRetire {
                    nas: fs.nas.clone(),
                    pool: fs.pool.clone(),
                    fs: fs.name.clone(),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("lun snapshots", Tier::San, PlanState::Snapping, true);
        let backup_prefix = &self.settings.san.restore_backup_prefix;
        let mut sans: Vec<_> = ctx.sans().map(|(_, san)| san.clone()).collect();
        sans.sort_by(|a, b| a.array().cmp(b.array()));
        for san in &sans {
            for snap in san.list_snaps(&names.lun_prefix()).await? {
                if names.lun_id_of(&snap.name).is_none() || snap.name.starts_with(backup_prefix.as_str())
                {
                    continue;
                }
                plan.step(
                    Action::LunDestroy {
                        san: san.clone(),
                        snap_name: snap.name,
                    },
                    Vec::new(),
                    Some(timeouts.vendor_snap()),
                    true,
                );
            }
        }

        plan.stage("restore backups", Tier::San, PlanState::Snapping, true);
        for san in &sans {
            if san.list_snaps(backup_prefix).await?.is_empty() {
                continue;
            }
            plan.step(
                Action::BackupCleanup {
                    san: san.clone(),
                    prefix: backup_prefix.clone(),
                },
                Vec::new(),
                Some(timeouts.vendor_snap()),
                true,
            );
        }

        plan.stage("database cleanup", Tier::Database, PlanState::Snapping, true);
        if let Some(quiescer) = directory {
            plan.step(Action::Cleanup { quiescer }, Vec::new(), None, false);
        }

        let plan = plan.finish();
        info!(steps = plan.step_count(), "Remove plan built");
        Ok(plan)
    }
}
