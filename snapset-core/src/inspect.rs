//! List and validate.
//!
//! Reconciles the canonical names a set should have with what every tier
//! reports under the set's prefixes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::metadata::{SetMetadata, SetState};
use crate::model::{DatabaseKind, ProviderKind};
use crate::naming::{cache_name, SetName, SnapNames};
use crate::plan::{Membership, Tier};

/// Whether a snapshot the set should have is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
    /// Carries the set's prefix but no member owns it.
    Orphan,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub tier: Tier,
    pub resource: String,
    pub snap_name: String,
    /// Array, console or host.
    pub location: String,
    pub presence: Presence,
    /// False for an invalidated or full volume snapshot.
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub pool: String,
    pub name: String,
    /// `None` when the cache does not exist.
    pub used_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetReport {
    pub set: SetName,
    pub created_at: Option<DateTime<Utc>>,
    pub state: Option<SetState>,
    pub authoritative: DatabaseKind,
    pub entries: Vec<Entry>,
    pub caches: Vec<CacheReport>,
}

impl SetReport {
    /// Anything with the set's names on any tier.
    pub fn has_artifacts(&self) -> bool {
        self.entries.iter().any(|e| e.presence != Presence::Absent)
    }

    pub fn missing(&self) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.presence == Presence::Absent)
            .collect()
    }

    pub fn orphans(&self) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.presence == Presence::Orphan)
            .collect()
    }
}

/// Observe every tier for `names`' set.
#[instrument(skip_all, fields(set = %names.set()))]
pub async fn inspect(
    ctx: &Context,
    names: &SnapNames,
    membership: &Membership,
    metadata: Option<&SetMetadata>,
) -> Result<SetReport> {
    let expected: BTreeMap<String, _> = membership
        .manifest(&[])
        .into_iter()
        .map(|e| (e.snap_name.clone(), e))
        .collect();
    let mut found: BTreeMap<String, (bool, Option<Entry>)> = BTreeMap::new();
    let backup_prefix = &ctx.settings.san.restore_backup_prefix;

    // SAN
    let lun_prefix = names.lun_prefix();
    for (_, san) in ctx.sans() {
        for snap in san.list_snaps(&lun_prefix).await? {
            if snap.name.starts_with(backup_prefix.as_str()) || names.lun_id_of(&snap.name).is_none() {
                continue;
            }
            let orphan = Entry {
                tier: Tier::San,
                resource: snap.lun_id.clone(),
                snap_name: snap.name.clone(),
                location: san.array().to_string(),
                presence: Presence::Orphan,
                valid: true,
            };
            found.insert(snap.name, (true, Some(orphan)));
        }
    }

    // NAS
    let nas_prefix = names.nas_prefix();
    for provider in ctx.model.list_storage_providers() {
        if ctx.model.provider(provider).kind() != ProviderKind::Nas {
            continue;
        }
        let nas = ctx.nas(provider)?;
        for pool in ctx.model.pools_of(provider) {
            let pool = &ctx.model.pool(*pool).name;
            for snap in nas.list_snaps(pool, &nas_prefix).await? {
                if names.fs_of(&snap.name).is_none() {
                    continue;
                }
                let orphan = Entry {
                    tier: Tier::Nas,
                    resource: snap.filesystem.clone(),
                    snap_name: snap.name.clone(),
                    location: nas.console().to_string(),
                    presence: Presence::Orphan,
                    valid: true,
                };
                found.insert(snap.name, (true, Some(orphan)));
            }
        }
    }

    // Volumes
    let volume_prefix = names.volume_prefix();
    let mut hosts: BTreeSet<String> = membership.volume_hosts().into_iter().collect();
    hosts.insert(ctx.model.ms_hostname().to_string());
    for host in hosts {
        let listed = ctx.vol.enumerate(&host, Some(&ctx.settings.lvm.tag)).await?;
        for lv in listed
            .into_iter()
            .filter(|lv| lv.is_snapshot() && lv.name.starts_with(&volume_prefix))
        {
            let orphan = Entry {
                tier: Tier::Volume,
                resource: format!("{}/{}", lv.vg, lv.origin),
                snap_name: lv.name.clone(),
                location: host.clone(),
                presence: Presence::Orphan,
                valid: lv.is_valid(),
            };
            let valid = lv.is_valid();
            found.insert(lv.name, (valid, Some(orphan)));
        }
    }

    let mut entries: Vec<Entry> = expected
        .values()
        .map(|e| {
            let seen = found.remove(&e.snap_name);
            Entry {
                tier: e.tier,
                resource: e.resource.clone(),
                snap_name: e.snap_name.clone(),
                location: e.location.clone(),
                presence: if seen.is_some() {
                    Presence::Present
                } else {
                    Presence::Absent
                },
                valid: seen.map(|(valid, _)| valid).unwrap_or(true),
            }
        })
        .collect();
    let orphans: Vec<Entry> = found.into_values().filter_map(|(_, e)| e).collect();
    for orphan in &orphans {
        warn!(snap = %orphan.snap_name, location = %orphan.location, "Orphan snapshot");
    }
    entries.extend(orphans);

    // Rollback caches
    let mut caches = Vec::new();
    for (pool, nas) in membership.nas_pools() {
        if !nas.uses_rollback_cache() {
            continue;
        }
        let name = cache_name(&pool);
        let used_percent = nas
            .list_caches()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.used_percent());
        caches.push(CacheReport {
            pool,
            name,
            used_percent,
        });
    }

    let report = SetReport {
        set: names.set().clone(),
        created_at: metadata.map(|m| m.created_at),
        state: metadata.map(|m| m.state),
        authoritative: membership.authoritative,
        entries,
        caches,
    };
    info!(
        entries = report.entries.len(),
        missing = report.missing().len(),
        orphans = report.orphans().len(),
        "Set inspected"
    );
    Ok(report)
}

// =============================================================================
// Verdict
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Offense {
    pub kind: ErrorKind,
    pub resource: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub offenders: Vec<Offense>,
}

impl Verdict {
    /// The first offense as an error.
    pub fn into_result(self) -> Result<()> {
        let Some(first) = self.offenders.into_iter().next() else {
            return Ok(());
        };
        Err(match first.kind {
            ErrorKind::OrphanSnapshot => Error::OrphanSnapshot(first.message),
            ErrorKind::SnapshotInvalid => Error::SnapshotInvalid(first.message),
            _ => Error::MissingExpected(first.message),
        })
    }
}

/// Hard assertions over a report; caches at or above `cache_threshold`
/// percent fail.
pub fn validate(report: &SetReport, cache_threshold: f64) -> Verdict {
    let mut offenders = Vec::new();
    for entry in &report.entries {
        match entry.presence {
            Presence::Absent => offenders.push(Offense {
                kind: ErrorKind::MissingExpected,
                resource: entry.resource.clone(),
                message: format!("{} has no snapshot {}", entry.resource, entry.snap_name),
            }),
            Presence::Orphan => offenders.push(Offense {
                kind: ErrorKind::OrphanSnapshot,
                resource: entry.resource.clone(),
                message: format!(
                    "{} on {} belongs to no member of {}",
                    entry.snap_name, entry.location, report.set
                ),
            }),
            Presence::Present if !entry.valid => offenders.push(Offense {
                kind: ErrorKind::SnapshotInvalid,
                resource: entry.resource.clone(),
                message: format!("{} on {} is invalid or full", entry.snap_name, entry.location),
            }),
            Presence::Present => {}
        }
    }
    for cache in &report.caches {
        match cache.used_percent {
            None => offenders.push(Offense {
                kind: ErrorKind::MissingExpected,
                resource: cache.pool.clone(),
                message: format!("rollback cache {} does not exist", cache.name),
            }),
            Some(used) if used >= cache_threshold || used >= 100.0 => offenders.push(Offense {
                kind: ErrorKind::SnapshotInvalid,
                resource: cache.pool.clone(),
                message: format!("rollback cache {} is {:.0}% used", cache.name, used),
            }),
            Some(_) => {}
        }
    }
    Verdict {
        passed: offenders.is_empty(),
        offenders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(snap: &str, presence: Presence, valid: bool) -> Entry {
        Entry {
            tier: Tier::San,
            resource: "lun1".to_string(),
            snap_name: snap.to_string(),
            location: "san1".to_string(),
            presence,
            valid,
        }
    }

    fn report(entries: Vec<Entry>, caches: Vec<CacheReport>) -> SetReport {
        SetReport {
            set: SetName::new("s1").unwrap(),
            created_at: None,
            state: None,
            authoritative: DatabaseKind::Graph,
            entries,
            caches,
        }
    }

    #[test]
    fn test_clean_report_passes() {
        let r = report(
            vec![entry("s1_1", Presence::Present, true)],
            vec![CacheReport {
                pool: "pool1".to_string(),
                name: "pool1-cache".to_string(),
                used_percent: Some(12.0),
            }],
        );
        let verdict = validate(&r, 80.0);
        assert!(verdict.passed);
        assert!(verdict.into_result().is_ok());
    }

    #[test]
    fn test_offenders() {
        let r = report(
            vec![
                entry("s1_1", Presence::Absent, true),
                entry("s1_9", Presence::Orphan, true),
                entry("s1_2", Presence::Present, false),
            ],
            vec![CacheReport {
                pool: "pool1".to_string(),
                name: "pool1-cache".to_string(),
                used_percent: Some(100.0),
            }],
        );
        let verdict = validate(&r, 80.0);
        let kinds: Vec<ErrorKind> = verdict.offenders.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::MissingExpected,
                ErrorKind::OrphanSnapshot,
                ErrorKind::SnapshotInvalid,
                ErrorKind::SnapshotInvalid,
            ]
        );
        assert!(!verdict.passed);
        assert!(matches!(verdict.into_result(), Err(Error::MissingExpected(_))));
    }

    #[test]
    fn test_missing_cache_fails() {
        let r = report(
            Vec::new(),
            vec![CacheReport {
                pool: "pool1".to_string(),
                name: "pool1-cache".to_string(),
                used_percent: None,
            }],
        );
        assert_eq!(validate(&r, 80.0).offenders[0].kind, ErrorKind::MissingExpected);
    }

    #[test]
    fn test_has_artifacts() {
        assert!(!report(vec![entry("s1_1", Presence::Absent, true)], Vec::new()).has_artifacts());
        assert!(report(vec![entry("s1_9", Presence::Orphan, true)], Vec::new()).has_artifacts());
    }
}
