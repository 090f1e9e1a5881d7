//! The five coordinator operations.
//!
//! Each operation loads the model, builds a [`Context`], resolves the set's
//! membership and hands a plan to the [`Executor`]. The set's metadata
//! record is written as `partial` before the first snapshot and flipped to
//! `complete` only after verification.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::context::{Context, DriverFactory};
use crate::credentials::Decrypter;
use crate::drivers::rollback_cache_size_mb;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CancelFlag, Executor, RunReport, StepRecord};
use crate::inspect::{inspect, validate, Offense, Presence, SetReport, Verdict};
use crate::metadata::{ManifestEntry, MetadataStore, SetMetadata, SetState};
use crate::model::{DatabaseKind, GroupKind, ModelReader, NfsExport};
use crate::naming::{cache_name, SetName, SetSelector, SnapNames};
use crate::plan::{
    authoritative_db, GroupObservation, Membership, PlanState, Planner, Progress,
};
use crate::settings::Settings;

/// Options of [`Coordinator::create_snapshot`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Leave whatever was created in place when a step fails.
    pub keep_on_failure: bool,
}

pub struct Coordinator {
    settings: Settings,
    reader: ModelReader,
    factory: Arc<dyn DriverFactory>,
    decrypter: Arc<dyn Decrypter>,
    store: MetadataStore,
    cancel: CancelFlag,
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        reader: ModelReader,
        factory: Arc<dyn DriverFactory>,
        decrypter: Arc<dyn Decrypter>,
        store: MetadataStore,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            settings,
            reader,
            factory,
            decrypter,
            store,
            cancel,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn names(&self, set: &SetName) -> SnapNames {
        SnapNames::new(set.clone(), self.settings.is_default_set(set.as_str()))
    }

    fn executor(&self) -> Executor {
        Executor::new(self.settings.executor.clone(), self.cancel.clone())
    }

    async fn context(&self) -> Result<Context> {
        let model = self.reader.load().await?;
        Context::build(
            self.settings.clone(),
            model,
            self.factory.as_ref(),
            self.decrypter.clone(),
        )
        .await
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Take every snapshot of `set`, quiescing databases around their LUNs.
    ///
    /// Running it again for a complete set is a no-op; for a partial set it
    /// takes whatever is missing.
    #[instrument(skip(self, options), fields(set = %set))]
    pub async fn create_snapshot(
        &self,
        set: &SetName,
        options: CreateOptions,
    ) -> Result<Vec<ManifestEntry>> {
        let names = self.names(set);
        let mut progress = Progress::new(set.clone());
        progress.advance(PlanState::Preflight)?;

        self.reader.ensure_no_running_plan().await?;
        let ctx = self.context().await?;
        let authoritative = observe_authoritative(&ctx).await?;
        let membership = Membership::resolve(&ctx, &names, authoritative).await?;

        let existing = self.store.load(set)?;
        let report = inspect(&ctx, &names, &membership, existing.as_ref()).await?;
        match &existing {
            Some(record) if record.is_complete() && report.missing().is_empty() => {
                info!("Snapshot set already complete");
                return Ok(record.manifest.clone());
            }
            None if report.has_artifacts() => {
                return Err(Error::NameConflict(format!(
                    "snapshots named {} exist but no set was recorded",
                    set
                )));
            }
            _ => {}
        }

        let mut quiescers = Vec::new();
        for kind in DatabaseKind::ALL {
            if let Some(q) = ctx.quiescer(kind)? {
                quiescers.push(q);
            }
        }
        let brackets = Planner::brackets(&membership, &quiescers);
        for quiescer in &brackets {
            quiescer.preflight().await?;
        }
        check_capacity(&ctx, &membership).await?;

        let quiesced: Vec<DatabaseKind> = brackets.iter().map(|q| q.database()).collect();
        let mut record = existing.unwrap_or_else(|| SetMetadata::new(set.clone()));
        record.state = SetState::Partial;
        record.authoritative_db = Some(authoritative);
        record.pools = membership.pools();
        record.exports = observe_exports(&membership).await?;
        record.manifest = membership.manifest(&quiesced);
        self.store.save(&record)?;

        let plan = Planner::new(&ctx, &names).create(&membership, &brackets);
        let executor = self.executor();
        let mut run = executor
            .run(&plan, &mut progress, !options.keep_on_failure)
            .await;
        if let Some(err) = run.error.take() {
            self.settle_failed_create(set, &run)?;
            return Err(err);
        }

        progress.advance(PlanState::Verifying)?;
        let report = inspect(&ctx, &names, &membership, Some(&record)).await?;
        if let Err(e) = require_usable(&report) {
            error!(error = %e, "Snapshot set failed verification");
            if options.keep_on_failure {
                if let Err(advance) = progress.advance(PlanState::Failed) {
                    warn!(error = %advance, "Failed to record failed state");
                }
            } else {
                executor.roll_back(&mut run, &mut progress).await;
            }
            self.settle_failed_create(set, &run)?;
            return Err(e);
        }
        record.state = SetState::Complete;
        self.store.save(&record)?;
        progress.advance(PlanState::Done)?;
        info!(snapshots = record.manifest.len(), "Snapshot set created");
        Ok(record.manifest)
    }

    /// Drop the record when every compensation went through; otherwise the
    /// set stays `partial` for a later create or remove.
    fn settle_failed_create(&self, set: &SetName, run: &RunReport) -> Result<()> {
        let undone = run.compensated && run.compensations.iter().all(|r| r.error.is_none());
        if undone {
            self.store.delete(set)?;
            info!("Create rolled back");
        } else {
            warn!("Create failed, set left partial");
        }
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Destroy every snapshot carrying `set`'s names, its caches once unused,
    /// and the record.
    ///
    /// Without a record, `force` is needed to remove leftovers.
    #[instrument(skip(self), fields(set = %set))]
    pub async fn remove_snapshots(&self, set: &SetName, force: bool) -> Result<Vec<StepRecord>> {
        let names = self.names(set);
        let mut progress = Progress::new(set.clone());
        progress.advance(PlanState::Preflight)?;

        self.reader.ensure_no_running_plan().await?;
        let ctx = self.context().await?;
        let existing = self.store.load(set)?;
        let authoritative = recorded_authoritative(&ctx, existing.as_ref());
        let membership = Membership::resolve(&ctx, &names, authoritative).await?;

        if existing.is_none() && !force {
            let report = inspect(&ctx, &names, &membership, None).await?;
            if report.has_artifacts() {
                return Err(Error::NoNamedSet(format!(
                    "{} (snapshots exist without a record, use --force)",
                    set
                )));
            }
            info!("Nothing to remove");
            return Ok(Vec::new());
        }

        let directory = ctx.quiescer(DatabaseKind::Directory)?;
        let plan = Planner::new(&ctx, &names).remove(&membership, directory).await?;
        let steps = self.executor().run(&plan, &mut progress, false).await.into_result()?;

        progress.advance(PlanState::Verifying)?;
        self.store.delete(set)?;
        progress.advance(PlanState::Done)?;
        info!(steps = steps.len(), "Snapshot set removed");
        Ok(steps)
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Roll every member of `set` back to its snapshot.
    ///
    /// Database service groups must be offline unless `force` is set.
    #[instrument(skip(self), fields(set = %set))]
    pub async fn restore_snapshot(&self, set: &SetName, force: bool) -> Result<Vec<StepRecord>> {
        let names = self.names(set);
        let mut progress = Progress::new(set.clone());
        progress.advance(PlanState::Preflight)?;

        let existing = self.store.load(set)?;
        match &existing {
            None if !force => return Err(Error::NoNamedSet(set.to_string())),
            Some(record) if !record.is_complete() && !force => {
                return Err(Error::InvalidState(format!(
                    "snapshot set {} is partial, create it again or restore with --force",
                    set
                )))
            }
            _ => {}
        }

        self.reader.ensure_no_running_plan().await?;
        let ctx = self.context().await?;
        if !force {
            for kind in DatabaseKind::ALL {
                if let Some(observed) = observe_group(&ctx, kind).await? {
                    if observed.is_active() {
                        return Err(Error::InvalidState(format!(
                            "{} database is online, take it offline before restoring",
                            kind
                        )));
                    }
                }
            }
        }

        let authoritative = recorded_authoritative(&ctx, existing.as_ref());
        let membership = Membership::resolve(&ctx, &names, authoritative).await?;
        let report = inspect(&ctx, &names, &membership, existing.as_ref()).await?;
        require_usable(&report)?;

        let mut exports: BTreeMap<String, Vec<NfsExport>> = existing
            .as_ref()
            .map(|r| r.exports.clone())
            .unwrap_or_default();
        for fs in &membership.filesystems {
            if !exports.contains_key(&fs.name) && !fs.exports.is_empty() {
                exports.insert(fs.name.clone(), fs.exports.clone());
            }
        }

        let directory = ctx.quiescer(DatabaseKind::Directory)?;
        let plan = Planner::new(&ctx, &names).restore(&membership, &exports, directory);
        let run = self.executor().run(&plan, &mut progress, false).await;
        if let Some(err) = run.error {
            if !run.offline_filesystems.is_empty() {
                error!(
                    filesystems = ?run.offline_filesystems,
                    "Restore failed with filesystems offline, bring them online and re-apply their exports"
                );
            }
            return Err(Error::RestoreFailed {
                source: Box::new(err),
                steps: run.steps,
                offline: run.offline_filesystems,
            });
        }

        progress.advance(PlanState::Verifying)?;
        progress.advance(PlanState::Done)?;
        info!(steps = run.steps.len(), "Snapshot set restored");
        Ok(run.steps)
    }

    // =========================================================================
    // List and validate
    // =========================================================================

    /// Reports for one set, or for every recorded set.
    #[instrument(skip(self), fields(selector = %selector))]
    pub async fn list_snapshots(&self, selector: &SetSelector) -> Result<Vec<SetReport>> {
        let ctx = self.context().await?;
        match selector {
            SetSelector::Named(set) => Ok(vec![self.report(&ctx, set).await?]),
            SetSelector::All => {
                let mut reports = Vec::new();
                for record in self.store.list()? {
                    reports.push(self.report(&ctx, &record.name).await?);
                }
                Ok(reports)
            }
        }
    }

    /// Hard assertions over `set`'s report.
    #[instrument(skip(self), fields(set = %set))]
    pub async fn validate_snapshots(&self, set: &SetName) -> Result<Verdict> {
        let ctx = self.context().await?;
        let report = self.report(&ctx, set).await?;
        let mut verdict = validate(&report, self.settings.nas.cache_usage_threshold);
        if report.state == Some(SetState::Partial) {
            verdict.offenders.push(Offense {
                kind: ErrorKind::MissingExpected,
                resource: set.to_string(),
                message: format!("create of {} did not complete", set),
            });
            verdict.passed = false;
        }
        if verdict.passed {
            info!("Snapshot set is valid");
        } else {
            for offense in &verdict.offenders {
                warn!(kind = %offense.kind, resource = %offense.resource, "{}", offense.message);
            }
        }
        Ok(verdict)
    }

    async fn report(&self, ctx: &Context, set: &SetName) -> Result<SetReport> {
        let names = self.names(set);
        let record = self.store.load(set)?;
        let authoritative = recorded_authoritative(ctx, record.as_ref());
        let membership = Membership::resolve(ctx, &names, authoritative).await?;
        let report = inspect(ctx, &names, &membership, record.as_ref()).await?;
        if record.is_none() && !report.has_artifacts() {
            return Err(Error::NoNamedSet(set.to_string()));
        }
        Ok(report)
    }
}

/// Live state of a database's service group, `None` when not deployed.
async fn observe_group(ctx: &Context, kind: DatabaseKind) -> Result<Option<GroupObservation>> {
    let Some(group) = ctx.group_ref(kind)? else {
        return Ok(None);
    };
    let states = ctx.cluster.state_of(&group.cluster, &group.group).await?;
    let frozen = ctx.cluster.frozen(&group.cluster, &group.group).await?;
    Ok(Some(GroupObservation {
        kind: ctx.group_kind(kind)?.unwrap_or(GroupKind::Failover),
        states,
        frozen,
    }))
}

async fn observe_authoritative(ctx: &Context) -> Result<DatabaseKind> {
    let graph = observe_group(ctx, DatabaseKind::Graph).await?;
    let object = observe_group(ctx, DatabaseKind::Object).await?;
    let kind = authoritative_db(
        graph.as_ref(),
        object.as_ref(),
        ctx.settings.databases.graph_authoritative,
    )?;
    info!(authoritative = %kind, "Authoritative database decided");
    Ok(kind)
}

/// The database recorded at create time, or the configured one.
fn recorded_authoritative(ctx: &Context, record: Option<&SetMetadata>) -> DatabaseKind {
    record
        .and_then(|r| r.authoritative_db)
        .unwrap_or(if ctx.settings.databases.graph_authoritative {
            DatabaseKind::Graph
        } else {
            DatabaseKind::Object
        })
}

/// Pools at or above 100% subscription and rollback caches that are full or
/// too small fail the create before anything is snapped.
async fn check_capacity(ctx: &Context, membership: &Membership) -> Result<()> {
    let mut seen = BTreeSet::new();
    for lun in &membership.luns {
        if !seen.insert((lun.san.array().to_string(), lun.pool.clone())) {
            continue;
        }
        let subscribed = lun.san.pool_subscription(&lun.pool).await?;
        info!(array = %lun.san.array(), pool = %lun.pool, subscribed, "Pool subscription");
        if subscribed >= 100.0 {
            return Err(Error::PreflightCapacity(format!(
                "pool {} on {} is {:.1}% subscribed",
                lun.pool,
                lun.san.array(),
                subscribed
            )));
        }
    }

    for (pool, nas) in membership.nas_pools() {
        if !nas.uses_rollback_cache() {
            continue;
        }
        let required = rollback_cache_size_mb(
            membership
                .filesystems
                .iter()
                .filter(|f| f.pool == pool)
                .map(|f| (f.size_mb, f.snap_size)),
        );
        let name = cache_name(&pool);
        let Some(cache) = nas.list_caches().await?.into_iter().find(|c| c.name == name) else {
            continue;
        };
        let used = cache.used_percent();
        if used >= 100.0 {
            return Err(Error::PreflightCapacity(format!(
                "rollback cache {} is {:.0}% used",
                name, used
            )));
        }
        if cache.total_mb < required {
            return Err(Error::PreflightCapacity(format!(
                "rollback cache {} has {} MB, {} MB needed",
                name, cache.total_mb, required
            )));
        }
        if used >= ctx.settings.nas.cache_usage_threshold {
            warn!(cache = %name, used, "Rollback cache above usage threshold");
        }
    }
    Ok(())
}

/// Exports of the member filesystems as the consoles report them now.
async fn observe_exports(membership: &Membership) -> Result<BTreeMap<String, Vec<NfsExport>>> {
    let members: BTreeSet<&str> = membership.filesystems.iter().map(|f| f.name.as_str()).collect();
    let mut exports = BTreeMap::new();
    for (pool, nas) in membership.nas_pools() {
        for (fs, list) in nas.list_exports(&pool).await? {
            if members.contains(fs.as_str()) {
                exports.insert(fs, list);
            }
        }
    }
    Ok(exports)
}

/// Every member snapshot is there and none is invalid.
fn require_usable(report: &SetReport) -> Result<()> {
    let missing: Vec<&str> = report
        .missing()
        .iter()
        .map(|e| e.snap_name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingExpected(missing.join(", ")));
    }
    if let Some(entry) = report
        .entries
        .iter()
        .find(|e| e.presence == Presence::Present && !e.valid)
    {
        return Err(Error::SnapshotInvalid(format!(
            "{} on {}",
            entry.snap_name, entry.location
        )));
    }
    Ok(())
}
