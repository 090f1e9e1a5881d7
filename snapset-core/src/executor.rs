//! Runs a [`Plan`](crate::plan::Plan).
//!
//! Stages run strictly in order. Inside a stage, steps are grouped by their
//! serialization key (array, console, host, database); groups run
//! concurrently up to the listing limit, and the steps of one group run up
//! to the destructive limit at a time. A failed step stops the stage from
//! starting new steps; the steps already running finish.
//!
//! Every step registers its compensation when it starts. When a step fails
//! and compensation is on, the registered compensations run newest first,
//! best effort, before the failure is reported.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::plan::{Action, Plan, PlanState, Progress, Stage, Step, StepOutcome, Tier};
use crate::retry::{retry_future, Backoff};
use crate::settings::ExecutorSettings;

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: usize,
    pub action: &'static str,
    pub resource: String,
    pub tier: Tier,
    pub outcome: Option<StepOutcome>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Result of [`Executor::run`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub steps: Vec<StepRecord>,
    pub compensations: Vec<StepRecord>,
    pub compensated: bool,
    /// NAS filesystems taken offline and not brought back online.
    pub offline_filesystems: Vec<String>,
    pub error: Option<Error>,
    /// Compensations of the started steps, kept when the run succeeded.
    undo: Vec<Action>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<StepRecord>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.steps),
        }
    }
}

/// A step result as returned by a worker.
struct Finished {
    record: StepRecord,
    started: bool,
    error: Option<Error>,
}

pub struct Executor {
    settings: ExecutorSettings,
    cancel: CancelFlag,
}

impl Executor {
    pub fn new(settings: ExecutorSettings, cancel: CancelFlag) -> Self {
        Self { settings, cancel }
    }

    /// Run every stage of `plan`; on failure, run the compensations of the
    /// started steps when `compensate` is set.
    #[instrument(skip_all, fields(set = %plan.set, kind = %plan.kind, steps = plan.step_count()))]
    pub async fn run(&self, plan: &Plan, progress: &mut Progress, compensate: bool) -> RunReport {
        let mut report = RunReport::default();
        let mut undo: Vec<Action> = Vec::new();
        let mut offline = BTreeSet::new();

        for stage in &plan.stages {
            if let Err(e) = progress.advance(stage.phase) {
                report.error = Some(e);
                break;
            }
            info!(stage = stage.name, tier = %stage.tier, steps = stage.steps.len(), "Stage starting");

            let mut finished = self.run_stage(stage).await;
            finished.sort_by_key(|f| f.record.id);
            for f in finished {
                if f.started {
                    if let Some(step) = stage.steps.iter().find(|s| s.id == f.record.id) {
                        undo.extend(step.compensation.iter().cloned());
                        if f.error.is_none() {
                            track_offline(&step.action, &mut offline);
                        }
                    }
                }
                if let Some(e) = f.error {
                    report.error.get_or_insert(e);
                }
                report.steps.push(f.record);
            }
            if report.error.is_some() {
                break;
            }
        }

        report.offline_filesystems = offline.into_iter().collect();
        let Some(err) = &report.error else {
            info!(steps = report.steps.len(), "Plan completed");
            report.undo = undo;
            return report;
        };

        error!(error = %err, kind = %err.kind(), "Plan failed");
        if compensate && !undo.is_empty() {
            if let Err(e) = progress.advance(PlanState::Compensating) {
                warn!(error = %e, "Failed to record compensating state");
            }
            report.compensations = self.compensate(undo).await;
            report.compensated = true;
        }
        if let Err(e) = progress.advance(PlanState::Failed) {
            warn!(error = %e, "Failed to record failed state");
        }
        if !report.offline_filesystems.is_empty() {
            error!(
                filesystems = ?report.offline_filesystems,
                "Filesystems left offline, exports were not re-applied"
            );
        }
        report
    }

    /// Undo a run that completed but whose result was rejected afterwards:
    /// its compensations run newest first and the plan ends failed.
    pub async fn roll_back(&self, report: &mut RunReport, progress: &mut Progress) {
        let undo = std::mem::take(&mut report.undo);
        if !undo.is_empty() {
            if let Err(e) = progress.advance(PlanState::Compensating) {
                warn!(error = %e, "Failed to record compensating state");
            }
            report.compensations = self.compensate(undo).await;
            report.compensated = true;
        }
        if let Err(e) = progress.advance(PlanState::Failed) {
            warn!(error = %e, "Failed to record failed state");
        }
    }

    async fn run_stage(&self, stage: &Stage) -> Vec<Finished> {
        let halt = AtomicBool::new(false);
        let mut groups: BTreeMap<&str, Vec<&Step>> = BTreeMap::new();
        for step in &stage.steps {
            groups.entry(step.key.as_str()).or_default().push(step);
        }
        let per_group = if stage.destructive {
            self.settings.destructive_concurrency
        } else {
            self.settings.listing_concurrency
        }
        .max(1);
        let halt = &halt;

        stream::iter(groups.into_values())
            .map(|steps| async move {
                stream::iter(steps)
                    .map(|step| self.run_step(stage.tier, step, halt))
                    .buffer_unordered(per_group)
                    .collect::<Vec<_>>()
                    .await
            })
            .buffer_unordered(self.settings.listing_concurrency.max(1))
            .collect::<Vec<Vec<Finished>>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    #[instrument(skip_all, fields(step = step.id, action = step.action.name(), tier = %tier))]
    async fn run_step(&self, tier: Tier, step: &Step, halt: &AtomicBool) -> Finished {
        let mut record = StepRecord {
            id: step.id,
            action: step.action.name(),
            resource: step.action.resource(),
            tier,
            outcome: None,
            attempts: 0,
            elapsed_ms: 0,
            error: None,
        };

        if self.cancel.is_cancelled() {
            halt.store(true, Ordering::SeqCst);
            record.outcome = Some(StepOutcome::Skipped);
            return Finished {
                record,
                started: false,
                error: Some(Error::Cancelled(step.action.describe())),
            };
        }
        if halt.load(Ordering::SeqCst) {
            record.outcome = Some(StepOutcome::Skipped);
            return Finished {
                record,
                started: false,
                error: None,
            };
        }

        let started = Instant::now();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let policy = if step.retry {
            Backoff::capped_exponential(
                self.settings.max_attempts.max(1),
                self.settings.backoff_base(),
                self.settings.backoff_cap(),
            )
        } else {
            Backoff::fixed(1, Duration::ZERO)
        }
        .label("step");
        let result = retry_future(
            |attempt| {
                attempts.store(attempt + 1, Ordering::SeqCst);
                info!(resource = %record.resource, attempt = attempt + 1, "Step running");
                attempt_step(step)
            },
            policy,
        )
        .await;

        record.attempts = attempts.load(Ordering::SeqCst);
        record.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                info!(resource = %record.resource, outcome = ?outcome, "Step done");
                record.outcome = Some(outcome);
                Finished {
                    record,
                    started: true,
                    error: None,
                }
            }
            Err(e) => {
                halt.store(true, Ordering::SeqCst);
                error!(resource = %record.resource, error = %e, "Step failed");
                record.error = Some(e.to_string());
                Finished {
                    record,
                    started: true,
                    error: Some(e),
                }
            }
        }
    }

    /// Run `undo` newest first. Failures are logged and do not stop the rest.
    async fn compensate(&self, undo: Vec<Action>) -> Vec<StepRecord> {
        info!(actions = undo.len(), "Compensating");
        let mut records = Vec::with_capacity(undo.len());
        for (id, action) in undo.into_iter().rev().enumerate() {
            let policy = Backoff::capped_exponential(
                self.settings.max_attempts.max(1),
                self.settings.backoff_base(),
                self.settings.backoff_cap(),
            )
            .label("compensation");
            let started = Instant::now();
            let result = retry_future(|_| action.run(), policy).await;
            let mut record = StepRecord {
                id,
                action: action.name(),
                resource: action.resource(),
                tier: compensation_tier(&action),
                outcome: None,
                attempts: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
                error: None,
            };
            match result {
                Ok(outcome) => {
                    info!(action = %action.describe(), outcome = ?outcome, "Compensation done");
                    record.outcome = Some(outcome);
                }
                Err(e) => {
                    warn!(action = %action.describe(), error = %e, "Compensation failed");
                    record.error = Some(e.to_string());
                }
            }
            records.push(record);
        }
        records
    }
}

/// One attempt under the step's deadline.
async fn attempt_step(step: &Step) -> Result<StepOutcome> {
    match step.deadline {
        Some(deadline) => tokio::time::timeout(deadline, step.action.run())
            .await
            .map_err(|_| Error::PlanTimeout {
                step: step.action.describe(),
                secs: deadline.as_secs(),
            })?,
        None => step.action.run().await,
    }
}

fn track_offline(action: &Action, offline: &mut BTreeSet<String>) {
    match action {
        Action::FsOffline { fs, .. } => {
            offline.insert(fs.clone());
        }
        Action::FsOnline { fs, .. } => {
            offline.remove(fs);
        }
        _ => {}
    }
}

fn compensation_tier(action: &Action) -> Tier {
    match action {
        Action::LunSnap { .. }
        | Action::LunDestroy { .. }
        | Action::LunRestore { .. }
        | Action::BackupCleanup { .. } => Tier::San,
        Action::VolSnap { .. } | Action::VolRestore { .. } | Action::VolDestroy { .. } => {
            Tier::Volume
        }
        Action::Bracket { .. } | Action::AfterRestore { .. } | Action::Cleanup { .. } => {
            Tier::Database
        }
        _ => Tier::Nas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::drivers::SanDriver;
    use crate::mock::{MockQuiescer, MockSan};
    use crate::model::DatabaseKind;
    use crate::naming::SetName;
    use crate::plan::{PlanBuilder, PlanKind};
    use crate::quiesce::{DbLun, Participant};

    fn set() -> SetName {
        SetName::new("s1").unwrap()
    }

    fn snap(san: &Arc<MockSan>, lun_id: &str) -> (Action, Vec<Action>) {
        let name = format!("s1_{}", lun_id);
        (
            Action::LunSnap {
                san: san.clone(),
                lun_id: lun_id.to_string(),
                snap_name: name.clone(),
            },
            vec![Action::LunDestroy {
                san: san.clone(),
                snap_name: name,
            }],
        )
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            max_attempts: 2,
            ..Default::default()
        }
    }

    fn plan(san: &Arc<MockSan>, ids: &[&str]) -> Plan {
        let mut builder = PlanBuilder::new(PlanKind::Create, set());
        builder.stage("lun snapshots", Tier::San, PlanState::Snapping, true);
        for id in ids {
            let (action, undo) = snap(san, id);
            builder.step(action, undo, Some(Duration::from_secs(600)), true);
        }
        builder.finish()
    }

    fn running() -> Progress {
        let mut progress = Progress::new(set());
        progress.advance(PlanState::Preflight).unwrap();
        progress
    }

    #[tokio::test]
    async fn test_failure_compensates_started_steps() {
        let san = Arc::new(MockSan::new("san1"));
        for id in ["1", "2", "3"] {
            san.add_lun("pool1", &format!("lun{}", id), id, 1024);
        }
        san.fail_snap("2");

        let executor = Executor::new(settings(), CancelFlag::new());
        let mut progress = running();
        let report = executor.run(&plan(&san, &["1", "2", "3"]), &mut progress, true).await;

        assert!(matches!(report.error, Some(Error::Vendor(_))));
        assert!(report.compensated);
        assert_eq!(progress.state(), PlanState::Failed);
        assert_eq!(report.steps[2].outcome, Some(StepOutcome::Skipped));
        assert!(san.list_snaps("s1_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_on_failure() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "lun1", "1", 1024);
        san.add_lun("pool1", "lun2", "2", 1024);
        san.fail_snap("2");

        let executor = Executor::new(settings(), CancelFlag::new());
        let report = executor
            .run(&plan(&san, &["1", "2"]), &mut running(), false)
            .await;
        assert!(!report.compensated);
        assert_eq!(san.list_snaps("s1_").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "lun1", "1", 1024);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let executor = Executor::new(settings(), cancel);
        let report = executor.run(&plan(&san, &["1"]), &mut running(), true).await;
        assert!(matches!(report.error, Some(Error::Cancelled(_))));
        assert_eq!(report.error.unwrap().exit_code().code(), 4);
        assert!(san.list_snaps("s1_").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "lun1", "1", 1024);
        san.fail_snap_transient("1", 1);

        let executor = Executor::new(settings(), CancelFlag::new());
        let report = executor.run(&plan(&san, &["1"]), &mut running(), true).await;
        assert!(report.is_success());
        assert_eq!(report.steps[0].attempts, 2);
        assert_eq!(report.steps[0].outcome, Some(StepOutcome::Created));
    }

    #[tokio::test]
    async fn test_quiesce_brackets_close_in_reverse_open_order() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "neo4jlun", "11", 1024);
        san.add_lun("pool1", "mysql", "12", 1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        let participant = |kind, luns: &[&str]| Participant {
            quiescer: Arc::new(MockQuiescer::new(kind, log.clone())),
            luns: luns
                .iter()
                .map(|id| DbLun {
                    name: format!("lun{}", id),
                    lun_id: id.to_string(),
                    snap_name: format!("s1_{}", id),
                    san: san.clone(),
                })
                .collect(),
        };

        let mut builder = PlanBuilder::new(PlanKind::Create, set());
        builder.stage("quiesce", Tier::Database, PlanState::Quiescing, true);
        builder.step(
            Action::Bracket {
                participants: vec![
                    participant(DatabaseKind::Directory, &[]),
                    participant(DatabaseKind::Graph, &["11"]),
                    participant(DatabaseKind::Relational, &["12"]),
                ],
                snap_deadline: Duration::from_secs(600),
            },
            Vec::new(),
            None,
            false,
        );
        let executor = Executor::new(settings(), CancelFlag::new());
        let report = executor.run(&builder.finish(), &mut running(), true).await;
        assert!(report.is_success());

        let events = log.lock().unwrap().clone();
        let opens: Vec<&str> = events
            .iter()
            .filter(|e| e.starts_with("open"))
            .map(String::as_str)
            .collect();
        let closes: Vec<&str> = events
            .iter()
            .filter(|e| e.starts_with("close"))
            .map(String::as_str)
            .collect();
        assert_eq!(opens, vec!["open directory", "open graph", "open relational"]);
        assert_eq!(closes, vec!["close relational", "close graph", "close directory"]);
        let last_open = events.iter().rposition(|e| e.starts_with("open")).unwrap();
        let first_close = events.iter().position(|e| e.starts_with("close")).unwrap();
        assert!(last_open < first_close);
        assert_eq!(san.snaps().len(), 2);
    }

    #[tokio::test]
    async fn test_roll_back_after_success() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "lun1", "1", 1024);
        san.add_lun("pool1", "lun2", "2", 1024);

        let executor = Executor::new(settings(), CancelFlag::new());
        let mut progress = running();
        let mut report = executor.run(&plan(&san, &["1", "2"]), &mut progress, true).await;
        assert!(report.is_success());
        assert_eq!(san.list_snaps("s1_").await.unwrap().len(), 2);

        executor.roll_back(&mut report, &mut progress).await;
        assert!(report.compensated);
        assert_eq!(report.compensations.len(), 2);
        assert_eq!(report.compensations[0].resource, "s1_2");
        assert_eq!(progress.state(), PlanState::Failed);
        assert!(san.list_snaps("s1_").await.unwrap().is_empty());
    }
}
