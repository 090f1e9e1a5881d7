//! Database quiescers.
//!
//! A quiescer puts one database into a snapshot-safe state around the snap
//! of its LUNs. The state is held for the lifetime of a [`Bracket`]:
//!
//! ```text
//!   open ──▶ snap ──▶ close        (close also runs when open or snap fail)
//! ```
//!
//! Several brackets nest: all are opened in order, every database's LUNs
//! are snapped, and they close in reverse open order.
//!
//! Only the authoritative database is bracketed; the planner decides which
//! quiescers take part.

mod directory;
mod graph;
mod object;
mod relational;

pub use directory::DirectoryQuiescer;
pub use graph::GraphQuiescer;
pub use object::ObjectQuiescer;
pub use relational::{parse_session_status, RelationalQuiescer, SessionStatus};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, instrument};

use crate::cluster::{online_systems, ClusterControl};
use crate::drivers::{SanDriver, SnapOutcome};
use crate::error::{Error, Result};
use crate::model::DatabaseKind;

/// A database LUN resolved against its array.
#[derive(Clone)]
pub struct DbLun {
    pub name: String,
    pub lun_id: String,
    pub snap_name: String,
    pub san: Arc<dyn SanDriver>,
}

impl std::fmt::Debug for DbLun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLun")
            .field("name", &self.name)
            .field("lun_id", &self.lun_id)
            .field("snap_name", &self.snap_name)
            .field("array", &self.san.array())
            .finish()
    }
}

/// Service group a database runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    /// Cluster name as the cluster manager knows it.
    pub cluster: String,
    /// Group name as the cluster manager knows it.
    pub group: String,
    /// Hostnames of every node the group is configured on.
    pub hosts: Vec<String>,
}

impl GroupRef {
    /// Systems the group is currently online on.
    pub async fn online_hosts(&self, cluster: &dyn ClusterControl) -> Result<Vec<String>> {
        let states = cluster.state_of(&self.cluster, &self.group).await?;
        Ok(online_systems(&states))
    }

    /// The single system a failover group is online on.
    pub async fn active_host(&self, cluster: &dyn ClusterControl) -> Result<String> {
        self.online_hosts(cluster)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InvalidState(format!("{} is not online on any system", self.group))
            })
    }
}

/// What an open bracket holds, filled in as `open` progresses so `close`
/// can undo a partial open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bracket {
    /// Hosts the bracket was opened against.
    pub hosts: Vec<String>,
    /// Hosts whose data directory is frozen.
    pub frozen: Vec<String>,
    /// Hosts whose checkpoint I/O is throttled.
    pub throttled: Vec<String>,
    /// Systems a service group was taken offline on.
    pub offline: Vec<String>,
}

/// Snap outcome per LUN snapshot name.
pub type BracketOutcome = Vec<(String, SnapOutcome)>;

#[async_trait]
pub trait Quiescer: Send + Sync {
    fn database(&self) -> DatabaseKind;

    /// Live checks that must pass before any destructive step.
    async fn preflight(&self) -> Result<()> {
        Ok(())
    }

    async fn open(&self, bracket: &mut Bracket) -> Result<()>;

    async fn snap(&self, bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome>;

    /// Undo whatever `open` recorded in `bracket`.
    async fn close(&self, bracket: &Bracket) -> Result<()>;

    /// Runs after the database LUNs were restored.
    async fn after_restore(&self) -> Result<()> {
        Ok(())
    }

    /// Runs when the set is removed.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// A quiescer and the LUNs snapped inside its bracket.
#[derive(Clone)]
pub struct Participant {
    pub quiescer: Arc<dyn Quiescer>,
    pub luns: Vec<DbLun>,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("database", &self.quiescer.database())
            .field("luns", &self.luns)
            .finish()
    }
}

/// Open, snap and close a single bracket.
pub async fn run_bracket(
    quiescer: &dyn Quiescer,
    luns: &[DbLun],
    snap_deadline: Duration,
) -> Result<BracketOutcome> {
    run_nested(&[(quiescer, luns)], snap_deadline).await
}

/// Open every bracket in order, snap each database's LUNs while all of them
/// are open, then close them in reverse open order.
pub async fn run_brackets(
    participants: &[Participant],
    snap_deadline: Duration,
) -> Result<BracketOutcome> {
    let nested: Vec<(&dyn Quiescer, &[DbLun])> = participants
        .iter()
        .map(|p| (p.quiescer.as_ref(), p.luns.as_slice()))
        .collect();
    run_nested(&nested, snap_deadline).await
}

/// Opening stops at the first failure. Every bracket whose open was
/// attempted is closed, a partially opened one included; a close failure
/// is reported only when nothing failed before it.
#[instrument(skip_all, fields(brackets = nested.len()))]
async fn run_nested(
    nested: &[(&dyn Quiescer, &[DbLun])],
    snap_deadline: Duration,
) -> Result<BracketOutcome> {
    let mut opened: Vec<(&dyn Quiescer, &[DbLun], Bracket)> = Vec::with_capacity(nested.len());
    let mut failure = None;
    for &(quiescer, luns) in nested {
        let mut bracket = Bracket::default();
        let result = quiescer.open(&mut bracket).await;
        if result.is_ok() {
            info!(db = %quiescer.database(), hosts = ?bracket.hosts, "Quiesce bracket open");
        }
        opened.push((quiescer, luns, bracket));
        if let Err(e) = result {
            failure = Some(e);
            break;
        }
    }

    let mut outcome = Vec::new();
    if failure.is_none() {
        for (quiescer, luns, bracket) in &opened {
            let db = quiescer.database();
            match tokio::time::timeout(snap_deadline, quiescer.snap(bracket, luns)).await {
                Ok(Ok(snapped)) => outcome.extend(snapped),
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(_) => {
                    failure = Some(Error::PlanTimeout {
                        step: format!("{} snap", db),
                        secs: snap_deadline.as_secs(),
                    });
                    break;
                }
            }
        }
    }

    for (quiescer, _, bracket) in opened.iter().rev() {
        let db = quiescer.database();
        match quiescer.close(bracket).await {
            Ok(()) if failure.is_some() => info!(db = %db, "Quiesce bracket closed after failure"),
            Ok(()) => info!(db = %db, "Quiesce bracket closed"),
            Err(e) => {
                error!(db = %db, error = %e, "Failed to close quiesce bracket");
                failure.get_or_insert(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

/// Snap each LUN through its driver.
pub(crate) async fn snap_luns(luns: &[DbLun]) -> Result<BracketOutcome> {
    let mut outcome = Vec::with_capacity(luns.len());
    for lun in luns {
        let result = lun.san.snap(&lun.lun_id, &lun.snap_name).await?;
        outcome.push((lun.snap_name.clone(), result));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::mock::{MockQuiescer, MockSan};

    #[derive(Default)]
    struct Recording {
        fail_open: bool,
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Quiescer for Recording {
        fn database(&self) -> DatabaseKind {
            DatabaseKind::Graph
        }

        async fn open(&self, bracket: &mut Bracket) -> Result<()> {
            self.events.lock().unwrap().push("open".to_string());
            bracket.frozen.push("db-1".to_string());
            if self.fail_open {
                return Err(Error::InvalidState("freeze failed on db-2".to_string()));
            }
            Ok(())
        }

        async fn snap(&self, _bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
            self.events.lock().unwrap().push("snap".to_string());
            snap_luns(luns).await
        }

        async fn close(&self, bracket: &Bracket) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("close {}", bracket.frozen.join(",")));
            Ok(())
        }
    }

    fn lun(san: &Arc<MockSan>, id: &str) -> DbLun {
        DbLun {
            name: "neo4jlun".to_string(),
            lun_id: id.to_string(),
            snap_name: format!("s1_{}", id),
            san: san.clone(),
        }
    }

    #[tokio::test]
    async fn test_bracket_closes_after_snap_failure() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "neo4jlun", "12", 1024);
        san.fail_snap("12");
        let quiescer = Recording::default();

        let err = run_bracket(&quiescer, &[lun(&san, "12")], Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Vendor(_)));
        assert_eq!(quiescer.events(), vec!["open", "snap", "close db-1"]);
    }

    #[tokio::test]
    async fn test_partial_open_is_closed() {
        let san = Arc::new(MockSan::new("san1"));
        let quiescer = Recording {
            fail_open: true,
            ..Default::default()
        };
        let err = run_bracket(&quiescer, &[lun(&san, "12")], Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(quiescer.events(), vec!["open", "close db-1"]);
    }

    fn participant(kind: DatabaseKind, log: &Arc<Mutex<Vec<String>>>, luns: Vec<DbLun>) -> Participant {
        Participant {
            quiescer: Arc::new(MockQuiescer::new(kind, log.clone())),
            luns,
        }
    }

    #[tokio::test]
    async fn test_brackets_nest() {
        let san = Arc::new(MockSan::new("san1"));
        san.add_lun("pool1", "neo4jlun", "11", 1024);
        san.add_lun("pool1", "mysql", "12", 1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        let participants = vec![
            participant(DatabaseKind::Directory, &log, Vec::new()),
            participant(DatabaseKind::Graph, &log, vec![lun(&san, "11")]),
            participant(DatabaseKind::Relational, &log, vec![lun(&san, "12")]),
        ];

        let outcome = run_brackets(&participants, Duration::from_secs(600)).await.unwrap();
        assert_eq!(outcome.len(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "open directory",
                "open graph",
                "open relational",
                "snap directory",
                "snap graph",
                "snap relational",
                "close relational",
                "close graph",
                "close directory",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_open_closes_what_was_opened() {
        let san = Arc::new(MockSan::new("san1"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let participants = vec![
            participant(DatabaseKind::Directory, &log, Vec::new()),
            Participant {
                quiescer: Arc::new(MockQuiescer::new(DatabaseKind::Graph, log.clone()).failing_open()),
                luns: vec![lun(&san, "11")],
            },
            participant(DatabaseKind::Relational, &log, Vec::new()),
        ];

        let err = run_brackets(&participants, Duration::from_secs(600)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["open directory", "open graph", "close graph", "close directory"]
        );
        assert!(san.snaps().is_empty());
    }
}
