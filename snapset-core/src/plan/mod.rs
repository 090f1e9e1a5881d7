//! Snapshot plans.
//!
//! A [`Plan`] is an ordered list of [`Stage`]s, one tier at a time. Each
//! stage holds [`Step`]s that may run concurrently; every step carries the
//! actions that undo it, which the executor runs in reverse start order when
//! a later step fails.
//!
//! ```text
//!   create    db brackets ─▶ LUN snaps ─▶ NAS caches ─▶ NAS snaps ─▶ volume snaps
//!   restore   volumes ─▶ NAS (unexport, offline, restore, online, export) ─▶ LUNs ─▶ db re-import
//!   remove    volumes ─▶ NAS snaps ─▶ caches ─▶ retired filesystems ─▶ LUN snaps ─▶ db cleanup
//! ```

mod action;
mod membership;
mod planner;

pub use action::{Action, StepOutcome};
pub use membership::{
    authoritative_db, GroupObservation, MemberFs, MemberLun, MemberVolume, Membership, RetiredFs,
};
pub use planner::Planner;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::naming::SetName;

/// Storage tier of a snapshot or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Database LUNs snapped inside a quiesce bracket.
    Database,
    San,
    Nas,
    Volume,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::San => "san",
            Self::Nas => "nas",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Create,
    Restore,
    Remove,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Restore => "restore",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Where a run is.
///
/// `Idle → Preflight → Quiescing → Snapping → Verifying → Done` on success;
/// any non-terminal state may fall to `Compensating → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Idle,
    Preflight,
    Quiescing,
    Snapping,
    Verifying,
    Done,
    Compensating,
    Failed,
}

impl PlanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn can_advance_to(self, to: PlanState) -> bool {
        use PlanState::*;
        match (self, to) {
            (Idle, Preflight) => true,
            (Preflight | Quiescing | Snapping, Quiescing | Snapping | Verifying) => true,
            (Verifying, Done) => true,
            (Compensating, Failed) => true,
            (from, Compensating | Failed) => !from.is_terminal() && from != Compensating,
            _ => false,
        }
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the state of one run and logs every transition.
#[derive(Debug)]
pub struct Progress {
    set: SetName,
    state: PlanState,
}

impl Progress {
    pub fn new(set: SetName) -> Self {
        Self {
            set,
            state: PlanState::Idle,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    /// Move to `to`; staying put is a no-op.
    pub fn advance(&mut self, to: PlanState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_advance_to(to) {
            return Err(Error::Internal(format!(
                "illegal plan transition {} -> {}",
                self.state, to
            )));
        }
        info!(set = %self.set, from = %self.state, to = %to, "Plan state changed");
        self.state = to;
        Ok(())
    }
}

// =============================================================================
// Plan
// =============================================================================

/// One unit of work.
#[derive(Clone)]
pub struct Step {
    pub id: usize,
    pub action: Action,
    /// Undo actions, registered when the step starts.
    pub compensation: Vec<Action>,
    /// Limit on each attempt.
    pub deadline: Option<Duration>,
    /// Steps with the same key never run concurrently in a destructive stage.
    pub key: String,
    /// Whether a retryable failure is attempted again.
    pub retry: bool,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("action", &self.action.describe())
            .field("compensation", &self.compensation.len())
            .field("key", &self.key)
            .finish()
    }
}

/// Steps of one tier that may run concurrently.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: &'static str,
    pub tier: Tier,
    pub phase: PlanState,
    pub destructive: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub kind: PlanKind,
    pub set: SetName,
    pub stages: Vec<Stage>,
}

impl Plan {
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }
}

/// Appends stages and numbers steps across the whole plan.
pub(crate) struct PlanBuilder {
    plan: Plan,
    next_id: usize,
}

impl PlanBuilder {
    pub(crate) fn new(kind: PlanKind, set: SetName) -> Self {
        Self {
            plan: Plan {
                kind,
                set,
                stages: Vec::new(),
            },
            next_id: 0,
        }
    }

    /// Open a stage; empty stages are dropped by [`finish`](Self::finish).
    pub(crate) fn stage(
        &mut self,
        name: &'static str,
        tier: Tier,
        phase: PlanState,
        destructive: bool,
    ) -> &mut Self {
        self.plan.stages.push(Stage {
            name,
            tier,
            phase,
            destructive,
            steps: Vec::new(),
        });
        self
    }

    pub(crate) fn step(
        &mut self,
        action: Action,
        compensation: Vec<Action>,
        deadline: Option<Duration>,
        retry: bool,
    ) -> &mut Self {
        let key = action.key();
        let id = self.next_id;
        self.next_id += 1;
        if let Some(stage) = self.plan.stages.last_mut() {
            stage.steps.push(Step {
                id,
                action,
                compensation,
                deadline,
                key,
                retry,
            });
        }
        self
    }

    pub(crate) fn finish(mut self) -> Plan {
        self.plan.stages.retain(|s| !s.steps.is_empty());
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> Progress {
        Progress::new(SetName::new("s1").unwrap())
    }

    #[test]
    fn test_success_path() {
        let mut p = progress();
        for state in [
            PlanState::Preflight,
            PlanState::Quiescing,
            PlanState::Snapping,
            PlanState::Snapping,
            PlanState::Verifying,
            PlanState::Done,
        ] {
            p.advance(state).unwrap();
        }
        assert_eq!(p.state(), PlanState::Done);
        assert!(p.advance(PlanState::Failed).is_err());
    }

    #[test]
    fn test_failure_path() {
        let mut p = progress();
        p.advance(PlanState::Preflight).unwrap();
        p.advance(PlanState::Snapping).unwrap();
        p.advance(PlanState::Compensating).unwrap();
        assert!(p.advance(PlanState::Snapping).is_err());
        p.advance(PlanState::Failed).unwrap();
        assert!(p.advance(PlanState::Compensating).is_err());
    }

    #[test]
    fn test_cannot_skip_preflight() {
        let mut p = progress();
        assert!(matches!(p.advance(PlanState::Snapping), Err(Error::Internal(_))));
        p.advance(PlanState::Failed).unwrap();
    }
}
