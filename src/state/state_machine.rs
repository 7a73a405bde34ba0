use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::state::round::AbortReason;

/// Phases a round moves through. Only the authority decides transitions;
/// replicas mirror them from its broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Peers are loading; the readiness barrier is closed.
    WaitingForPlayers,
    /// Barrier opened; the synchronized start instant has not been reached.
    Starting,
    /// Gameplay is running and the game-active flag is set.
    Active,
    /// Game-active dropped; the authority is settling scores.
    Settling,
    /// Snapshot applied; waiting for the next-scene handoff.
    Ended,
    /// Round abandoned. Terminal for the session.
    Aborted(AbortReason),
}

impl RoundPhase {
    /// Whether no further transition (other than a new round) can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Ended | RoundPhase::Aborted(_))
    }
}

/// Events that can be applied to the round state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    /// Every expected peer reported ready (or was evicted).
    BarrierSatisfied,
    /// The scheduled round-start action fired.
    StartReached,
    /// The game-active flag dropped from true to false.
    GameEnded,
    /// The settlement snapshot was applied to the local store.
    SettlementApplied,
    /// Reset for the next round of the same session.
    NextRound,
    /// Abandon the round.
    Abort(AbortReason),
}

/// `event` has no edge out of `from`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// Phase the lifecycle was in.
    pub from: RoundPhase,
    /// Refused event.
    pub event: RoundEvent,
}

/// Why a lifecycle transition could not be planned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Another plan is still open.
    #[error("a transition is already pending")]
    AlreadyPending,
    /// No edge for the event.
    #[error(transparent)]
    InvalidTransition(InvalidTransition),
}

/// Why a planned transition could not be committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("pending plan {expected} does not match {got}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// State machine phase changed since the plan was created.
    #[error("phase changed during transition (expected {expected:?}, got {actual:?})")]
    PhaseMismatch {
        /// Phase when plan was created.
        expected: RoundPhase,
        /// Current phase.
        actual: RoundPhase,
    },
    /// State machine version changed since the plan was created.
    #[error("version changed during transition (expected {expected}, got {actual})")]
    VersionMismatch {
        /// Version when plan was created.
        expected: usize,
        /// Current version.
        actual: usize,
    },
}

/// Why a planned transition could not be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("pending plan {expected} does not match {got}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Identifier of an open plan.
pub type PlanId = Uuid;

/// A validated transition waiting for its side effects to finish.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Phase when planned.
    pub from: RoundPhase,
    /// Target phase.
    pub to: RoundPhase,
    /// Triggering event.
    pub event: RoundEvent,
    /// Version once committed.
    pub version_next: usize,
}

/// Point-in-time view of the lifecycle, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    /// Phase.
    pub phase: RoundPhase,
    /// Rounds reset so far; zero for the first round.
    pub round: u32,
    /// Committed transitions so far.
    pub version: usize,
    /// Target of the open plan, if any.
    pub pending: Option<RoundPhase>,
}

/// Round lifecycle. Phases only move forward within a round; `NextRound`
/// is the single way back to [`RoundPhase::WaitingForPlayers`].
#[derive(Debug, Clone)]
pub struct RoundStateMachine {
    phase: RoundPhase,
    round: u32,
    version: usize,
    pending: Option<Plan>,
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self {
            phase: RoundPhase::WaitingForPlayers,
            round: 0,
            version: 0,
            pending: None,
        }
    }
}

impl RoundStateMachine {
    /// Lifecycle waiting for players of the first round.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase.clone()
    }

    /// Borrow the current phase.
    pub fn phase_ref(&self) -> &RoundPhase {
        &self.phase
    }

    /// Zero-based index of the current round.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Capture the lifecycle for inspection.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            phase: self.phase.clone(),
            round: self.round,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to.clone()),
        }
    }

    /// Validate `event` against the current phase and open a plan for it.
    /// Nothing changes until the plan is applied.
    pub fn plan(&mut self, event: RoundEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event.clone())
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase.clone(),
            to: next,
            event,
            version_next: self.version + 1,
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Commit an open plan and return the phase it lands in.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<RoundPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase.clone(),
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        if plan.event == RoundEvent::NextRound {
            self.round += 1;
        }
        self.phase = plan.to;
        self.version = plan.version_next;
        self.pending = None;

        Ok(self.phase.clone())
    }

    /// Drop an open plan; the phase is untouched.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Plan and immediately apply `event`.
    pub fn advance(&mut self, event: RoundEvent) -> Result<RoundPhase, PlanError> {
        let plan = self.plan(event)?;
        // The plan was created from the current phase and version a moment ago.
        self.apply(plan.id).map_err(|_| PlanError::AlreadyPending)
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: RoundEvent) -> Result<RoundPhase, InvalidTransition> {
        let next = match (self.phase.clone(), event) {
            (RoundPhase::WaitingForPlayers, RoundEvent::BarrierSatisfied) => RoundPhase::Starting,
            (RoundPhase::Starting, RoundEvent::StartReached) => RoundPhase::Active,
            (RoundPhase::Active, RoundEvent::GameEnded) => RoundPhase::Settling,
            (RoundPhase::Settling, RoundEvent::SettlementApplied) => RoundPhase::Ended,
            (RoundPhase::Ended, RoundEvent::NextRound) => RoundPhase::WaitingForPlayers,
            (
                RoundPhase::WaitingForPlayers
                | RoundPhase::Starting
                | RoundPhase::Active
                | RoundPhase::Settling,
                RoundEvent::Abort(reason),
            ) => RoundPhase::Aborted(reason),
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
