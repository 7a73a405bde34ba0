//! Per-peer round session.
//!
//! A [`RoundSession`] owns every piece of round state for one peer: the clock
//! estimate, the readiness barrier, the scheduled actions, the lifecycle, the
//! round tally and the replicated store. It performs no IO. The driver feeds it
//! delivered messages and ticks with the peer's local time, then drains the
//! messages it wants sent and the events it wants published.

use indexmap::IndexSet;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::RoundConfig,
    dto::message::{Envelope, Outgoing, PeerMessage, Target},
    error::RoundError,
    state::{
        barrier::{ReadinessBarrier, ReadyOutcome},
        cancel::SessionCancel,
        clock::{ClockSync, SyncInstant},
        events::SessionEvent,
        flag::SharedFlag,
        replication::{ApplyOutcome, StateReplicationStore},
        round::{AbortReason, MapType, NextScene, PeerId, PeerRole, PlayerId},
        scheduler::{ActionHandle, ScheduledActionRunner},
        settlement::{SettlementEngine, SettlementInput},
        state_machine::{RoundEvent, RoundPhase, RoundStateMachine},
        tally::{RoundTally, TallyOutcome},
    },
};

/// Work armed against a synchronized instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundAction {
    /// Flip the game-active flag and enter the active phase.
    StartRound,
    /// Advance the on-screen countdown.
    CountdownTick {
        /// One-based tick index.
        index: u32,
    },
    /// Round time limit reached (authority).
    RoundTimeout,
    /// Settlement grace elapsed (authority).
    SettlementGrace,
    /// Teardown delay elapsed; hand off to `scene` (authority).
    Teardown {
        /// Scene chosen for the handoff.
        scene: NextScene,
    },
}

/// Everything needed to build a session for one peer.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// This peer.
    pub local: PeerId,
    /// The round's authority.
    pub authority: PeerId,
    /// Every peer expected in the room, the authority included.
    pub members: Vec<PeerId>,
    /// Map being played.
    pub map_type: MapType,
    /// Timings and rewards.
    pub config: RoundConfig,
}

/// Explicit session context for one peer.
pub struct RoundSession {
    local: PeerId,
    authority: PeerId,
    role: PeerRole,
    config: RoundConfig,
    map_type: MapType,
    clock: ClockSync,
    barrier: ReadinessBarrier,
    early_ready: IndexSet<PeerId>,
    runner: ScheduledActionRunner<RoundAction>,
    lifecycle: RoundStateMachine,
    game_active: SharedFlag,
    round_over: SharedFlag,
    countdown_index: u32,
    start_at: Option<SyncInstant>,
    start_handle: Option<ActionHandle>,
    countdown_armed: bool,
    entered_at: Option<f64>,
    tally: RoundTally,
    roster: IndexSet<PlayerId>,
    store: StateReplicationStore,
    engine: SettlementEngine,
    last_payload: Option<(u32, String)>,
    settled_round: Option<u32>,
    snapshots_produced: usize,
    next_scene: Option<NextScene>,
    cancel: SessionCancel,
    outbox: Vec<Outgoing>,
    events: Vec<SessionEvent>,
}

impl RoundSession {
    /// Build the session for `setup.local`.
    pub fn new(setup: SessionSetup) -> Self {
        let SessionSetup {
            local,
            authority,
            members,
            map_type,
            config,
        } = setup;
        let role = if local == authority {
            PeerRole::Authority
        } else {
            PeerRole::Replica
        };
        let mut roster: IndexSet<PlayerId> = members.into_iter().collect();
        roster.insert(authority);

        let cancel = SessionCancel::new();
        Self {
            local,
            authority,
            role,
            clock: ClockSync::new(role, config.clock_sync_interval()),
            barrier: ReadinessBarrier::for_members(roster.iter().copied()),
            early_ready: IndexSet::new(),
            runner: ScheduledActionRunner::new(cancel.watch()),
            lifecycle: RoundStateMachine::new(),
            game_active: SharedFlag::new(false),
            round_over: SharedFlag::new(false),
            countdown_index: 0,
            start_at: None,
            start_handle: None,
            countdown_armed: false,
            entered_at: None,
            tally: RoundTally::new(),
            roster,
            store: StateReplicationStore::new(),
            engine: SettlementEngine::new(
                config.rewards.clone(),
                config.unknown_player_policy,
            ),
            last_payload: None,
            settled_round: None,
            snapshots_produced: 0,
            next_scene: None,
            cancel,
            outbox: Vec::new(),
            events: Vec::new(),
            map_type,
            config,
        }
    }

    /// This peer.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// The round's authority.
    pub fn authority(&self) -> PeerId {
        self.authority
    }

    /// This peer's role.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Map being played.
    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RoundPhase {
        self.lifecycle.phase()
    }

    /// Zero-based round index.
    pub fn round(&self) -> u32 {
        self.lifecycle.round()
    }

    /// Current value of the game-active flag.
    pub fn game_active(&self) -> bool {
        self.game_active.get()
    }

    /// Subscribe to game-active transitions.
    pub fn watch_game_active(&self) -> watch::Receiver<bool> {
        self.game_active.subscribe()
    }

    /// Current value of the round-over flag.
    pub fn round_over(&self) -> bool {
        self.round_over.get()
    }

    /// Last countdown index reached.
    pub fn countdown_index(&self) -> u32 {
        self.countdown_index
    }

    /// Replicated outcome.
    pub fn store(&self) -> &StateReplicationStore {
        &self.store
    }

    /// Round results gathered so far.
    pub fn tally(&self) -> &RoundTally {
        &self.tally
    }

    /// Players still tracked by the room.
    pub fn roster(&self) -> &IndexSet<PlayerId> {
        &self.roster
    }

    /// Snapshots produced by this peer (authority only; at most one per round).
    pub fn snapshots_produced(&self) -> usize {
        self.snapshots_produced
    }

    /// Scene handed to once the round was torn down.
    pub fn next_scene(&self) -> Option<NextScene> {
        self.next_scene
    }

    /// Whether the session cancelled its work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the driver can stop: the round handed off or the session is dead.
    pub fn is_finished(&self) -> bool {
        self.next_scene.is_some() || self.is_cancelled()
    }

    /// Synchronized time as this peer estimates it.
    pub fn synchronized_time(&mut self, local_now: f64) -> SyncInstant {
        self.clock.synchronized_time(local_now)
    }

    /// Earliest pending scheduled action.
    pub fn next_due(&self) -> Option<SyncInstant> {
        self.runner.next_due()
    }

    /// Take the messages queued for sending.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the events queued for publishing.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Announce that this peer finished loading the round.
    ///
    /// The authority addresses the notice to itself as well, so it is counted
    /// through the same path as every replica.
    pub fn enter_round(&mut self, local_now: f64) {
        if self.is_cancelled() {
            return;
        }
        self.entered_at = Some(local_now);
        if let (PeerRole::Authority, Some(timeout)) = (self.role, self.config.barrier_timeout_secs) {
            let barrier = std::mem::replace(&mut self.barrier, ReadinessBarrier::new(0));
            self.barrier = barrier.with_deadline(local_now + timeout);
        }
        debug!(peer = %self.local, round = self.round(), "entering round");
        self.send(Outgoing::to(self.authority, PeerMessage::ReadyNotify));
    }

    /// Process one delivered message.
    pub fn handle(&mut self, envelope: Envelope, local_now: f64) -> Result<(), RoundError> {
        let Envelope { from, message } = envelope;
        if self.is_cancelled() {
            debug!(peer = %self.local, kind = message.kind(), "session cancelled; message dropped");
            return Ok(());
        }
        if message.is_authority_only() && from != self.authority {
            return Err(RoundError::UnauthorizedSender {
                from,
                kind: message.kind(),
            });
        }

        match message {
            PeerMessage::ReadyNotify => self.on_ready(from, local_now),
            PeerMessage::ClockSync { authority_time } => {
                self.clock.observe(authority_time, local_now);
                Ok(())
            }
            PeerMessage::ScheduleRoundStart { at } => self.arm_round_start(at),
            PeerMessage::ScheduleCountdownBegin { at } => {
                self.arm_countdown(at);
                Ok(())
            }
            PeerMessage::GameActiveChanged { active } => self.mirror_game_active(active),
            PeerMessage::RoundOverFlag { round_over } => {
                self.set_round_over(round_over);
                Ok(())
            }
            PeerMessage::SettlementSnapshot { round, payload } => {
                self.apply_snapshot(round, &payload)
            }
            PeerMessage::OwnershipTransfer => {
                self.events.push(SessionEvent::ReleaseRoundObjects);
                Ok(())
            }
            PeerMessage::SceneTransition { scene } => self.hand_off(scene),
            PeerMessage::FinishReport { player } => {
                self.require_authority("finish_report")?;
                self.record_finish(player, local_now)
            }
            PeerMessage::FailureReport { player } => {
                self.require_authority("failure_report")?;
                self.record_failure(player);
                Ok(())
            }
            PeerMessage::PointsReport { player, amount } => {
                self.require_authority("points_report")?;
                self.record_points(player, amount);
                Ok(())
            }
            PeerMessage::FinishRecorded { player, position } => {
                if self.role == PeerRole::Replica {
                    self.tally.mirror_finish(player);
                    self.events
                        .push(SessionEvent::FinishRecorded { player, position });
                }
                Ok(())
            }
            PeerMessage::ResyncRequest => {
                self.require_authority("resync_request")?;
                self.resend_snapshot(from);
                Ok(())
            }
            PeerMessage::PeerJoined { peer } => {
                if self.roster.insert(peer) {
                    info!(peer = %self.local, joined = %peer, "peer joined the room");
                }
                Ok(())
            }
            PeerMessage::PeerLeft { peer } => self.on_peer_left(peer, local_now),
        }
    }

    /// Advance time-driven work: clock broadcasts, liveness checks, barrier
    /// deadline and scheduled actions.
    pub fn tick(&mut self, local_now: f64) -> Result<(), RoundError> {
        if self.is_cancelled() {
            return Ok(());
        }

        if let Some(authority_time) = self.clock.due_broadcast(local_now) {
            self.send(Outgoing {
                target: Target::Others,
                message: PeerMessage::ClockSync { authority_time },
            });
        }

        if self.role == PeerRole::Replica && self.authority_silent(local_now) {
            warn!(
                peer = %self.local,
                authority = %self.authority,
                "no clock sync from authority; aborting round"
            );
            self.abort(AbortReason::AuthoritySilent);
            return Err(RoundError::AuthorityLost(AbortReason::AuthoritySilent));
        }

        let now = self.clock.synchronized_time(local_now);
        for action in self.runner.poll(now) {
            debug!(peer = %self.local, ?action, at = now.as_secs(), "scheduled action fired");
            self.fire(action, local_now)?;
        }

        if let Some(report) = self.barrier.poll_deadline(local_now) {
            for peer in &report.evicted {
                self.roster.shift_remove(peer);
            }
            self.events.push(SessionEvent::PeersEvicted {
                peers: report.evicted.clone(),
            });
            if report.outcome == ReadyOutcome::Satisfied {
                info!(
                    peer = %self.local,
                    evicted = ?report.evicted,
                    "readiness barrier timed out; opening without the missing peers"
                );
                return self.open_round(local_now);
            }
            warn!(
                peer = %self.local,
                evicted = ?report.evicted,
                "readiness barrier timed out with nobody ready"
            );
            if self.barrier.expected() == 0 {
                self.abort(AbortReason::NoPeersReady);
            }
            return Err(RoundError::BarrierStall {
                evicted: report.evicted,
            });
        }
        Ok(())
    }

    /// End the active round (authority). Gameplay calls this when the stage is over.
    pub fn end_game(&mut self, local_now: f64) -> Result<(), RoundError> {
        self.require_authority("end_game")?;
        if self.lifecycle.phase_ref() != &RoundPhase::Active {
            debug!(peer = %self.local, phase = ?self.phase(), "round is not active; end ignored");
            return Ok(());
        }

        let grace_at = self
            .clock
            .future_instant(local_now, self.config.settlement_grace_secs);
        self.transition(RoundEvent::GameEnded, |session| {
            session.set_game_active(false);
            session.send(Outgoing {
                target: Target::Others,
                message: PeerMessage::GameActiveChanged { active: false },
            });
            session.runner.schedule(grace_at, RoundAction::SettlementGrace);
            Ok(())
        })?;
        Ok(())
    }

    /// Report that `player` crossed the goal (or survived, on survivor maps).
    pub fn report_finish(&mut self, player: PlayerId, local_now: f64) -> Result<(), RoundError> {
        match self.role {
            PeerRole::Authority => self.record_finish(player, local_now),
            PeerRole::Replica => {
                self.send(Outgoing::to(
                    self.authority,
                    PeerMessage::FinishReport { player },
                ));
                Ok(())
            }
        }
    }

    /// Report that `player` failed to clear the stage.
    pub fn report_failure(&mut self, player: PlayerId) {
        match self.role {
            PeerRole::Authority => self.record_failure(player),
            PeerRole::Replica => self.send(Outgoing::to(
                self.authority,
                PeerMessage::FailureReport { player },
            )),
        }
    }

    /// Report points collected by `player`.
    pub fn report_points(&mut self, player: PlayerId, amount: u32) {
        match self.role {
            PeerRole::Authority => self.record_points(player, amount),
            PeerRole::Replica => self.send(Outgoing::to(
                self.authority,
                PeerMessage::PointsReport { player, amount },
            )),
        }
    }

    /// Reset for the following round, keeping cumulative scores, and announce
    /// readiness again.
    pub fn begin_next_round(&mut self, local_now: f64) -> Result<(), RoundError> {
        if self.is_cancelled() {
            return Err(RoundError::Cancelled);
        }
        if self.round() + 1 >= self.config.max_rounds {
            return Err(RoundError::SessionComplete(self.config.max_rounds));
        }
        self.store.ensure_consistent()?;
        self.advance(RoundEvent::NextRound)?;

        self.runner.cancel_all();
        self.tally.clear();
        self.barrier = ReadinessBarrier::for_members(self.roster.iter().copied());
        self.countdown_index = 0;
        self.start_at = None;
        self.start_handle = None;
        self.countdown_armed = false;
        self.next_scene = None;
        self.set_game_active(false);
        self.set_round_over(false);
        info!(peer = %self.local, round = self.round(), "next round prepared");

        self.enter_round(local_now);
        for peer in std::mem::take(&mut self.early_ready) {
            self.on_ready(peer, local_now)?;
        }
        Ok(())
    }

    /// Abandon the round on this peer and cancel all pending work.
    pub fn abort(&mut self, reason: AbortReason) {
        if self.is_cancelled() {
            return;
        }
        if !self.lifecycle.phase_ref().is_terminal() {
            if let Err(err) = self.advance(RoundEvent::Abort(reason.clone())) {
                warn!(peer = %self.local, error = %err, "abort transition refused");
            }
        }
        let dropped = self.runner.cancel_all();
        self.cancel.cancel();
        self.set_game_active(false);
        warn!(peer = %self.local, %reason, dropped, "round aborted");
        self.events.push(SessionEvent::RoundAborted { reason });
    }

    /// Tear the session down.
    pub fn cancel(&mut self) {
        self.abort(AbortReason::Teardown);
    }

    fn on_ready(&mut self, from: PeerId, local_now: f64) -> Result<(), RoundError> {
        self.require_authority("ready_notify")?;
        if self.phase() == RoundPhase::Ended {
            debug!(peer = %self.local, ready = %from, "ready for next round buffered");
            self.early_ready.insert(from);
            return Ok(());
        }
        match self.barrier.mark_ready(from) {
            ReadyOutcome::Satisfied => {
                info!(
                    peer = %self.local,
                    round = self.round(),
                    ready = self.barrier.ready_count(),
                    "readiness barrier satisfied"
                );
                self.open_round(local_now)
            }
            ReadyOutcome::Waiting { ready, expected } => {
                debug!(peer = %self.local, %from, ready, expected, "peer ready");
                Ok(())
            }
            ReadyOutcome::Duplicate | ReadyOutcome::AlreadySatisfied => {
                debug!(peer = %self.local, %from, "duplicate readiness ignored");
                Ok(())
            }
        }
    }

    fn open_round(&mut self, local_now: f64) -> Result<(), RoundError> {
        let now = self.clock.synchronized_time(local_now);
        let start_at = now.after(self.config.round_start_delay_secs);
        let countdown_at = now.after(self.config.countdown_begin_delay_secs);

        self.transition(RoundEvent::BarrierSatisfied, |session| {
            session.send(Outgoing {
                target: Target::Others,
                message: PeerMessage::ClockSync {
                    authority_time: now.as_secs(),
                },
            });
            session.send(Outgoing::all(PeerMessage::ScheduleRoundStart { at: start_at }));
            session.send(Outgoing::all(PeerMessage::ScheduleCountdownBegin {
                at: countdown_at,
            }));
            Ok(())
        })?;
        Ok(())
    }

    fn arm_round_start(&mut self, at: SyncInstant) -> Result<(), RoundError> {
        if self.phase() == RoundPhase::WaitingForPlayers {
            self.advance(RoundEvent::BarrierSatisfied)?;
        }
        if self.start_at.is_some() {
            debug!(peer = %self.local, "round start already armed");
            return Ok(());
        }
        self.start_at = Some(at);
        self.start_handle = Some(self.runner.schedule(at, RoundAction::StartRound));
        debug!(peer = %self.local, at = at.as_secs(), "round start armed");
        Ok(())
    }

    fn arm_countdown(&mut self, at: SyncInstant) {
        if self.countdown_armed {
            return;
        }
        self.countdown_armed = true;
        for index in 1..=self.config.countdown_max_ticks {
            let offset = f64::from(index) * self.config.countdown_cadence_secs;
            self.runner
                .schedule(at.after(offset), RoundAction::CountdownTick { index });
        }
    }

    fn fire(&mut self, action: RoundAction, local_now: f64) -> Result<(), RoundError> {
        match action {
            RoundAction::StartRound => {
                self.start_handle = None;
                if self.phase() != RoundPhase::Starting {
                    debug!(peer = %self.local, phase = ?self.phase(), "late round start ignored");
                    return Ok(());
                }
                self.advance(RoundEvent::StartReached)?;
                self.set_game_active(true);
                if let (PeerRole::Authority, Some(limit), Some(start)) =
                    (self.role, self.config.round_duration_secs, self.start_at)
                {
                    self.runner
                        .schedule(start.after(limit), RoundAction::RoundTimeout);
                }
                Ok(())
            }
            RoundAction::CountdownTick { index } => {
                self.countdown_index = index;
                self.events.push(SessionEvent::CountdownTick { index });
                Ok(())
            }
            RoundAction::RoundTimeout => {
                info!(peer = %self.local, round = self.round(), "round time limit reached");
                self.end_game(local_now)
            }
            RoundAction::SettlementGrace => self.settle(local_now),
            RoundAction::Teardown { scene } => {
                self.send(Outgoing::all(PeerMessage::SceneTransition { scene }));
                Ok(())
            }
        }
    }

    fn mirror_game_active(&mut self, active: bool) -> Result<(), RoundError> {
        if self.role == PeerRole::Authority {
            return Ok(());
        }
        if active {
            self.set_game_active(true);
            return Ok(());
        }

        if self.phase() == RoundPhase::Starting {
            // The authority ended the round before our start action fired.
            if let Some(handle) = self.start_handle.take() {
                self.runner.cancel(handle);
            }
            self.advance(RoundEvent::StartReached)?;
        }
        self.set_game_active(false);
        if self.phase() == RoundPhase::Active {
            self.advance(RoundEvent::GameEnded)?;
        }
        Ok(())
    }

    fn settle(&mut self, local_now: f64) -> Result<(), RoundError> {
        self.require_authority("settlement")?;
        let round = self.round();
        if self.settled_round == Some(round) {
            debug!(peer = %self.local, round, "round already settled");
            return Ok(());
        }

        self.set_round_over(true);
        self.send(Outgoing {
            target: Target::Others,
            message: PeerMessage::RoundOverFlag { round_over: true },
        });

        if self.map_type == MapType::Points {
            self.tally.resolve_points(self.config.max_finishers);
        }
        let finish_order = self.tally.finish_order();
        let failed = self.tally.failed();
        let settled = self.engine.settle(SettlementInput {
            round,
            map_type: self.map_type,
            prior: self.store.scores(),
            tracked: &self.roster,
            finish_order: &finish_order,
            failed: &failed,
        });
        let settlement = match settled {
            Ok(settlement) => settlement,
            Err(err) => {
                self.abort(AbortReason::SettlementFailed);
                return Err(err);
            }
        };

        info!(
            peer = %self.local,
            round,
            map = ?self.map_type,
            awards = ?settlement.awards,
            skipped = settlement.skipped.len(),
            ranking = ?settlement.snapshot.ranking,
            "round settled"
        );
        self.tally.clear();
        self.settled_round = Some(round);

        let payload = settlement.snapshot.encode()?;
        self.last_payload = Some((round, payload.clone()));
        self.snapshots_produced += 1;
        self.send(Outgoing::all(PeerMessage::SettlementSnapshot { round, payload }));
        self.send(Outgoing::all(PeerMessage::OwnershipTransfer));

        let scene = NextScene::after_round(round, self.config.max_rounds);
        let teardown_at = self
            .clock
            .future_instant(local_now, self.config.teardown_delay_secs);
        self.runner
            .schedule(teardown_at, RoundAction::Teardown { scene });
        Ok(())
    }

    fn apply_snapshot(&mut self, round: u32, payload: &str) -> Result<(), RoundError> {
        match self.store.apply_snapshot(payload) {
            Ok(ApplyOutcome::Applied) => {
                self.events.push(SessionEvent::RankingPublished {
                    snapshot: self.store.ranking_snapshot().clone(),
                });
            }
            Ok(ApplyOutcome::Unchanged) => {}
            Err(err) => {
                if self.role == PeerRole::Replica {
                    self.send(Outgoing::to(self.authority, PeerMessage::ResyncRequest));
                }
                return Err(err.into());
            }
        }

        if self.role == PeerRole::Replica {
            self.tally.clear();
        }
        if round != self.round() {
            debug!(peer = %self.local, round, current = self.round(), "snapshot for another round");
            return Ok(());
        }
        if self.phase() == RoundPhase::Active {
            self.set_game_active(false);
            self.advance(RoundEvent::GameEnded)?;
        }
        if self.phase() == RoundPhase::Settling {
            self.advance(RoundEvent::SettlementApplied)?;
        }
        Ok(())
    }

    fn resend_snapshot(&mut self, to: PeerId) {
        match self.last_payload.clone() {
            Some((round, payload)) => {
                info!(peer = %self.local, %to, round, "resending settlement snapshot");
                self.send(Outgoing::to(
                    to,
                    PeerMessage::SettlementSnapshot { round, payload },
                ));
            }
            None => debug!(peer = %self.local, %to, "resync requested before any settlement"),
        }
    }

    fn hand_off(&mut self, scene: NextScene) -> Result<(), RoundError> {
        if self.next_scene.is_some() {
            return Ok(());
        }
        // The resent snapshot precedes the handoff from the same sender.
        if let Err(err) = self.store.ensure_consistent() {
            warn!(peer = %self.local, round = self.round(), "handoff with an unusable snapshot");
            self.abort(AbortReason::SnapshotRejected);
            return Err(err.into());
        }
        self.events.push(SessionEvent::DestroyRoundObjects);
        self.events.push(SessionEvent::SceneTransition { scene });
        self.next_scene = Some(scene);
        info!(peer = %self.local, round = self.round(), ?scene, "handing off to next scene");
        Ok(())
    }

    fn accepts_results(&self) -> bool {
        matches!(
            self.lifecycle.phase_ref(),
            RoundPhase::Active | RoundPhase::Settling
        ) && self.settled_round != Some(self.round())
    }

    fn record_finish(&mut self, player: PlayerId, local_now: f64) -> Result<(), RoundError> {
        if !self.accepts_results() {
            debug!(peer = %self.local, %player, phase = ?self.phase(), "finish outside the round ignored");
            return Ok(());
        }

        let outcome = if self.map_type == MapType::Survivor {
            if self.tally.record_survivor(player) {
                TallyOutcome::Recorded(self.tally.finish_order().len())
            } else {
                TallyOutcome::Duplicate
            }
        } else {
            self.tally
                .record_finish(player, self.config.max_finishers, self.roster.len())
        };

        let (position, complete) = match outcome {
            TallyOutcome::Duplicate => return Ok(()),
            TallyOutcome::Recorded(position) => (position, false),
            TallyOutcome::RoundComplete(position) => (position, true),
        };
        let position = position as u32;
        info!(peer = %self.local, %player, position, "finish recorded");
        self.events
            .push(SessionEvent::FinishRecorded { player, position });
        self.send(Outgoing {
            target: Target::Others,
            message: PeerMessage::FinishRecorded { player, position },
        });

        if complete {
            self.end_game(local_now)?;
        }
        Ok(())
    }

    fn record_failure(&mut self, player: PlayerId) {
        if self.accepts_results() && self.tally.record_failure(player) {
            debug!(peer = %self.local, %player, "failure recorded");
        }
    }

    fn record_points(&mut self, player: PlayerId, amount: u32) {
        if !self.accepts_results() {
            return;
        }
        let total = self.tally.add_points(player, amount);
        debug!(peer = %self.local, %player, amount, total, "points recorded");
    }

    fn on_peer_left(&mut self, peer: PeerId, local_now: f64) -> Result<(), RoundError> {
        self.roster.shift_remove(&peer);
        info!(peer = %self.local, left = %peer, "peer left the room");

        if peer == self.authority && self.role == PeerRole::Replica {
            self.abort(AbortReason::AuthorityLeft);
            return Err(RoundError::AuthorityLost(AbortReason::AuthorityLeft));
        }
        if self.role == PeerRole::Authority && !self.barrier.is_satisfied() {
            self.early_ready.shift_remove(&peer);
            if self.barrier.evict(peer) == ReadyOutcome::Satisfied
                && self.phase() == RoundPhase::WaitingForPlayers
            {
                return self.open_round(local_now);
            }
        }
        Ok(())
    }

    fn authority_silent(&self, local_now: f64) -> bool {
        let watching = matches!(
            self.lifecycle.phase_ref(),
            RoundPhase::WaitingForPlayers
                | RoundPhase::Starting
                | RoundPhase::Active
                | RoundPhase::Settling
        );
        if !watching {
            return false;
        }
        // A sample from an earlier round says nothing about this one.
        let silence = match (self.clock.since_last_sample(local_now), self.entered_at) {
            (Some(since), Some(entered)) => since.min(local_now - entered),
            (Some(since), None) => since,
            (None, Some(entered)) => local_now - entered,
            (None, None) => return false,
        };
        silence > self.config.authority_timeout_secs
    }

    fn set_game_active(&mut self, active: bool) {
        if self.game_active.set(active).is_some() {
            self.events.push(SessionEvent::GameActive { active });
        }
    }

    fn set_round_over(&mut self, round_over: bool) {
        if self.round_over.set(round_over).is_some() {
            self.events.push(SessionEvent::RoundOver { round_over });
        }
    }

    fn require_authority(&self, operation: &'static str) -> Result<(), RoundError> {
        if self.role == PeerRole::Authority {
            Ok(())
        } else {
            Err(RoundError::WrongRole(operation))
        }
    }

    fn send(&mut self, outgoing: Outgoing) {
        self.outbox.push(outgoing);
    }

    fn advance(&mut self, event: RoundEvent) -> Result<RoundPhase, RoundError> {
        self.transition(event, |_| Ok(()))
    }

    /// Plan `event`, run `work`, then commit. A failing `work` leaves the phase untouched.
    fn transition<F>(&mut self, event: RoundEvent, work: F) -> Result<RoundPhase, RoundError>
    where
        F: FnOnce(&mut Self) -> Result<(), RoundError>,
    {
        let plan = self.lifecycle.plan(event.clone())?;
        if let Err(err) = work(self) {
            if let Err(abort_err) = self.lifecycle.abort(plan.id) {
                warn!(
                    peer = %self.local,
                    event = ?event,
                    plan_id = %plan.id,
                    lifecycle = ?self.lifecycle.snapshot(),
                    error = ?abort_err,
                    "failed to abort transition after work error"
                );
            }
            return Err(err);
        }
        let phase = self.lifecycle.apply(plan.id)?;
        let lifecycle = self.lifecycle.snapshot();
        info!(
            peer = %self.local,
            round = lifecycle.round,
            version = lifecycle.version,
            ?phase,
            "round phase changed"
        );
        self.events.push(SessionEvent::PhaseChanged {
            round: self.round(),
            phase: phase.clone(),
        });
        Ok(phase)
    }
}
