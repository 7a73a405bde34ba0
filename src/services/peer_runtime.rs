//! Tokio driver for a single peer's [`RoundSession`].

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    error::RoundError,
    services::relay::PeerLink,
    state::{
        clock::LocalClock,
        events::{EventHub, SessionEvent},
        round::{AbortReason, NextScene, PeerId, PlayerId},
        session::RoundSession,
        settlement::RankingSnapshot,
        state_machine::RoundPhase,
    },
};

/// Default cadence at which sessions are ticked.
pub const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Instructions from local gameplay collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    /// A player crossed the goal or survived.
    Finish(PlayerId),
    /// A player failed to clear the stage.
    Failure(PlayerId),
    /// A player collected points.
    Points(PlayerId, u32),
    /// Stage logic says the round is over (authority only).
    EndGame,
    /// Tear the session down.
    Cancel,
}

/// Cloneable handle used by gameplay code to talk to a running peer.
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::UnboundedSender<LocalCommand>,
    events: Arc<EventHub>,
}

impl RuntimeHandle {
    /// Queue a command; returns `false` when the runtime is gone.
    pub fn send(&self, command: LocalCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Subscribe to the peer's session events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Final view of a round from one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    /// The peer.
    pub peer: PeerId,
    /// Zero-based round.
    pub round: u32,
    /// Phase when the driver stopped.
    pub phase: RoundPhase,
    /// Scene handed to.
    pub next_scene: Option<NextScene>,
    /// Replicated outcome.
    pub snapshot: RankingSnapshot,
    /// Canonical serialization of the replicated store.
    pub encoded: String,
}

/// Owns one session, its relay link and its clock, and drives them from a
/// single task.
pub struct PeerRuntime<C> {
    session: RoundSession,
    link: PeerLink,
    clock: C,
    events: Arc<EventHub>,
    commands: mpsc::UnboundedReceiver<LocalCommand>,
    tick: Duration,
}

impl<C: LocalClock> PeerRuntime<C> {
    /// Wire `session` to `link`, returning the runtime and its handle.
    pub fn new(session: RoundSession, link: PeerLink, clock: C) -> (Self, RuntimeHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let events = Arc::new(EventHub::default());
        let handle = RuntimeHandle {
            commands: tx,
            events: events.clone(),
        };
        (
            Self {
                session,
                link,
                clock,
                events,
                commands,
                tick: DEFAULT_TICK,
            },
            handle,
        )
    }

    /// Override the tick cadence.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// The driven session.
    pub fn session(&self) -> &RoundSession {
        &self.session
    }

    /// Play the first round until it hands off or aborts.
    pub async fn run_round(&mut self) -> Result<RoundOutcome, RoundError> {
        let now = self.clock.now_secs();
        self.session.enter_round(now);
        self.drive().await
    }

    /// Reset for the next round and play it.
    pub async fn run_next_round(&mut self) -> Result<RoundOutcome, RoundError> {
        let now = self.clock.now_secs();
        self.session.begin_next_round(now)?;
        self.drive().await
    }

    async fn drive(&mut self) -> Result<RoundOutcome, RoundError> {
        let peer = self.session.local();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fatal: Option<RoundError> = None;

        self.flush();
        while !self.session.is_finished() {
            let step = tokio::select! {
                delivered = self.link.recv() => match delivered {
                    Some(envelope) => {
                        let now = self.clock.now_secs();
                        self.session.handle(envelope, now)
                    }
                    None => {
                        warn!(%peer, "relay link closed");
                        self.session.abort(AbortReason::Teardown);
                        Err(RoundError::Cancelled)
                    }
                },
                Some(command) = self.commands.recv() => self.apply(command),
                _ = ticker.tick() => {
                    let now = self.clock.now_secs();
                    self.session.tick(now)
                }
            };

            if let Err(err) = step {
                if self.session.is_cancelled() {
                    fatal = Some(err);
                } else {
                    warn!(%peer, error = %err, "round step failed");
                }
            }
            self.flush();
        }

        if self.session.is_cancelled() {
            let err = fatal.unwrap_or(match self.session.phase() {
                RoundPhase::Aborted(
                    reason @ (AbortReason::AuthorityLeft | AbortReason::AuthoritySilent),
                ) => RoundError::AuthorityLost(reason),
                _ => RoundError::Cancelled,
            });
            warn!(%peer, error = %err, "round ended without settlement");
            return Err(err);
        }

        let store = self.session.store();
        store.ensure_consistent()?;
        let outcome = RoundOutcome {
            peer,
            round: self.session.round(),
            phase: self.session.phase(),
            next_scene: self.session.next_scene(),
            snapshot: store.ranking_snapshot().clone(),
            encoded: store.encode().map_err(RoundError::Encode)?,
        };
        info!(%peer, round = outcome.round, scene = ?outcome.next_scene, "round finished");
        Ok(outcome)
    }

    fn apply(&mut self, command: LocalCommand) -> Result<(), RoundError> {
        let now = self.clock.now_secs();
        debug!(peer = %self.session.local(), ?command, "local command");
        match command {
            LocalCommand::Finish(player) => self.session.report_finish(player, now),
            LocalCommand::Failure(player) => {
                self.session.report_failure(player);
                Ok(())
            }
            LocalCommand::Points(player, amount) => {
                self.session.report_points(player, amount);
                Ok(())
            }
            LocalCommand::EndGame => self.session.end_game(now),
            LocalCommand::Cancel => {
                self.session.cancel();
                Err(RoundError::Cancelled)
            }
        }
    }

    fn flush(&mut self) {
        for outgoing in self.session.drain_outbox() {
            if let Err(err) = self.link.send(&outgoing) {
                warn!(
                    peer = %self.session.local(),
                    kind = outgoing.message.kind(),
                    error = %err,
                    "failed to send message"
                );
            }
        }
        for event in self.session.drain_events() {
            self.events.broadcast(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RoundConfig,
        services::relay::LocalRelay,
        state::{
            clock::TokioClock,
            round::MapType,
            session::SessionSetup,
        },
    };

    fn fast_config() -> RoundConfig {
        RoundConfig {
            clock_sync_interval_ms: 10,
            round_start_delay_secs: 0.1,
            countdown_begin_delay_secs: 0.1,
            countdown_cadence_secs: 0.05,
            settlement_grace_secs: 0.1,
            teardown_delay_secs: 0.1,
            round_duration_secs: Some(0.3),
            barrier_timeout_secs: None,
            ..RoundConfig::default()
        }
    }

    fn runtime(
        relay: &LocalRelay,
        local: u32,
        members: &[PeerId],
        skew: f64,
    ) -> (PeerRuntime<TokioClock>, RuntimeHandle) {
        let link = relay.connect("arena", PeerId(local)).unwrap();
        let session = RoundSession::new(SessionSetup {
            local: PeerId(local),
            authority: PeerId(1),
            members: members.to_vec(),
            map_type: MapType::Race,
            config: fast_config(),
        });
        let (runtime, handle) = PeerRuntime::new(session, link, TokioClock::with_skew(skew));
        (runtime.with_tick(Duration::from_millis(5)), handle)
    }

    #[tokio::test]
    async fn peers_converge_on_the_same_snapshot() {
        let relay = LocalRelay::new();
        let members = [PeerId(1), PeerId(2), PeerId(3)];
        let (mut authority, _authority_handle) = runtime(&relay, 1, &members, 0.0);
        let (mut second, second_handle) = runtime(&relay, 2, &members, 40.0);
        let (mut third, _third_handle) = runtime(&relay, 3, &members, -12.5);

        let mut events = second_handle.subscribe();
        let driver = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event == (SessionEvent::GameActive { active: true }) {
                    second_handle.send(LocalCommand::Finish(PeerId(2)));
                    break;
                }
            }
        });

        let (a, b, c) = tokio::join!(authority.run_round(), second.run_round(), third.run_round());
        driver.await.unwrap();
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(a.encoded, b.encoded);
        assert_eq!(a.encoded, c.encoded);
        assert_eq!(a.phase, RoundPhase::Ended);
        assert_eq!(a.next_scene, Some(NextScene::RoundResult));
        assert_eq!(a.snapshot.score_of(PeerId(2)), Some(5000));
        assert_eq!(a.snapshot.ranking.first(), Some(&PeerId(2)));
    }

    #[tokio::test]
    async fn replicas_abort_when_the_authority_disconnects() {
        let relay = LocalRelay::new();
        let members = [PeerId(1), PeerId(2)];
        let (authority, _authority_handle) = runtime(&relay, 1, &members, 0.0);
        let (mut replica, _replica_handle) = runtime(&relay, 2, &members, 3.0);

        drop(authority);
        let err = replica.run_round().await.unwrap_err();
        assert!(matches!(
            err,
            RoundError::AuthorityLost(AbortReason::AuthorityLeft)
        ));
        assert_eq!(
            replica.session().phase(),
            RoundPhase::Aborted(AbortReason::AuthorityLeft)
        );
    }

    #[tokio::test]
    async fn cancel_command_stops_the_driver() {
        let relay = LocalRelay::new();
        let members = [PeerId(1), PeerId(2)];
        let (mut authority, handle) = runtime(&relay, 1, &members, 0.0);
        handle.send(LocalCommand::Cancel);

        let err = authority.run_round().await.unwrap_err();
        assert!(matches!(err, RoundError::Cancelled));
        assert!(authority.session().is_cancelled());
    }
}
