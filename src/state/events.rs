use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::{
    round::{AbortReason, NextScene, PeerId, PlayerId},
    settlement::RankingSnapshot,
    state_machine::RoundPhase,
};

/// Observable outcome of a session step, published for presentation
/// collaborators (results UI, audio and visual triggers).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The lifecycle entered a new phase.
    PhaseChanged {
        /// Zero-based round.
        round: u32,
        /// New phase.
        phase: RoundPhase,
    },
    /// The game-active flag changed value.
    GameActive {
        /// New value.
        active: bool,
    },
    /// The round-over flag changed value.
    RoundOver {
        /// New value.
        round_over: bool,
    },
    /// A countdown tick fired.
    CountdownTick {
        /// One-based tick index, capped at the configured maximum.
        index: u32,
    },
    /// The authority accepted a finish.
    FinishRecorded {
        /// Player that finished.
        player: PlayerId,
        /// One-based finish position.
        position: u32,
    },
    /// A settlement snapshot was applied locally.
    RankingPublished {
        /// The applied snapshot.
        snapshot: RankingSnapshot,
    },
    /// Round-scoped networked objects should be released.
    ReleaseRoundObjects,
    /// Remaining round-scoped objects should be destroyed.
    DestroyRoundObjects,
    /// Control passes to the next scene.
    SceneTransition {
        /// Scene to load.
        scene: NextScene,
    },
    /// Silent peers were dropped from the readiness barrier.
    PeersEvicted {
        /// Dropped peers.
        peers: Vec<PeerId>,
    },
    /// The round was abandoned.
    RoundAborted {
        /// Why.
        reason: AbortReason,
    },
}

/// Broadcast hub fanning session events out to subscribers.
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();

        hub.broadcast(SessionEvent::GameActive { active: true });
        hub.broadcast(SessionEvent::CountdownTick { index: 1 });

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::GameActive { active: true }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::CountdownTick { index: 1 }
        );
    }

    #[test]
    fn broadcasting_without_subscribers_is_harmless() {
        let hub = EventHub::default();
        hub.broadcast(SessionEvent::ReleaseRoundObjects);

        let mut late = hub.subscribe();
        assert!(late.try_recv().is_err());
    }
}
