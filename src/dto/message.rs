use serde::{Deserialize, Serialize};

use crate::state::{
    clock::SyncInstant,
    round::{NextScene, PeerId, PlayerId},
};

/// Messages exchanged between peers of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A peer finished loading the round.
    ReadyNotify,
    /// The authority's current clock.
    ClockSync {
        /// Absolute authority time in seconds.
        authority_time: f64,
    },
    /// Arms the round-start action.
    ScheduleRoundStart {
        /// Synchronized instant at which the round goes active.
        at: SyncInstant,
    },
    /// Arms the countdown ticks.
    ScheduleCountdownBegin {
        /// Synchronized instant of the first tick.
        at: SyncInstant,
    },
    /// The authority flipped the game-active flag.
    GameActiveChanged {
        /// New value.
        active: bool,
    },
    /// The authority raised (or cleared) the round-over flag.
    RoundOverFlag {
        /// New value.
        round_over: bool,
    },
    /// Canonical settlement outcome.
    SettlementSnapshot {
        /// Round being settled.
        round: u32,
        /// Serialized ranking snapshot.
        payload: String,
    },
    /// Release round-scoped networked objects.
    OwnershipTransfer,
    /// Hand off to the next scene.
    SceneTransition {
        /// Scene to load.
        scene: NextScene,
    },
    /// A replica saw one of its players cross the goal.
    FinishReport {
        /// Player that finished.
        player: PlayerId,
    },
    /// A replica saw one of its players fail the stage.
    FailureReport {
        /// Player that failed.
        player: PlayerId,
    },
    /// A replica collected points for one of its players.
    PointsReport {
        /// Player that scored.
        player: PlayerId,
        /// Points collected.
        amount: u32,
    },
    /// The authority accepted a finish.
    FinishRecorded {
        /// Player that finished.
        player: PlayerId,
        /// One-based finish position.
        position: u32,
    },
    /// A replica lost its replicated state and asks for the last snapshot.
    ResyncRequest,
    /// Relay notice: a peer joined the room.
    PeerJoined {
        /// The new peer.
        peer: PeerId,
    },
    /// Relay notice: a peer left the room.
    PeerLeft {
        /// The departed peer.
        peer: PeerId,
    },
}

impl PeerMessage {
    /// Short name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReadyNotify => "ready_notify",
            Self::ClockSync { .. } => "clock_sync",
            Self::ScheduleRoundStart { .. } => "schedule_round_start",
            Self::ScheduleCountdownBegin { .. } => "schedule_countdown_begin",
            Self::GameActiveChanged { .. } => "game_active_changed",
            Self::RoundOverFlag { .. } => "round_over_flag",
            Self::SettlementSnapshot { .. } => "settlement_snapshot",
            Self::OwnershipTransfer => "ownership_transfer",
            Self::SceneTransition { .. } => "scene_transition",
            Self::FinishReport { .. } => "finish_report",
            Self::FailureReport { .. } => "failure_report",
            Self::PointsReport { .. } => "points_report",
            Self::FinishRecorded { .. } => "finish_recorded",
            Self::ResyncRequest => "resync_request",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
        }
    }

    /// Messages that mutate replicated state and may only come from the authority.
    pub fn is_authority_only(&self) -> bool {
        matches!(
            self,
            Self::ClockSync { .. }
                | Self::ScheduleRoundStart { .. }
                | Self::ScheduleCountdownBegin { .. }
                | Self::GameActiveChanged { .. }
                | Self::RoundOverFlag { .. }
                | Self::SettlementSnapshot { .. }
                | Self::OwnershipTransfer
                | Self::SceneTransition { .. }
                | Self::FinishRecorded { .. }
        )
    }

    /// Notices only the relay itself may emit.
    pub fn is_relay_notice(&self) -> bool {
        matches!(self, Self::PeerJoined { .. } | Self::PeerLeft { .. })
    }
}

/// Addressing for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// Every peer in the room, the sender included.
    All,
    /// Every peer except the sender.
    Others,
    /// A single peer.
    Peer {
        /// Recipient.
        peer: PeerId,
    },
}

impl Target {
    /// Whether a message sent by `sender` under this target reaches `recipient`.
    pub fn includes(self, sender: PeerId, recipient: PeerId) -> bool {
        match self {
            Target::All => true,
            Target::Others => sender != recipient,
            Target::Peer { peer } => peer == recipient,
        }
    }
}

/// A message as delivered to a peer, tagged with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender as stamped by the relay.
    pub from: PeerId,
    /// Payload.
    pub message: PeerMessage,
}

/// A message a session wants sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    /// Recipients.
    pub target: Target,
    /// Payload.
    pub message: PeerMessage,
}

impl Outgoing {
    /// Address `message` to every peer, the sender included.
    pub fn all(message: PeerMessage) -> Self {
        Self {
            target: Target::All,
            message,
        }
    }

    /// Address `message` to a single peer.
    pub fn to(peer: PeerId, message: PeerMessage) -> Self {
        Self {
            target: Target::Peer { peer },
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_snake_case_tags() {
        let json = serde_json::to_string(&PeerMessage::ScheduleRoundStart {
            at: SyncInstant::from_secs(12.5),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"schedule_round_start","at":12.5}"#);

        let parsed: PeerMessage = serde_json::from_str(r#"{"type":"ready_notify"}"#).unwrap();
        assert_eq!(parsed, PeerMessage::ReadyNotify);
    }

    #[test]
    fn targets_select_recipients() {
        let (a, b) = (PeerId(1), PeerId(2));
        assert!(Target::All.includes(a, a));
        assert!(!Target::Others.includes(a, a));
        assert!(Target::Others.includes(a, b));
        assert!(Target::Peer { peer: b }.includes(a, b));
        assert!(!Target::Peer { peer: b }.includes(a, a));
    }

    #[test]
    fn replica_reports_are_not_authority_only() {
        assert!(!PeerMessage::FinishReport { player: PeerId(3) }.is_authority_only());
        assert!(!PeerMessage::ReadyNotify.is_authority_only());
        assert!(PeerMessage::OwnershipTransfer.is_authority_only());
        assert!(PeerMessage::PeerLeft { peer: PeerId(1) }.is_relay_notice());
    }
}
