use std::fmt;

use serde::{Deserialize, Serialize};

/// Network identity of a peer inside a room (the relay's actor number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

/// Players are identified by the actor number of the peer that controls them.
pub type PlayerId = PeerId;

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Role a peer plays for the whole lifetime of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// The single peer whose clock and computed state are canonical.
    Authority,
    /// Any other peer; mirrors what the authority broadcasts.
    Replica,
}

/// Kind of stage being played, which decides how settlement hands out bonuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    /// Race to a goal line; the finish order earns tiered rank bonuses.
    #[default]
    Race,
    /// Point collection (hoops); totals are converted into a finish order at round end.
    Points,
    /// Non-elimination survival; every recorded survivor earns a flat bonus.
    Survivor,
}

impl MapType {
    /// Whether settlement uses the tiered rank bonuses for this map.
    pub fn is_ranked(self) -> bool {
        !matches!(self, MapType::Survivor)
    }
}

/// Scene the presentation layer should load once a round has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextScene {
    /// Intermediate standings between rounds.
    RoundResult,
    /// Final standings after the session's last round.
    GameResult,
}

impl NextScene {
    /// Pick the handoff target for the round at `round_index` (zero based).
    pub fn after_round(round_index: u32, max_rounds: u32) -> Self {
        if round_index + 1 >= max_rounds {
            NextScene::GameResult
        } else {
            NextScene::RoundResult
        }
    }
}

/// Why a round was abandoned before settlement completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// No clock sync arrived from the authority within the configured window.
    AuthoritySilent,
    /// The relay reported that the authority left the room.
    AuthorityLeft,
    /// Every expected peer was evicted before the barrier could open.
    NoPeersReady,
    /// Settlement refused the round results.
    SettlementFailed,
    /// The replicated store could not be restored before the handoff.
    SnapshotRejected,
    /// The host tore the session down.
    Teardown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::AuthoritySilent => "authority stopped sending clock sync",
            AbortReason::AuthorityLeft => "authority left the room",
            AbortReason::NoPeersReady => "no peer became ready",
            AbortReason::SettlementFailed => "settlement failed",
            AbortReason::SnapshotRejected => "settlement snapshot could not be applied",
            AbortReason::Teardown => "session torn down",
        };
        f.write_str(text)
    }
}
