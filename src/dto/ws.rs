use serde::{Deserialize, Serialize};

use crate::{
    dto::message::{Outgoing, PeerMessage},
    state::round::PeerId,
};

#[derive(Debug, Deserialize, Serialize)]
/// First frame a relay client must send.
#[serde(tag = "type")]
pub enum RelayHello {
    #[serde(rename = "hello")]
    Hello { peer_id: PeerId },
}

impl RelayHello {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Self::Hello { peer_id } => *peer_id,
        }
    }
}

/// Frames sent by a client after the hello.
pub type RelayInbound = Outgoing;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
/// Frames pushed to relay clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayOutbound {
    /// Acknowledges the hello.
    Welcome {
        room: String,
        peer_id: PeerId,
        members: Vec<PeerId>,
    },
    /// A message forwarded from `from`.
    Deliver { from: PeerId, message: PeerMessage },
    /// A client frame was refused.
    Rejected { reason: String },
}
