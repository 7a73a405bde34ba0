use serde::Serialize;

use crate::state::round::PeerId;

/// Connected peers of a relay room.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RoomSummary {
    /// Room name.
    pub room: String,
    /// Connected peers, sorted.
    pub peers: Vec<PeerId>,
}
