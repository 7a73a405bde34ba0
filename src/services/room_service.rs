use crate::{dto::room::RoomSummary, error::ServiceError, state::SharedState};

/// Describe the peers currently connected to `room`.
pub fn room_summary(state: &SharedState, room: &str) -> Result<RoomSummary, ServiceError> {
    let peers = state
        .rooms()
        .members(room)
        .ok_or_else(|| ServiceError::NotFound(format!("room `{room}` has no connected peers")))?;
    Ok(RoomSummary {
        room: room.to_string(),
        peers,
    })
}
