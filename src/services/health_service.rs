use tracing::debug;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report relay liveness along with the current room and connection counts.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let rooms = state.rooms().room_count();
    let connections = state.rooms().connection_count();
    debug!(rooms, connections, "health check");
    HealthResponse::ok(rooms, connections)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::state::{PeerConnection, RelayState, round::PeerId};

    #[tokio::test]
    async fn counts_rooms_and_connections() {
        let state = RelayState::new();
        let empty = health_status(&state).await;
        assert_eq!((empty.rooms, empty.connections), (0, 0));

        let (tx, _rx) = mpsc::unbounded_channel();
        for (room, peer) in [("arena", 1), ("arena", 2), ("lobby", 1)] {
            state
                .rooms()
                .join(room, PeerId(peer), PeerConnection { tx: tx.clone() })
                .unwrap();
        }
        let status = health_status(&state).await;
        assert_eq!(status.status, "ok");
        assert_eq!((status.rooms, status.connections), (2, 3));
    }
}
