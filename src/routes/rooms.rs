use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::{
    dto::room::RoomSummary, error::AppError, services::room_service, state::SharedState,
};

/// List the peers connected to a room.
pub async fn get_room(
    State(state): State<SharedState>,
    Path(room): Path<String>,
) -> Result<Json<RoomSummary>, AppError> {
    Ok(Json(room_service::room_summary(&state, &room)?))
}

/// Configure the room inspection routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/rooms/{room}", get(get_room))
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};
    use tokio::sync::mpsc;

    use super::*;
    use crate::state::{PeerConnection, RelayState, round::PeerId};

    #[tokio::test]
    async fn missing_room_maps_to_not_found() {
        let state = RelayState::new();
        let response = get_room(State(state), Path("arena".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connected_room_is_summarized() {
        let state = RelayState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .rooms()
            .join("arena", PeerId(7), PeerConnection { tx })
            .unwrap();
        let Json(summary) = get_room(State(state), Path("arena".into())).await.unwrap();
        assert_eq!(summary.peers, vec![PeerId(7)]);
    }
}
