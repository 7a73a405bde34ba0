use axum::Router;

use crate::state::SharedState;

pub mod health;
pub mod rooms;
pub mod websocket;

/// Compose all route trees and wire in the shared relay state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(rooms::router())
        .merge(websocket::router())
        .with_state(state)
}
