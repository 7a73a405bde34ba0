use serde::Serialize;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status ("ok").
    pub status: String,
    /// Rooms with at least one connected peer.
    pub rooms: usize,
    /// Connected peers across all rooms.
    pub connections: usize,
}

impl HealthResponse {
    /// Create a health response indicating the relay is operational.
    pub fn ok(rooms: usize, connections: usize) -> Self {
        Self {
            status: "ok".to_string(),
            rooms,
            connections,
        }
    }
}
