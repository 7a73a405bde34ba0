use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::state::{
    ApplyError, PlanError, ReplicationError,
    round::{AbortReason, PeerId, PlayerId},
};

/// Errors raised by a peer's round session.
#[derive(Debug, Error)]
pub enum RoundError {
    /// Round results name a player that has no score record.
    #[error("player {player} has no score record")]
    UnknownPlayerReference {
        /// The dangling reference.
        player: PlayerId,
    },
    /// A settlement payload could not be applied; the store needs a resync.
    #[error("settlement snapshot rejected")]
    SnapshotDeserialization(#[from] ReplicationError),
    /// The readiness barrier timed out and evicted the listed peers.
    #[error("readiness barrier stalled; evicted {evicted:?}")]
    BarrierStall {
        /// Peers removed from the expected set.
        evicted: Vec<PeerId>,
    },
    /// The authority went away mid-round.
    #[error("authority lost: {0}")]
    AuthorityLost(AbortReason),
    /// The lifecycle refused a transition.
    #[error(transparent)]
    InvalidTransition(#[from] PlanError),
    /// A planned transition could not be committed.
    #[error(transparent)]
    Commit(#[from] ApplyError),
    /// An authority-only message came from some other peer.
    #[error("{kind} from {from} ignored: only the authority may send it")]
    UnauthorizedSender {
        /// Sender of the message.
        from: PeerId,
        /// Message kind.
        kind: &'static str,
    },
    /// The operation is reserved for the other role.
    #[error("{0} is not available to this peer's role")]
    WrongRole(&'static str),
    /// Every round of the session has been played.
    #[error("session already played its {0} rounds")]
    SessionComplete(u32),
    /// The session has been cancelled.
    #[error("session cancelled")]
    Cancelled,
    /// The snapshot could not be serialized.
    #[error("failed to encode settlement snapshot")]
    Encode(#[source] serde_json::Error),
}

/// Errors that can occur in relay service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_http_statuses() {
        let response = AppError::from(ServiceError::NotFound("room lobby".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            AppError::from(ServiceError::InvalidState("peer P1 already connected".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::from(ServiceError::Timeout).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn round_errors_render_player_ids() {
        let err = RoundError::UnknownPlayerReference { player: PeerId(4) };
        assert_eq!(err.to_string(), "player P4 has no score record");
    }
}
