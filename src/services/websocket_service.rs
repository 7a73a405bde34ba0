use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    dto::ws::{RelayHello, RelayInbound, RelayOutbound},
    error::ServiceError,
    state::{PeerConnection, SharedState, round::PeerId},
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal error type for relay frame handling.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Writer channel closed - connection should be terminated immediately.
    #[error("connection closed")]
    ConnectionClosed,
    /// Frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Error from the room router.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Handle the full lifecycle for an individual relay WebSocket connection.
pub async fn handle_socket(state: SharedState, room: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound frames flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(HELLO_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(_) => {
            warn!(%room, "websocket hello timed out");
            refuse(&outbound_tx, ServiceError::Timeout.to_string());
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let peer = match RelayHello::from_json_str(&initial_message) {
        Ok(hello) => hello.peer_id(),
        Err(err) => {
            warn!(%room, error = %err, "first frame was not a hello");
            refuse(&outbound_tx, format!("expected hello: {err}"));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let members = match state.rooms().join(
        &room,
        peer,
        PeerConnection {
            tx: outbound_tx.clone(),
        },
    ) {
        Ok(members) => members,
        Err(err) => {
            warn!(%room, %peer, error = %err, "join refused");
            refuse(&outbound_tx, err.to_string());
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    info!(%room, %peer, "relay peer connected");

    let welcome = RelayOutbound::Welcome {
        room: room.clone(),
        peer_id: peer,
        members,
    };
    if send_message_to_websocket(&outbound_tx, &welcome).is_err() {
        info!(%room, %peer, "connection closed during welcome, terminating");
        state.rooms().leave(&room, peer);
        finalize(writer_task, outbound_tx).await;
        return;
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(err) = handle_frame(&state, &room, peer, &text) {
                    warn!(%room, %peer, error = %err, "relay frame refused");
                    if reject(&outbound_tx, err.to_string()).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(%room, %peer, "relay peer closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%room, %peer, error = %err, "websocket error");
                break;
            }
        }
    }

    state.rooms().leave(&room, peer);
    info!(%room, %peer, "relay peer disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Parse a client frame and forward it to the addressed peers.
fn handle_frame(state: &SharedState, room: &str, peer: PeerId, text: &str) -> Result<(), RelayError> {
    let frame: RelayInbound = serde_json::from_str(text)?;
    state.rooms().relay(room, peer, &frame)?;
    Ok(())
}

fn reject(tx: &mpsc::UnboundedSender<Message>, reason: String) -> Result<(), RelayError> {
    send_message_to_websocket(tx, &RelayOutbound::Rejected { reason })
}

/// Reject the connection and close it.
fn refuse(tx: &mpsc::UnboundedSender<Message>, reason: String) {
    let _ = reject(tx, reason);
    let _ = tx.send(Message::Close(None));
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; only a closed writer is
/// reported back to the caller.
pub fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), RelayError>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| RelayError::ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dto::message::PeerMessage,
        state::RelayState,
    };

    fn connect(state: &SharedState, room: &str, peer: u32) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .rooms()
            .join(room, PeerId(peer), PeerConnection { tx })
            .unwrap();
        rx
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> RelayOutbound {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[test]
    fn frames_are_forwarded_as_deliveries() {
        let state = RelayState::new();
        let mut first = connect(&state, "arena", 1);
        let mut second = connect(&state, "arena", 2);
        assert_eq!(
            next_frame(&mut first),
            RelayOutbound::Deliver {
                from: PeerId(2),
                message: PeerMessage::PeerJoined { peer: PeerId(2) },
            }
        );

        handle_frame(
            &state,
            "arena",
            PeerId(2),
            r#"{"target":{"kind":"peer","peer":1},"message":{"type":"ready_notify"}}"#,
        )
        .unwrap();
        assert_eq!(
            next_frame(&mut first),
            RelayOutbound::Deliver {
                from: PeerId(2),
                message: PeerMessage::ReadyNotify,
            }
        );
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn malformed_and_forged_frames_are_refused() {
        let state = RelayState::new();
        let _first = connect(&state, "arena", 1);

        assert!(matches!(
            handle_frame(&state, "arena", PeerId(1), "{not json"),
            Err(RelayError::Malformed(_))
        ));
        assert!(matches!(
            handle_frame(
                &state,
                "arena",
                PeerId(1),
                r#"{"target":{"kind":"all"},"message":{"type":"peer_left","peer":2}}"#,
            ),
            Err(RelayError::Service(ServiceError::InvalidInput(_)))
        ));
    }

    #[test]
    fn refused_connections_get_a_reason_then_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        refuse(&tx, ServiceError::Timeout.to_string());

        assert_eq!(
            next_frame(&mut rx),
            RelayOutbound::Rejected {
                reason: "operation timed out".into()
            }
        );
        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
    }

    #[test]
    fn closed_clients_are_pruned() {
        let state = RelayState::new();
        let _first = connect(&state, "arena", 1);
        let second = connect(&state, "arena", 2);
        drop(second);

        let reached = state
            .rooms()
            .forward("arena", PeerId(1), crate::dto::message::Target::All, &PeerMessage::OwnershipTransfer);
        assert_eq!(reached, 1);
        assert_eq!(state.rooms().members("arena"), Some(vec![PeerId(1)]));
    }
}
