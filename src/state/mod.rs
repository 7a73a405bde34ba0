pub mod barrier;
pub mod cancel;
pub mod clock;
pub mod events;
pub mod flag;
pub mod replication;
pub mod round;
pub mod scheduler;
pub mod session;
pub mod settlement;
pub mod state_machine;
pub mod tally;

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::{
    dto::{message::Envelope, ws::RelayOutbound},
    services::{
        relay::{PeerSink, RoomRouter, SinkClosed},
        websocket_service::send_message_to_websocket,
    },
};

pub use self::replication::ReplicationError;
pub use self::state_machine::{
    AbortError, ApplyError, LifecycleSnapshot, Plan, PlanError, PlanId,
};

pub type SharedState = Arc<RelayState>;

#[derive(Clone)]
/// Handle used to push frames to a connected relay client.
pub struct PeerConnection {
    pub tx: mpsc::UnboundedSender<Message>,
}

impl PeerSink for PeerConnection {
    fn deliver(&self, envelope: &Envelope) -> Result<(), SinkClosed> {
        send_message_to_websocket(
            &self.tx,
            &RelayOutbound::Deliver {
                from: envelope.from,
                message: envelope.message.clone(),
            },
        )
        .map_err(|_| SinkClosed)
    }
}

/// Central relay state: rooms and their WebSocket connections.
pub struct RelayState {
    rooms: RoomRouter<PeerConnection>,
}

impl RelayState {
    /// Construct a new [`RelayState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new() -> SharedState {
        Arc::new(Self {
            rooms: RoomRouter::new(),
        })
    }

    /// Registry of rooms and their connected peers.
    pub fn rooms(&self) -> &RoomRouter<PeerConnection> {
        &self.rooms
    }
}
