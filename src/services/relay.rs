//! Room-scoped message forwarding shared by the WebSocket relay and the
//! in-process relay used by simulations and tests.
//!
//! The relay never looks inside round state. It stamps the sender, resolves
//! the target against the room's members and pushes the envelope onto each
//! recipient's FIFO channel, which is what gives per sender to receiver ordering.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    dto::message::{Envelope, Outgoing, PeerMessage, Target},
    error::ServiceError,
    state::round::PeerId,
};

/// Recipient side of a room connection.
pub trait PeerSink: Send + Sync {
    /// Queue `envelope` for the peer. `Err` means the peer is gone.
    fn deliver(&self, envelope: &Envelope) -> Result<(), SinkClosed>;
}

/// The peer behind a sink has disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Rooms keyed by name, each holding its connected peers.
pub struct RoomRouter<S> {
    rooms: DashMap<String, DashMap<PeerId, S>>,
}

impl<S: PeerSink> Default for RoomRouter<S> {
    fn default() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }
}

impl<S: PeerSink> RoomRouter<S> {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` in `room` and announce it to the other members.
    pub fn join(&self, room: &str, peer: PeerId, sink: S) -> Result<Vec<PeerId>, ServiceError> {
        let members = {
            let members = self.rooms.entry(room.to_string()).or_default();
            match members.entry(peer) {
                Entry::Occupied(_) => {
                    return Err(ServiceError::InvalidState(format!(
                        "peer {peer} already connected to room `{room}`"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(sink);
                }
            }
            let mut ids: Vec<PeerId> = members.iter().map(|entry| *entry.key()).collect();
            ids.sort();
            ids
        };
        info!(%room, %peer, members = members.len(), "peer joined room");
        self.forward(
            room,
            peer,
            Target::Others,
            &PeerMessage::PeerJoined { peer },
        );
        Ok(members)
    }

    /// Remove `peer` from `room` and announce the departure. Empty rooms are dropped.
    pub fn leave(&self, room: &str, peer: PeerId) {
        let removed = self
            .rooms
            .get(room)
            .and_then(|members| members.remove(&peer))
            .is_some();
        if !removed {
            return;
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
        info!(%room, %peer, "peer left room");
        self.forward(room, peer, Target::Others, &PeerMessage::PeerLeft { peer });
    }

    /// Forward a message from `from` to every member matched by `target`.
    /// Returns how many peers it reached.
    pub fn forward(&self, room: &str, from: PeerId, target: Target, message: &PeerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        if let Some(members) = self.rooms.get(room) {
            let envelope = Envelope {
                from,
                message: message.clone(),
            };
            for member in members.iter() {
                let recipient = *member.key();
                if !target.includes(from, recipient) {
                    continue;
                }
                match member.value().deliver(&envelope) {
                    Ok(()) => delivered += 1,
                    Err(SinkClosed) => closed.push(recipient),
                }
            }
        }
        debug!(%room, %from, kind = message.kind(), delivered, "message forwarded");

        for peer in closed {
            warn!(%room, %peer, "dropping peer with closed channel");
            self.leave(room, peer);
        }
        delivered
    }

    /// Forward a peer-originated message, refusing relay notices.
    pub fn relay(&self, room: &str, from: PeerId, outgoing: &Outgoing) -> Result<usize, ServiceError> {
        if outgoing.message.is_relay_notice() {
            return Err(ServiceError::InvalidInput(format!(
                "{} is reserved for the relay",
                outgoing.message.kind()
            )));
        }
        Ok(self.forward(room, from, outgoing.target, &outgoing.message))
    }

    /// Connected peers of `room`, sorted.
    pub fn members(&self, room: &str) -> Option<Vec<PeerId>> {
        self.rooms.get(room).map(|members| {
            let mut ids: Vec<PeerId> = members.iter().map(|entry| *entry.key()).collect();
            ids.sort();
            ids
        })
    }

    /// Number of rooms with at least one peer.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of connected peers across all rooms.
    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|room| room.value().len()).sum()
    }
}

/// Sink feeding an in-process peer.
pub struct LocalSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerSink for LocalSink {
    fn deliver(&self, envelope: &Envelope) -> Result<(), SinkClosed> {
        self.tx.send(envelope.clone()).map_err(|_| SinkClosed)
    }
}

/// In-process relay connecting peers of the same process.
#[derive(Clone, Default)]
pub struct LocalRelay {
    router: Arc<RoomRouter<LocalSink>>,
}

impl LocalRelay {
    /// Empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room` as `peer`.
    pub fn connect(&self, room: &str, peer: PeerId) -> Result<PeerLink, ServiceError> {
        let (tx, inbox) = mpsc::unbounded_channel();
        self.router.join(room, peer, LocalSink { tx })?;
        Ok(PeerLink {
            room: room.to_string(),
            peer,
            router: self.router.clone(),
            inbox,
        })
    }

    /// Connected peers of `room`.
    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.router.members(room).unwrap_or_default()
    }
}

/// One peer's connection to a [`LocalRelay`]. Dropping it leaves the room.
pub struct PeerLink {
    room: String,
    peer: PeerId,
    router: Arc<RoomRouter<LocalSink>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl PeerLink {
    /// The connected peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Send a message into the room.
    pub fn send(&self, outgoing: &Outgoing) -> Result<usize, ServiceError> {
        self.router.relay(&self.room, self.peer, outgoing)
    }

    /// Next delivered message; `None` once the relay dropped this peer.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Delivered message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.router.leave(&self.room, self.peer);
    }
}
