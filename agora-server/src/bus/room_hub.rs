use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use shared::models::{ChatEnvelope, RoomId, chat::room_topic};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_ROOM_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("local delivery to {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },
}

/// Process-local one-to-many delivery addressed by room.
pub trait RoomBroadcast: Send + Sync {
    /// Hands the envelope to every local session subscribed to its room and
    /// returns how many there were.
    ///
    /// # Errors
    /// Returns [`DispatchError`] when the local delivery primitive fails.
    fn broadcast(&self, envelope: ChatEnvelope) -> Result<usize, DispatchError>;
}

/// One tokio broadcast channel per room with at least one local session,
/// addressed as `/topic/room/{roomId}`.
#[derive(Debug)]
pub struct RoomHub {
    rooms: RwLock<HashMap<RoomId, broadcast::Sender<ChatEnvelope>>>,
    capacity: usize,
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

impl RoomHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Attaches a local session to a room.
    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<ChatEnvelope> {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops channels whose sessions have all gone. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let before = rooms.len();
        rooms.retain(|_, sender| sender.receiver_count() > 0);
        let pruned = before - rooms.len();
        if pruned > 0 {
            debug!(pruned, "pruned idle room channels");
        }
        pruned
    }

    /// Rooms with at least one attached session, ascending.
    #[must_use]
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, sender)| sender.receiver_count() > 0)
            .map(|(room_id, _)| *room_id)
            .collect();
        active.sort_unstable();
        active
    }
}

impl RoomBroadcast for RoomHub {
    fn broadcast(&self, envelope: ChatEnvelope) -> Result<usize, DispatchError> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = rooms.get(&envelope.room_id) else {
            debug!(topic = %room_topic(envelope.room_id), "no local sessions for room");
            return Ok(0);
        };
        // A send error only means every session detached since the lookup.
        Ok(sender.send(envelope).unwrap_or(0))
    }
}
