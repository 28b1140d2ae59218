use serde::{Deserialize, Serialize};

use super::{RoomId, UserId};

/// Kind of chat event travelling through the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatEventType {
    Chat,
    Join,
    Leave,
}

impl ChatEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
        }
    }
}

/// Transient chat message broadcast to every instance; never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    #[serde(rename = "type")]
    pub kind: ChatEventType,
    #[serde(default)]
    pub content: String,
    pub room_id: RoomId,
    pub user_id: UserId,
}

impl ChatEnvelope {
    #[must_use]
    pub fn chat(room_id: RoomId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            kind: ChatEventType::Chat,
            content: content.into(),
            room_id,
            user_id,
        }
    }

    #[must_use]
    pub fn join(room_id: RoomId, user_id: UserId) -> Self {
        Self {
            kind: ChatEventType::Join,
            content: String::new(),
            room_id,
            user_id,
        }
    }

    #[must_use]
    pub fn leave(room_id: RoomId, user_id: UserId) -> Self {
        Self {
            kind: ChatEventType::Leave,
            content: String::new(),
            room_id,
            user_id,
        }
    }

    /// Local fan-out destination for this envelope's room.
    #[must_use]
    pub fn topic(&self) -> String {
        room_topic(self.room_id)
    }
}

/// Destination sessions subscribe to for a room, e.g. `/topic/room/7`.
#[must_use]
pub fn room_topic(room_id: RoomId) -> String {
    format!("/topic/room/{room_id}")
}
