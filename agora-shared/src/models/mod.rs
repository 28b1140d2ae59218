pub mod chat;
pub mod lock;
pub mod room;

pub use chat::{ChatEnvelope, ChatEventType};
pub use lock::LockStatus;
pub use room::{
    CachedRoomRecord, JoinRoomResponse, RecordDecodeError, RoomListResponse, RoomsPage,
};

/// Store-of-record identifier of a discussion room.
pub type RoomId = i64;

/// Store-of-record identifier of a user.
pub type UserId = i64;

/// Store-of-record identifier of a proposal document.
pub type ProposalId = i64;
