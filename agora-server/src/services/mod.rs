//! Flows that combine the cache, the store of record and the lock store.
pub mod edit_lock;
pub mod room_service;

pub use edit_lock::EditLockService;
pub use room_service::{RoomService, RoomServiceError};
