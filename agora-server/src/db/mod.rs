pub mod room_directory;

pub use room_directory::{DirectoryError, PgRoomDirectory, RoomDirectory, RoomRow, ensure_liveness};
