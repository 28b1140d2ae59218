use std::{fmt, sync::Arc};

use crate::{
    bus::{Publisher, RoomHub},
    services::{EditLockService, RoomService},
    store::KeyValueStore,
};

/// Handles shared by the HTTP surface and the background listener.
#[derive(Clone)]
pub struct AppState {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) rooms: RoomService,
    pub(crate) locks: EditLockService,
    pub(crate) publisher: Publisher,
    pub(crate) hub: Arc<RoomHub>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("rooms", &self.rooms)
            .field("locks", &self.locks)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        rooms: RoomService,
        locks: EditLockService,
        publisher: Publisher,
        hub: Arc<RoomHub>,
    ) -> Self {
        Self {
            store,
            rooms,
            locks,
            publisher,
            hub,
        }
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomService {
        &self.rooms
    }

    #[must_use]
    pub fn locks(&self) -> &EditLockService {
        &self.locks
    }

    #[must_use]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}
