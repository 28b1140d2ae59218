//! Fixtures shared by unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use shared::models::{CachedRoomRecord, RoomId, UserId};

use crate::{
    app_state::AppState,
    bus::{MemoryTransport, Publisher, RoomHub},
    cache::RoomCacheRepository,
    db::{DirectoryError, RoomDirectory, RoomRow},
    services::{EditLockService, RoomService},
    store::{MemoryStore, keys::CachePolicy},
};

pub(crate) fn created_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

pub(crate) fn row(id: RoomId) -> RoomRow {
    RoomRow {
        id,
        title: format!("Room {id}"),
        description: Some("Neighbourhood discussion".into()),
        region: "SUWON".into(),
        access_level: "PUBLIC".into(),
        created_at: created_at(),
    }
}

pub(crate) fn record(id: RoomId, current_users: i64) -> CachedRoomRecord {
    row(id).into_record(current_users)
}

/// Full application state over in-process backends.
pub(crate) fn app_state(store: Arc<MemoryStore>) -> Arc<AppState> {
    let directory = Arc::new(FakeDirectory::default());
    let cache = RoomCacheRepository::new(store.clone(), directory.clone(), CachePolicy::default());
    Arc::new(AppState::new(
        store.clone(),
        RoomService::new(cache, directory),
        EditLockService::new(store, Duration::from_secs(600)),
        Publisher::new(Arc::new(MemoryTransport::default())),
        Arc::new(RoomHub::default()),
    ))
}

/// In-memory store of record that counts room lookups.
#[derive(Debug, Default)]
pub(crate) struct FakeDirectory {
    rooms: Mutex<HashMap<RoomId, (RoomRow, Vec<UserId>)>>,
    lookups: AtomicUsize,
    failing: AtomicBool,
}

impl FakeDirectory {
    pub(crate) fn insert(&self, row: RoomRow, members: Vec<UserId>) {
        self.rooms.lock().unwrap().insert(row.id, (row, members));
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DirectoryError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoomDirectory for FakeDirectory {
    async fn find_room_by_id(&self, room_id: RoomId) -> Result<Option<RoomRow>, DirectoryError> {
        self.check()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map(|(row, _)| row.clone()))
    }

    async fn count_members(&self, room_id: RoomId) -> Result<i64, DirectoryError> {
        self.check()?;
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map_or(0, |(_, members)| members.len() as i64))
    }

    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, DirectoryError> {
        self.check()?;
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map(|(_, members)| members.clone())
            .unwrap_or_default())
    }

    async fn recent_rooms(&self, limit: usize) -> Result<Vec<(RoomRow, i64)>, DirectoryError> {
        self.check()?;
        let mut rooms: Vec<(RoomRow, i64)> = self
            .rooms
            .lock()
            .unwrap()
            .values()
            .map(|(row, members)| (row.clone(), members.len() as i64))
            .collect();
        rooms.sort_by(|a, b| b.0.id.cmp(&a.0.id));
        rooms.truncate(limit);
        Ok(rooms)
    }
}
