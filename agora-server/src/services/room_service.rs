//! Room flows on top of the cache and the store of record.
//!
//! The store of record has already been written when these run. Cache
//! failures never fail a flow: writes are dropped after logging and reads fall
//! back to the [`RoomDirectory`].

use std::{fmt, sync::Arc};

use chrono::{DateTime, NaiveDateTime, Utc};
use shared::models::{
    CachedRoomRecord, JoinRoomResponse, RoomId, RoomListResponse, RoomsPage, UserId,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{CacheResult, RoomCacheRepository},
    db::{DirectoryError, RoomDirectory},
};

#[derive(Debug, Error)]
pub enum RoomServiceError {
    #[error("room {0} not found")]
    NotFound(RoomId),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Clone)]
pub struct RoomService {
    cache: RoomCacheRepository,
    directory: Arc<dyn RoomDirectory>,
}

impl fmt::Debug for RoomService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomService")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn joined_at(timestamp_ms: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(Utc::now)
        .naive_utc()
}

fn first_offset(page: usize, size: usize) -> usize {
    page.saturating_sub(1).saturating_mul(size)
}

impl RoomService {
    #[must_use]
    pub fn new(cache: RoomCacheRepository, directory: Arc<dyn RoomDirectory>) -> Self {
        Self { cache, directory }
    }

    #[must_use]
    pub fn cache(&self) -> &RoomCacheRepository {
        &self.cache
    }

    /// Write-through after the room and its creator's membership were persisted.
    #[instrument(name = "rooms.created", skip(self, record), fields(room_id = record.id))]
    pub async fn room_created(&self, record: &CachedRoomRecord, creator: UserId, timestamp_ms: i64) {
        if self
            .cache
            .save_new_room(record, creator, timestamp_ms)
            .await
            .is_ok()
        {
            info!(creator, "room cached on creation");
        }
    }

    /// # Errors
    /// [`RoomServiceError::NotFound`] when neither cache nor store of record
    /// knows the room; [`RoomServiceError::Directory`] when the fallback read fails.
    #[instrument(name = "rooms.summary", skip(self), err)]
    pub async fn room_summary(&self, room_id: RoomId) -> Result<CachedRoomRecord, RoomServiceError> {
        match self.cache.get_room(room_id).await {
            Ok(Some(room)) => Ok(room),
            Ok(None) => Err(RoomServiceError::NotFound(room_id)),
            Err(_) => self
                .load_from_directory(room_id)
                .await?
                .ok_or(RoomServiceError::NotFound(room_id)),
        }
    }

    async fn load_from_directory(
        &self,
        room_id: RoomId,
    ) -> Result<Option<CachedRoomRecord>, DirectoryError> {
        let Some(row) = self.directory.find_room_by_id(room_id).await? else {
            return Ok(None);
        };
        let current_users = self.directory.count_members(room_id).await?;
        Ok(Some(row.into_record(current_users)))
    }

    /// System-wide rooms, newest first. `page` is one-based.
    ///
    /// # Errors
    /// Only when the cache is down and the store of record fails as well.
    #[instrument(name = "rooms.browse", skip(self), err)]
    pub async fn browse(&self, page: usize, size: usize) -> Result<RoomListResponse, RoomServiceError> {
        let listing = self.cache.list_page(first_offset(page, size), size).await;
        self.build_listing(listing, page, size).await
    }

    /// Rooms `user` joined, most recent join first. `page` is one-based.
    ///
    /// # Errors
    /// Only when the cache is down and the store of record fails as well.
    #[instrument(name = "rooms.joined", skip(self), err)]
    pub async fn joined_rooms(
        &self,
        user: UserId,
        page: usize,
        size: usize,
    ) -> Result<RoomListResponse, RoomServiceError> {
        let listing = self
            .cache
            .list_user_page(user, first_offset(page, size), size)
            .await;
        self.build_listing(listing, page, size).await
    }

    async fn build_listing(
        &self,
        listing: CacheResult<RoomsPage>,
        page: usize,
        size: usize,
    ) -> Result<RoomListResponse, RoomServiceError> {
        let listing = listing.unwrap_or_default();
        if listing.room_ids.is_empty() {
            debug!(page, size, total = listing.total_count, "no rooms on page");
            return Ok(RoomListResponse::new(Vec::new(), page, size, listing.total_count));
        }

        let rooms = match self.cache.hydrate_many(&listing.room_ids).await {
            Ok(rooms) => rooms,
            Err(_) => {
                let mut rooms = Vec::with_capacity(listing.room_ids.len());
                for &room_id in &listing.room_ids {
                    if let Some(room) = self.load_from_directory(room_id).await? {
                        rooms.push(room);
                    }
                }
                rooms
            }
        };

        debug!(page, size, found = rooms.len(), total = listing.total_count, "listed rooms");
        Ok(RoomListResponse::new(rooms, page, size, listing.total_count))
    }

    /// Cache side of a join that was already persisted.
    ///
    /// # Errors
    /// [`RoomServiceError::NotFound`] for an unknown room, or a store-of-record
    /// failure while refilling the member list.
    #[instrument(name = "rooms.member_joined", skip(self), err)]
    pub async fn member_joined(
        &self,
        user: UserId,
        room_id: RoomId,
        timestamp_ms: i64,
    ) -> Result<JoinRoomResponse, RoomServiceError> {
        // The join bookkeeping only bumps a room that is already cached, so
        // reading afterwards sees the new member exactly once. Failure is
        // already logged; the indexes heal via TTL and read-repair.
        let _ = self.cache.add_member(user, room_id, timestamp_ms).await;
        let room = self.room_summary(room_id).await?;

        let member_ids = match self.cache.room_members(room_id).await {
            Ok(members) if !members.is_empty() => members,
            _ => {
                let members = self.directory.member_ids(room_id).await?;
                let _ = self.cache.cache_room_members(room_id, &members).await;
                debug!(room_id, count = members.len(), "refilled member list");
                members
            }
        };

        info!(user, room_id, members = member_ids.len(), "member joined room");
        Ok(JoinRoomResponse::new(room, member_ids, joined_at(timestamp_ms)))
    }

    /// Cache side of a leave. `remaining` is the member count the store of
    /// record reports afterwards; an empty room is evicted.
    #[instrument(name = "rooms.member_left", skip(self))]
    pub async fn member_left(&self, user: UserId, room_id: RoomId, remaining: i64) {
        let _ = self.cache.remove_member(user, room_id).await;
        if remaining == 0 {
            // The creator is not known here, so their joined index keeps the
            // id until its TTL or trim.
            info!(room_id, "last member left, evicting room");
            let _ = self.cache.evict_room(room_id, None).await;
        }
    }

    /// Loads the most recent rooms from the store of record into the cache.
    ///
    /// # Errors
    /// Returns [`RoomServiceError::Directory`] if the rooms cannot be read.
    #[instrument(name = "rooms.warm_up", skip(self), err)]
    pub async fn warm_up(&self, limit: usize) -> Result<usize, RoomServiceError> {
        let records: Vec<CachedRoomRecord> = self
            .directory
            .recent_rooms(limit)
            .await?
            .into_iter()
            .map(|(row, current_users)| row.into_record(current_users))
            .collect();

        match self.cache.warm_cache(&records).await {
            Ok(written) => Ok(written),
            Err(err) => {
                warn!(error = %err, "skipping cache warm-up");
                Ok(0)
            }
        }
    }
}
