use std::{fmt, sync::Arc};

use shared::models::{CachedRoomRecord, RoomId, RoomsPage, UserId};
use tracing::{debug, info, warn};

use super::{CacheResult, batches, guard};
use crate::{
    db::RoomDirectory,
    store::{
        KeyValueStore,
        keys::{CachePolicy, LATEST_ROOMS_KEY, room_key, room_members_key, user_joined_key},
    },
};

/// Room summaries, recency and joined indexes, and member lists held in the
/// shared store.
///
/// Reads are cache-aside with read-repair from the [`RoomDirectory`]; writes
/// are write-through and never roll back the store of record.
#[derive(Clone)]
pub struct RoomCacheRepository {
    store: Arc<dyn KeyValueStore>,
    directory: Arc<dyn RoomDirectory>,
    policy: CachePolicy,
}

impl fmt::Debug for RoomCacheRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomCacheRepository")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn parse_ids(key: &str, raw: Vec<String>) -> Vec<i64> {
    raw.into_iter()
        .filter_map(|value| match value.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(key, value = %value, "skipping non-numeric id in cache");
                None
            }
        })
        .collect()
}

impl RoomCacheRepository {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        directory: Arc<dyn RoomDirectory>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            store,
            directory,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Write-through for a room that was just persisted, then the size caps.
    pub async fn save_new_room(
        &self,
        record: &CachedRoomRecord,
        creator: UserId,
        timestamp_ms: i64,
    ) -> CacheResult<()> {
        let batch = batches::new_room(&self.policy, record, creator, timestamp_ms);
        guard("save_new_room", self.store.apply(batch).await)?;
        self.enforce_caps(creator).await?;
        debug!(room_id = record.id, creator, "cached new room");
        Ok(())
    }

    pub async fn add_member(
        &self,
        user: UserId,
        room_id: RoomId,
        timestamp_ms: i64,
    ) -> CacheResult<()> {
        let batch = batches::join(&self.policy, user, room_id, timestamp_ms);
        guard("add_member", self.store.apply(batch).await)?;
        self.trim_user_joined(user).await?;
        debug!(room_id, user, "cached room join");
        Ok(())
    }

    pub async fn remove_member(&self, user: UserId, room_id: RoomId) -> CacheResult<()> {
        guard(
            "remove_member",
            self.store.apply(batches::leave(user, room_id)).await,
        )?;
        debug!(room_id, user, "cached room leave");
        Ok(())
    }

    /// Cache-aside read. `Ok(None)` means the store of record has no such room
    /// either.
    pub async fn get_room(&self, room_id: RoomId) -> CacheResult<Option<CachedRoomRecord>> {
        let hash = guard("get_room", self.store.hash_get_all(&room_key(room_id)).await)?;
        if !hash.is_empty() {
            match CachedRoomRecord::from_hash(&hash) {
                Ok(record) => {
                    metrics::counter!("room_cache_hits_total").increment(1);
                    debug!(room_id, "room cache hit");
                    return Ok(Some(record));
                }
                Err(err) => warn!(room_id, error = %err, "discarding unreadable cached room"),
            }
        }

        metrics::counter!("room_cache_misses_total").increment(1);
        debug!(room_id, "room cache miss, reading store of record");

        let Some(row) = guard("get_room", self.directory.find_room_by_id(room_id).await)? else {
            debug!(room_id, "room absent from store of record");
            return Ok(None);
        };
        let current_users = guard("get_room", self.directory.count_members(room_id).await)?;
        let record = row.into_record(current_users);

        guard(
            "get_room",
            self.store
                .apply(batches::room_hash(&self.policy, &record))
                .await,
        )?;
        debug!(room_id, current_users, "repaired room cache entry");
        Ok(Some(record))
    }

    /// Newest-first window over the global recency index. `offset` is an index
    /// into that ordering, not a page number.
    pub async fn list_page(&self, offset: usize, size: usize) -> CacheResult<RoomsPage> {
        self.read_page("list_page", LATEST_ROOMS_KEY, offset, size)
            .await
    }

    pub async fn list_user_page(
        &self,
        user: UserId,
        offset: usize,
        size: usize,
    ) -> CacheResult<RoomsPage> {
        self.read_page("list_user_page", &user_joined_key(user), offset, size)
            .await
    }

    async fn read_page(
        &self,
        operation: &'static str,
        key: &str,
        offset: usize,
        size: usize,
    ) -> CacheResult<RoomsPage> {
        let total_count = guard(operation, self.store.sorted_set_len(key).await)?;
        if total_count == 0 || size == 0 {
            return Ok(RoomsPage {
                room_ids: Vec::new(),
                total_count,
            });
        }

        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = start.saturating_add(isize::try_from(size).unwrap_or(isize::MAX) - 1);
        let raw = guard(
            operation,
            self.store.sorted_set_rev_range(key, start, stop).await,
        )?;
        let room_ids = parse_ids(key, raw);

        debug!(key, offset, size, total_count, found = room_ids.len(), "read room index page");
        Ok(RoomsPage {
            room_ids,
            total_count,
        })
    }

    /// Resolves ids in order; ids unknown everywhere are left out.
    pub async fn hydrate_many(&self, room_ids: &[RoomId]) -> CacheResult<Vec<CachedRoomRecord>> {
        let mut rooms = Vec::with_capacity(room_ids.len());
        for &room_id in room_ids {
            if let Some(room) = self.get_room(room_id).await? {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    pub async fn evict_room(&self, room_id: RoomId, creator: Option<UserId>) -> CacheResult<()> {
        guard(
            "evict_room",
            self.store.apply(batches::evict(room_id, creator)).await,
        )?;
        info!(room_id, ?creator, "evicted room from cache");
        Ok(())
    }

    /// Writes room hashes only; indexes fill up through normal traffic.
    pub async fn warm_cache(&self, records: &[CachedRoomRecord]) -> CacheResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let batch = batches::room_hashes(&self.policy, records);
        guard("warm_cache", self.store.apply(batch).await)?;
        info!(count = records.len(), "warmed room cache");
        Ok(records.len())
    }

    /// Cached member ids in join order; empty on a miss.
    pub async fn room_members(&self, room_id: RoomId) -> CacheResult<Vec<UserId>> {
        let key = room_members_key(room_id);
        let raw = guard("room_members", self.store.list_range(&key).await)?;
        if raw.is_empty() {
            debug!(room_id, "member list cache miss");
        }
        Ok(parse_ids(&key, raw))
    }

    pub async fn cache_room_members(&self, room_id: RoomId, member_ids: &[UserId]) -> CacheResult<()> {
        if member_ids.is_empty() {
            return Ok(());
        }
        let batch = batches::replace_members(&self.policy, room_id, member_ids);
        guard("cache_room_members", self.store.apply(batch).await)?;
        debug!(room_id, count = member_ids.len(), "cached member list");
        Ok(())
    }

    /// Trims the global recency index and `user`'s joined index to their caps.
    pub async fn enforce_caps(&self, user: UserId) -> CacheResult<()> {
        let removed = guard(
            "enforce_caps",
            self.store
                .trim_sorted_set(LATEST_ROOMS_KEY, self.policy.latest_max_entries)
                .await,
        )?;
        if removed > 0 {
            debug!(removed, cap = self.policy.latest_max_entries, "trimmed recency index");
        }
        self.trim_user_joined(user).await
    }

    async fn trim_user_joined(&self, user: UserId) -> CacheResult<()> {
        let removed = guard(
            "enforce_caps",
            self.store
                .trim_sorted_set(&user_joined_key(user), self.policy.user_joined_max_entries)
                .await,
        )?;
        if removed > 0 {
            debug!(user, removed, "trimmed joined-room index");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CacheUnavailable,
        store::{MemoryStore, WriteBatch},
        testing::{FakeDirectory, record, row},
    };

    fn repository() -> (Arc<MemoryStore>, Arc<FakeDirectory>, RoomCacheRepository) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(FakeDirectory::default());
        let repository =
            RoomCacheRepository::new(store.clone(), directory.clone(), CachePolicy::default());
        (store, directory, repository)
    }

    #[tokio::test]
    async fn write_through_then_read_hits_cache() {
        let (_, directory, repository) = repository();
        let room = record(1, 1);
        repository.save_new_room(&room, 10, 1_000).await.unwrap();

        assert_eq!(repository.get_room(1).await.unwrap(), Some(room));
        assert_eq!(directory.lookups(), 0);
        assert_eq!(repository.room_members(1).await.unwrap(), vec![10]);
        assert_eq!(repository.list_user_page(10, 0, 10).await.unwrap().room_ids, vec![1]);
    }

    #[tokio::test]
    async fn miss_repairs_from_directory() {
        let (store, directory, repository) = repository();
        directory.insert(row(2), vec![5, 6]);

        let room = repository.get_room(2).await.unwrap().unwrap();
        assert_eq!(room.current_users, 2);
        assert_eq!(directory.lookups(), 1);
        assert!(store.ttl("room:2").await.is_some());

        repository.get_room(2).await.unwrap();
        assert_eq!(directory.lookups(), 1);
    }

    #[tokio::test]
    async fn unknown_room_is_none_not_error() {
        let (_, _, repository) = repository();
        assert_eq!(repository.get_room(404).await, Ok(None));
    }

    #[tokio::test]
    async fn unreadable_hash_is_repaired() {
        let (store, directory, repository) = repository();
        directory.insert(row(3), vec![1]);
        store
            .apply(WriteBatch::new().hash_set_all("room:3", vec![("currentUsers".into(), "9".into())]))
            .await
            .unwrap();

        let room = repository.get_room(3).await.unwrap().unwrap();
        assert_eq!(room.current_users, 1);
        assert_eq!(room.title, "Room 3");
    }

    #[tokio::test]
    async fn join_then_leave_restores_counter_and_indexes() {
        let (_, _, repository) = repository();
        repository.save_new_room(&record(1, 1), 10, 1_000).await.unwrap();

        repository.add_member(20, 1, 2_000).await.unwrap();
        assert_eq!(repository.get_room(1).await.unwrap().unwrap().current_users, 2);
        assert_eq!(repository.room_members(1).await.unwrap(), vec![10, 20]);

        repository.remove_member(20, 1).await.unwrap();
        assert_eq!(repository.get_room(1).await.unwrap().unwrap().current_users, 1);
        assert_eq!(repository.room_members(1).await.unwrap(), vec![10]);
        assert_eq!(repository.list_user_page(20, 0, 10).await.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn counter_never_goes_negative() {
        let (_, _, repository) = repository();
        repository.save_new_room(&record(1, 1), 10, 1_000).await.unwrap();
        repository.remove_member(10, 1).await.unwrap();
        repository.remove_member(10, 1).await.unwrap();

        assert_eq!(repository.get_room(1).await.unwrap().unwrap().current_users, 0);
    }

    #[tokio::test]
    async fn pages_are_newest_first_without_gaps() {
        let (_, _, repository) = repository();
        for id in 1..=7 {
            repository
                .save_new_room(&record(id, 1), 10, id * 100)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for page in 0..3 {
            let chunk = repository.list_page(page * 3, 3).await.unwrap();
            assert_eq!(chunk.total_count, 7);
            seen.extend(chunk.room_ids);
        }
        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1]);
        assert!(repository.list_page(9, 3).await.unwrap().room_ids.is_empty());
    }

    #[tokio::test]
    async fn empty_index_yields_empty_page() {
        let (_, _, repository) = repository();
        assert_eq!(repository.list_page(0, 15).await.unwrap(), RoomsPage::empty());
    }

    #[tokio::test]
    async fn user_index_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let policy = CachePolicy {
            user_joined_max_entries: 3,
            ..CachePolicy::default()
        };
        let repository =
            RoomCacheRepository::new(store.clone(), Arc::new(FakeDirectory::default()), policy);

        for room in 1..=5 {
            repository.add_member(9, room, room * 10).await.unwrap();
        }

        let page = repository.list_user_page(9, 0, 10).await.unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.room_ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn hydrate_skips_rooms_unknown_everywhere() {
        let (_, _, repository) = repository();
        repository.save_new_room(&record(1, 1), 10, 1_000).await.unwrap();
        repository.save_new_room(&record(2, 1), 10, 2_000).await.unwrap();

        let rooms = repository.hydrate_many(&[2, 99, 1]).await.unwrap();
        assert_eq!(rooms.iter().map(|room| room.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn evict_without_creator_leaves_creator_index() {
        let (store, _, repository) = repository();
        repository.save_new_room(&record(1, 1), 10, 1_000).await.unwrap();

        repository.evict_room(1, None).await.unwrap();
        assert!(!store.exists("room:1").await);
        assert!(!store.exists("room:1:members").await);
        assert_eq!(repository.list_page(0, 10).await.unwrap().total_count, 0);
        assert_eq!(repository.list_user_page(10, 0, 10).await.unwrap().room_ids, vec![1]);
    }

    #[tokio::test]
    async fn warm_cache_writes_hashes_only() {
        let (store, _, repository) = repository();
        let written = repository
            .warm_cache(&[record(1, 3), record(2, 0)])
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert!(store.exists("room:2").await);
        assert!(!store.exists("list:latest").await);
    }

    #[tokio::test]
    async fn cache_room_members_replaces_list_and_ignores_empty() {
        let (_, _, repository) = repository();
        repository.cache_room_members(4, &[]).await.unwrap();
        assert!(repository.room_members(4).await.unwrap().is_empty());

        repository.cache_room_members(4, &[8, 2]).await.unwrap();
        repository.cache_room_members(4, &[2]).await.unwrap();
        assert_eq!(repository.room_members(4).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_unavailable() {
        let (store, _, repository) = repository();
        store.set_offline(true);

        let err = repository
            .save_new_room(&record(1, 1), 10, 1_000)
            .await
            .unwrap_err();
        assert_eq!(err.operation, "save_new_room");
        assert!(matches!(
            repository.list_page(0, 10).await,
            Err(CacheUnavailable { operation: "list_page", .. })
        ));
    }
}
