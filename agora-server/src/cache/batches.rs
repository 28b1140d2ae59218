//! The multi-key transactions behind room creation, join, leave and eviction.
//!
//! Each builder returns a [`WriteBatch`] that the store applies atomically, so
//! the keys a flow touches are decided here and nowhere else.

use shared::models::{CachedRoomRecord, RoomId, UserId};

use crate::store::{
    WriteBatch,
    keys::{
        CURRENT_USERS_FIELD, CachePolicy, LATEST_ROOMS_KEY, room_key, room_members_key,
        user_joined_key,
    },
};

/// Lowest value the member counter may take.
pub const MEMBER_COUNT_FLOOR: i64 = 0;

/// Room hash plus its TTL. Used for read-repair and warm-up.
#[must_use]
pub fn room_hash(policy: &CachePolicy, record: &CachedRoomRecord) -> WriteBatch {
    append_room_hash(WriteBatch::new(), policy, record)
}

/// Room hashes for a batch of records, written together.
#[must_use]
pub fn room_hashes(policy: &CachePolicy, records: &[CachedRoomRecord]) -> WriteBatch {
    records.iter().fold(WriteBatch::new(), |batch, record| {
        append_room_hash(batch, policy, record)
    })
}

fn append_room_hash(
    batch: WriteBatch,
    policy: &CachePolicy,
    record: &CachedRoomRecord,
) -> WriteBatch {
    let key = room_key(record.id);
    batch
        .hash_set_all(key.clone(), record.to_hash())
        .expire(key, policy.room_ttl)
}

/// Write-through for a freshly created room: the room hash, the global recency
/// index, the creator's joined index and the member list seeded with the creator.
#[must_use]
pub fn new_room(
    policy: &CachePolicy,
    record: &CachedRoomRecord,
    creator: UserId,
    timestamp_ms: i64,
) -> WriteBatch {
    let room = record.id.to_string();
    let joined = user_joined_key(creator);
    let members = room_members_key(record.id);

    append_room_hash(WriteBatch::new(), policy, record)
        .sorted_set_add(LATEST_ROOMS_KEY, room.clone(), timestamp_ms)
        .expire(LATEST_ROOMS_KEY, policy.latest_ttl)
        .sorted_set_add(joined.clone(), room, timestamp_ms)
        .expire(joined, policy.user_joined_ttl)
        .list_push(members.clone(), creator.to_string())
        .expire(members, policy.members_ttl)
}

/// Join bookkeeping. The member list and counter are only touched when already
/// cached, so a cold room is filled from the store of record instead.
#[must_use]
pub fn join(policy: &CachePolicy, user: UserId, room_id: RoomId, timestamp_ms: i64) -> WriteBatch {
    let joined = user_joined_key(user);
    let members = room_members_key(room_id);

    WriteBatch::new()
        .sorted_set_add(joined.clone(), room_id.to_string(), timestamp_ms)
        .expire(joined, policy.user_joined_ttl)
        .list_push_if_exists(members.clone(), user.to_string())
        .expire(members, policy.members_ttl)
        .counter_adjust(room_key(room_id), CURRENT_USERS_FIELD, 1, MEMBER_COUNT_FLOOR)
}

#[must_use]
pub fn leave(user: UserId, room_id: RoomId) -> WriteBatch {
    WriteBatch::new()
        .sorted_set_remove(user_joined_key(user), room_id.to_string())
        .list_remove(room_members_key(room_id), user.to_string())
        .counter_adjust(room_key(room_id), CURRENT_USERS_FIELD, -1, MEMBER_COUNT_FLOOR)
}

/// Drops every trace of a room. Without a known creator, other users' joined
/// indexes keep the id until their own TTL or trim clears it.
#[must_use]
pub fn evict(room_id: RoomId, creator: Option<UserId>) -> WriteBatch {
    let room = room_id.to_string();
    let batch = WriteBatch::new()
        .delete(room_key(room_id))
        .delete(room_members_key(room_id))
        .sorted_set_remove(LATEST_ROOMS_KEY, room.clone());
    match creator {
        Some(creator) => batch.sorted_set_remove(user_joined_key(creator), room),
        None => batch,
    }
}

/// Replaces the member list wholesale, e.g. after refilling it from the store of record.
#[must_use]
pub fn replace_members(policy: &CachePolicy, room_id: RoomId, member_ids: &[UserId]) -> WriteBatch {
    let key = room_members_key(room_id);
    let batch = member_ids.iter().fold(
        WriteBatch::new().delete(key.clone()),
        |batch, member| batch.list_push(key.clone(), member.to_string()),
    );
    batch.expire(key, policy.members_ttl)
}
