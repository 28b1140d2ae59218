//! Room cache, chat fan-out and edit locks driven together against the
//! in-process store and transport.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use server::{
    bus::{ChatTransport, DispatchOutcome, MemoryTransport, Publisher, RoomHub, Subscriber},
    cache::RoomCacheRepository,
    db::{DirectoryError, RoomDirectory, RoomRow},
    services::{EditLockService, RoomService},
    store::{
        KeyValueStore, MemoryStore,
        keys::{CachePolicy, LATEST_ROOMS_KEY},
    },
};
use shared::models::{ChatEnvelope, RoomId, UserId};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

fn created_at(timestamp_ms: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap()
        .naive_utc()
}

/// Store of record kept in memory; membership mirrors what the application
/// would have persisted before calling into the cache.
#[derive(Default)]
struct Directory {
    rooms: Mutex<HashMap<RoomId, (RoomRow, Vec<UserId>)>>,
    lookups: AtomicUsize,
}

impl Directory {
    fn create(&self, room_id: RoomId, creator: UserId, timestamp_ms: i64) -> RoomRow {
        let row = RoomRow {
            id: room_id,
            title: format!("Room {room_id}"),
            description: None,
            region: "SEOUL".into(),
            access_level: "PUBLIC".into(),
            created_at: created_at(timestamp_ms),
        };
        self.rooms
            .lock()
            .unwrap()
            .insert(room_id, (row.clone(), vec![creator]));
        row
    }

    fn join(&self, room_id: RoomId, user: UserId) {
        if let Some((_, members)) = self.rooms.lock().unwrap().get_mut(&room_id) {
            members.push(user);
        }
    }

    fn leave(&self, room_id: RoomId, user: UserId) -> i64 {
        let mut rooms = self.rooms.lock().unwrap();
        let Some((_, members)) = rooms.get_mut(&room_id) else {
            return 0;
        };
        members.retain(|member| *member != user);
        members.len() as i64
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoomDirectory for Directory {
    async fn find_room_by_id(&self, room_id: RoomId) -> Result<Option<RoomRow>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map(|(row, _)| row.clone()))
    }

    async fn count_members(&self, room_id: RoomId) -> Result<i64, DirectoryError> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map_or(0, |(_, members)| members.len() as i64))
    }

    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, DirectoryError> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .map(|(_, members)| members.clone())
            .unwrap_or_default())
    }

    async fn recent_rooms(&self, limit: usize) -> Result<Vec<(RoomRow, i64)>, DirectoryError> {
        let mut rooms: Vec<(RoomRow, i64)> = self
            .rooms
            .lock()
            .unwrap()
            .values()
            .map(|(row, members)| (row.clone(), members.len() as i64))
            .collect();
        rooms.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        rooms.truncate(limit);
        Ok(rooms)
    }
}

struct Cluster {
    store: Arc<MemoryStore>,
    directory: Arc<Directory>,
    cache: RoomCacheRepository,
    rooms: RoomService,
}

fn cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(Directory::default());
    let cache = RoomCacheRepository::new(store.clone(), directory.clone(), CachePolicy::default());
    let rooms = RoomService::new(cache.clone(), directory.clone());
    Cluster {
        store,
        directory,
        cache,
        rooms,
    }
}

impl Cluster {
    async fn create_room(&self, room_id: RoomId, creator: UserId, timestamp_ms: i64) {
        let row = self.directory.create(room_id, creator, timestamp_ms);
        self.rooms
            .room_created(&row.into_record(1), creator, timestamp_ms)
            .await;
    }
}

#[tokio::test]
async fn room_lifecycle_keeps_cache_and_store_of_record_aligned() {
    let cluster = cluster();
    let (r1, u1, u2) = (1, 10, 20);

    cluster.create_room(r1, u1, 1_000).await;
    let cached = cluster.cache.get_room(r1).await.unwrap().unwrap();
    assert_eq!(cached.current_users, 1);
    assert_eq!(cluster.directory.lookups(), 0);

    cluster.directory.join(r1, u2);
    let joined = cluster.rooms.member_joined(u2, r1, 2_000).await.unwrap();
    assert_eq!(joined.current_users, 2);
    assert_eq!(joined.member_ids, vec![u1, u2]);

    let remaining = cluster.directory.leave(r1, u1);
    cluster.rooms.member_left(u1, r1, remaining).await;
    let after_leave = cluster.cache.get_room(r1).await.unwrap().unwrap();
    assert_eq!(after_leave.current_users, 1);
    assert_eq!(cluster.cache.room_members(r1).await.unwrap(), vec![u2]);
    assert_eq!(
        cluster.rooms.joined_rooms(u1, 1, 15).await.unwrap().total_count,
        0
    );

    cluster.cache.evict_room(r1, Some(u1)).await.unwrap();
    for key in ["room:1", "room:1:members", LATEST_ROOMS_KEY, "user:10:joined"] {
        assert!(!cluster.store.exists(key).await, "{key} survived eviction");
    }

    let lookups_before = cluster.directory.lookups();
    let repaired = cluster.cache.get_room(r1).await.unwrap().unwrap();
    assert_eq!(cluster.directory.lookups(), lookups_before + 1);
    assert_eq!(repaired.current_users, 1);
}

#[tokio::test]
async fn join_then_leave_restores_counter_and_indexes() {
    let cluster = cluster();
    cluster.create_room(1, 10, 1_000).await;
    let before = cluster.cache.get_room(1).await.unwrap().unwrap().current_users;

    cluster.cache.add_member(30, 1, 2_000).await.unwrap();
    cluster.cache.remove_member(30, 1).await.unwrap();

    let after = cluster.cache.get_room(1).await.unwrap().unwrap();
    assert_eq!(after.current_users, before);
    assert!(!cluster.cache.room_members(1).await.unwrap().contains(&30));
    assert_eq!(cluster.cache.list_user_page(30, 0, 10).await.unwrap().total_count, 0);
}

#[tokio::test]
async fn global_index_keeps_the_ten_thousand_most_recent_rooms() {
    let cluster = cluster();
    let total: i64 = 10_050;
    for room_id in 1..=total {
        cluster
            .cache
            .save_new_room(
                &cluster
                    .directory
                    .create(room_id, room_id % 50, room_id * 1_000)
                    .into_record(1),
                room_id % 50,
                room_id * 1_000,
            )
            .await
            .unwrap();
    }

    assert_eq!(cluster.store.sorted_set_len(LATEST_ROOMS_KEY).await.unwrap(), 10_000);
    let oldest_page = cluster.cache.list_page(9_990, 10).await.unwrap();
    assert_eq!(oldest_page.room_ids, (51..=60).rev().collect::<Vec<_>>());
    assert_eq!(cluster.cache.list_user_page(7, 0, 500).await.unwrap().total_count, 100);
}

#[tokio::test]
async fn pages_cover_every_room_exactly_once_newest_first() {
    let cluster = cluster();
    for room_id in 1..=47 {
        cluster.create_room(room_id, 1, room_id * 10).await;
    }

    let mut seen = Vec::new();
    let mut page = 1;
    loop {
        let listing = cluster.rooms.browse(page, 15).await.unwrap();
        if listing.rooms.is_empty() {
            break;
        }
        assert_eq!(listing.total_count, 47);
        assert_eq!(listing.total_pages, 4);
        seen.extend(listing.rooms.iter().map(|room| room.id));
        page += 1;
    }

    assert_eq!(seen, (1..=47).rev().collect::<Vec<_>>());
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 47);
}

#[tokio::test]
async fn cache_outage_falls_back_to_store_of_record() {
    let cluster = cluster();
    cluster.create_room(1, 10, 1_000).await;
    cluster.store.set_offline(true);

    let room = cluster.rooms.room_summary(1).await.unwrap();
    assert_eq!(room.current_users, 1);

    cluster.directory.join(1, 20);
    let joined = cluster.rooms.member_joined(20, 1, 2_000).await.unwrap();
    assert_eq!(joined.member_ids, vec![10, 20]);
    assert_eq!(joined.current_users, 2);

    cluster.store.set_offline(false);
    assert_eq!(cluster.cache.get_room(1).await.unwrap().unwrap().current_users, 1);
}

#[tokio::test(start_paused = true)]
async fn edit_lock_passes_to_next_editor_after_lease() {
    let store = Arc::new(MemoryStore::new());
    let lease = Duration::from_secs(600);
    let locks = EditLockService::new(store, lease);

    assert!(locks.try_acquire(5, 1).await.unwrap());
    assert!(!locks.try_acquire(5, 2).await.unwrap());
    locks.release(5, 2).await.unwrap();
    assert_eq!(locks.current_owner(5).await.unwrap(), Some(1));

    tokio::time::advance(lease - Duration::from_secs(1)).await;
    assert!(!locks.try_acquire(5, 2).await.unwrap());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(locks.try_acquire(5, 2).await.unwrap());
    assert!(!locks.renew(5, 1).await.unwrap());
    assert_eq!(locks.current_owner(5).await.unwrap(), Some(2));
}

struct Instance {
    hub: Arc<RoomHub>,
    listener: tokio::task::JoinHandle<()>,
}

fn start_instance(transport: &MemoryTransport, cancel: &CancellationToken) -> Instance {
    let hub = Arc::new(RoomHub::default());
    let subscriber = Subscriber::new(hub.clone());
    let transport: Arc<dyn ChatTransport> = Arc::new(transport.clone());
    let cancel = cancel.clone();
    let listener = tokio::spawn(async move { subscriber.run(transport, cancel).await });
    Instance { hub, listener }
}

async fn wait_for_subscribers(transport: &MemoryTransport, count: usize) {
    while transport.subscriber_count() < count {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn every_instance_delivers_each_message_once() {
    let transport = MemoryTransport::default();
    let cancel = CancellationToken::new();
    let instances: Vec<Instance> = (0..3).map(|_| start_instance(&transport, &cancel)).collect();
    let mut sessions: Vec<_> = instances
        .iter()
        .map(|instance| instance.hub.subscribe(9))
        .collect();
    let mut other_room = instances[0].hub.subscribe(10);
    wait_for_subscribers(&transport, instances.len()).await;

    let publisher = Publisher::new(Arc::new(transport.clone()));
    let receivers = publisher
        .publish(&ChatEnvelope::chat(9, 1, "hello everyone"))
        .await
        .unwrap();
    assert_eq!(receivers, 3);

    for session in &mut sessions {
        let envelope = session.recv().await.unwrap();
        assert_eq!(envelope.content, "hello everyone");
    }
    tokio::task::yield_now().await;
    for session in &mut sessions {
        assert!(matches!(session.try_recv(), Err(TryRecvError::Empty)));
    }
    assert!(matches!(other_room.try_recv(), Err(TryRecvError::Empty)));

    cancel.cancel();
    for instance in instances {
        instance.listener.await.unwrap();
    }
}

#[tokio::test]
async fn malformed_payload_does_not_stop_the_listener() {
    let transport = MemoryTransport::default();
    let cancel = CancellationToken::new();
    let instance = start_instance(&transport, &cancel);
    let mut session = instance.hub.subscribe(3);
    wait_for_subscribers(&transport, 1).await;

    for garbage in ["{", r#"{"type":"CHAT"}"#, r#"{"type":"WHISPER","roomId":3,"userId":1}"#] {
        transport.publish(garbage.to_string()).await.unwrap();
    }
    Publisher::new(Arc::new(transport.clone()))
        .publish(&ChatEnvelope::join(3, 4))
        .await
        .unwrap();

    assert_eq!(session.recv().await.unwrap(), ChatEnvelope::join(3, 4));
    assert_eq!(
        Subscriber::new(instance.hub.clone()).on_message("not json"),
        DispatchOutcome::Rejected
    );

    cancel.cancel();
    instance.listener.await.unwrap();
}
