//! Read access to the relational store of record for discussion rooms.
//!
//! The cache only ever asks "does this room exist" and "how many members does
//! it have"; member ids and the most recent rooms are used to refill member
//! lists and to warm the cache at start-up.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use shared::models::{CachedRoomRecord, RoomId, UserId};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Structural room fields as held by the store of record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RoomRow {
    #[sqlx(rename = "room_id")]
    pub id: RoomId,
    pub title: String,
    pub description: Option<String>,
    pub region: String,
    pub access_level: String,
    pub created_at: NaiveDateTime,
}

impl RoomRow {
    #[must_use]
    pub fn into_record(self, current_users: i64) -> CachedRoomRecord {
        CachedRoomRecord {
            id: self.id,
            title: self.title,
            description: self.description,
            region: self.region,
            access_level: self.access_level,
            created_at: self.created_at,
            current_users,
        }
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Live (not soft-deleted) room by id.
    async fn find_room_by_id(&self, room_id: RoomId) -> Result<Option<RoomRow>, DirectoryError>;

    async fn count_members(&self, room_id: RoomId) -> Result<i64, DirectoryError>;

    /// Member user ids in join order.
    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, DirectoryError>;

    /// Most recently created live rooms, newest first, each with its member count.
    async fn recent_rooms(&self, limit: usize) -> Result<Vec<(RoomRow, i64)>, DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RecentRoomRow {
    #[sqlx(flatten)]
    room: RoomRow,
    member_count: i64,
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    #[instrument(name = "directory.find_room", skip(self), err)]
    async fn find_room_by_id(&self, room_id: RoomId) -> Result<Option<RoomRow>, DirectoryError> {
        let row = sqlx::query_as::<_, RoomRow>(
            "SELECT room_id, title, description, region, access_level, created_at \
             FROM discussion_rooms WHERE room_id = $1 AND deleted_at IS NULL",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    #[instrument(name = "directory.count_members", skip(self), err)]
    async fn count_members(&self, room_id: RoomId) -> Result<i64, DirectoryError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM members WHERE room_id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(name = "directory.member_ids", skip(self), err)]
    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, DirectoryError> {
        let ids = sqlx::query_scalar::<_, UserId>(
            "SELECT user_id FROM members WHERE room_id = $1 ORDER BY created_at, member_id",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    #[instrument(name = "directory.recent_rooms", skip(self), err)]
    async fn recent_rooms(&self, limit: usize) -> Result<Vec<(RoomRow, i64)>, DirectoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, RecentRoomRow>(
            "SELECT r.room_id, r.title, r.description, r.region, r.access_level, r.created_at, \
                    COUNT(m.member_id) AS member_count \
             FROM discussion_rooms r \
             LEFT JOIN members m ON m.room_id = r.room_id \
             WHERE r.deleted_at IS NULL \
             GROUP BY r.room_id \
             ORDER BY r.created_at DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "loaded recent rooms");
        Ok(rows
            .into_iter()
            .map(|row| (row.room, row.member_count))
            .collect())
    }
}

/// Simple liveness check used during startup.
///
/// # Errors
/// Returns the underlying [`sqlx::Error`] when the database is unreachable.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}
