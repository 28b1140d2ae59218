use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{RoomId, UserId};

const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Reasons a cached room hash could not be turned back into a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordDecodeError {
    #[error("cached room hash is missing field '{0}'")]
    MissingField(&'static str),
    #[error("cached room hash has invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// Summary of a discussion room as held in the `room:{id}` hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedRoomRecord {
    pub id: RoomId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub region: String,
    pub access_level: String,
    pub created_at: NaiveDateTime,
    pub current_users: i64,
}

impl CachedRoomRecord {
    /// Flattens the record into the string-valued hash fields stored per room.
    ///
    /// `description` is only written when present.
    #[must_use]
    pub fn to_hash(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.to_string()),
            ("title".to_string(), self.title.clone()),
            ("region".to_string(), self.region.clone()),
            ("accessLevel".to_string(), self.access_level.clone()),
            (
                "createdAt".to_string(),
                self.created_at.format(CREATED_AT_FORMAT).to_string(),
            ),
            ("currentUsers".to_string(), self.current_users.to_string()),
        ];
        if let Some(description) = &self.description {
            fields.push(("description".to_string(), description.clone()));
        }
        fields
    }

    /// Rebuilds a record from a `room:{id}` hash.
    ///
    /// # Errors
    /// Returns [`RecordDecodeError`] if a required field is absent or malformed,
    /// e.g. a hash that only holds a stray counter.
    pub fn from_hash(hash: &HashMap<String, String>) -> Result<Self, RecordDecodeError> {
        let field = |name: &'static str| {
            hash.get(name)
                .map(String::as_str)
                .ok_or(RecordDecodeError::MissingField(name))
        };
        let invalid = |name: &'static str, value: &str| RecordDecodeError::InvalidField {
            field: name,
            value: value.to_string(),
        };

        let id_raw = field("id")?;
        let id = id_raw.parse().map_err(|_| invalid("id", id_raw))?;

        let created_raw = field("createdAt")?;
        let created_at = NaiveDateTime::parse_from_str(created_raw, CREATED_AT_FORMAT)
            .map_err(|_| invalid("createdAt", created_raw))?;

        let users_raw = field("currentUsers")?;
        let current_users = users_raw
            .parse()
            .map_err(|_| invalid("currentUsers", users_raw))?;

        Ok(Self {
            id,
            title: field("title")?.to_string(),
            description: hash.get("description").cloned(),
            region: field("region")?.to_string(),
            access_level: field("accessLevel")?.to_string(),
            created_at,
            current_users,
        })
    }
}

/// One page of room ids read from a recency index, plus the index size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomsPage {
    pub room_ids: Vec<RoomId>,
    pub total_count: u64,
}

impl RoomsPage {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn total_pages(&self, page_size: usize) -> u64 {
        if page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(page_size as u64)
    }

    /// `page` is zero-based.
    #[must_use]
    pub fn is_last_page(&self, page: usize, page_size: usize) -> bool {
        page as u64 + 1 >= self.total_pages(page_size)
    }
}

/// Paged room listing handed back to the application layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomListResponse {
    pub rooms: Vec<CachedRoomRecord>,
    /// One-based page number.
    pub current_page: usize,
    pub page_size: usize,
    pub total_count: u64,
    pub total_pages: u64,
}

impl RoomListResponse {
    #[must_use]
    pub fn new(
        rooms: Vec<CachedRoomRecord>,
        current_page: usize,
        page_size: usize,
        total_count: u64,
    ) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(page_size as u64)
        };
        Self {
            rooms,
            current_page,
            page_size,
            total_count,
            total_pages,
        }
    }
}

/// Room details returned to a user who just joined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub room_id: RoomId,
    pub title: String,
    pub description: Option<String>,
    pub region: String,
    pub access_level: String,
    pub current_users: i64,
    pub member_ids: Vec<UserId>,
    pub joined_at: NaiveDateTime,
}

impl JoinRoomResponse {
    #[must_use]
    pub fn new(room: CachedRoomRecord, member_ids: Vec<UserId>, joined_at: NaiveDateTime) -> Self {
        Self {
            room_id: room.id,
            title: room.title,
            description: room.description,
            region: room.region,
            access_level: room.access_level,
            current_users: room.current_users,
            member_ids,
            joined_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_record(description: Option<&str>) -> CachedRoomRecord {
        CachedRoomRecord {
            id: 42,
            title: "Bus routes in Suwon".to_string(),
            description: description.map(str::to_string),
            region: "SUWON".to_string(),
            access_level: "PUBLIC".to_string(),
            created_at: NaiveDate::from_ymd_opt(2025, 11, 8)
                .unwrap()
                .and_hms_micro_opt(14, 30, 0, 125_000)
                .unwrap(),
            current_users: 3,
        }
    }

    #[test]
    fn hash_round_trip_preserves_every_field() {
        let record = sample_record(Some("Night buses"));
        let hash: HashMap<String, String> = record.to_hash().into_iter().collect();

        assert_eq!(hash["createdAt"], "2025-11-08T14:30:00.125");
        assert_eq!(hash["accessLevel"], "PUBLIC");
        assert_eq!(CachedRoomRecord::from_hash(&hash), Ok(record));
    }

    #[test]
    fn absent_description_is_not_written() {
        let record = sample_record(None);
        let hash: HashMap<String, String> = record.to_hash().into_iter().collect();

        assert!(!hash.contains_key("description"));
        assert_eq!(CachedRoomRecord::from_hash(&hash).unwrap().description, None);
    }

    #[test]
    fn counter_only_hash_is_rejected() {
        let hash = HashMap::from([("currentUsers".to_string(), "1".to_string())]);
        assert_eq!(
            CachedRoomRecord::from_hash(&hash),
            Err(RecordDecodeError::MissingField("id"))
        );
    }

    #[test]
    fn malformed_counter_is_reported() {
        let mut hash: HashMap<String, String> =
            sample_record(None).to_hash().into_iter().collect();
        hash.insert("currentUsers".to_string(), "many".to_string());

        assert!(matches!(
            CachedRoomRecord::from_hash(&hash),
            Err(RecordDecodeError::InvalidField {
                field: "currentUsers",
                ..
            })
        ));
    }

    #[test]
    fn page_math_rounds_up() {
        let page = RoomsPage {
            room_ids: vec![1, 2, 3],
            total_count: 31,
        };
        assert_eq!(page.total_pages(15), 3);
        assert!(!page.is_last_page(1, 15));
        assert!(page.is_last_page(2, 15));
        assert_eq!(RoomsPage::empty().total_pages(15), 0);
    }

    #[test]
    fn list_response_computes_total_pages() {
        let response = RoomListResponse::new(Vec::new(), 1, 15, 150);
        assert_eq!(response.total_pages, 10);
    }
}
