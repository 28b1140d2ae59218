//! Key naming shared by every process attached to the same store.

use std::time::Duration;

use shared::{
    config::server::CacheConfig,
    models::{ProposalId, RoomId, UserId},
};

/// Global recency index: member = room id, score = creation epoch ms.
pub const LATEST_ROOMS_KEY: &str = "list:latest";

/// Hash field carrying the room's member counter.
pub const CURRENT_USERS_FIELD: &str = "currentUsers";

#[must_use]
pub fn room_key(room_id: RoomId) -> String {
    format!("room:{room_id}")
}

#[must_use]
pub fn room_members_key(room_id: RoomId) -> String {
    format!("room:{room_id}:members")
}

#[must_use]
pub fn user_joined_key(user_id: UserId) -> String {
    format!("user:{user_id}:joined")
}

#[must_use]
pub fn proposal_lock_key(proposal_id: ProposalId) -> String {
    format!("proposal:lock:{proposal_id}")
}

/// TTLs and size caps for the room key families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub room_ttl: Duration,
    pub members_ttl: Duration,
    pub latest_ttl: Duration,
    pub user_joined_ttl: Duration,
    pub latest_max_entries: usize,
    pub user_joined_max_entries: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            room_ttl: Duration::from_secs(config.room_ttl_secs),
            members_ttl: Duration::from_secs(config.members_ttl_secs),
            latest_ttl: Duration::from_secs(config.latest_ttl_secs),
            user_joined_ttl: Duration::from_secs(config.user_joined_ttl_secs),
            latest_max_entries: config.latest_max_entries,
            user_joined_max_entries: config.user_joined_max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_patterns_match_shared_layout() {
        assert_eq!(room_key(12), "room:12");
        assert_eq!(room_members_key(12), "room:12:members");
        assert_eq!(user_joined_key(7), "user:7:joined");
        assert_eq!(proposal_lock_key(3), "proposal:lock:3");
        assert_eq!(LATEST_ROOMS_KEY, "list:latest");
    }

    #[test]
    fn default_policy_uses_documented_lifetimes() {
        let policy = CachePolicy::default();
        assert_eq!(policy.room_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(policy.members_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(policy.latest_ttl, Duration::from_secs(3600));
        assert_eq!(policy.user_joined_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(policy.latest_max_entries, 10_000);
        assert_eq!(policy.user_joined_max_entries, 100);
    }
}
