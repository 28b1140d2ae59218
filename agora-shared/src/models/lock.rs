use serde::{Deserialize, Serialize};

use super::UserId;

/// Snapshot of a proposal's edit lock as seen by one requester.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    pub held_by_requester: bool,
}

impl LockStatus {
    #[must_use]
    pub const fn unlocked() -> Self {
        Self {
            locked: false,
            owner_id: None,
            held_by_requester: false,
        }
    }

    #[must_use]
    pub fn locked(owner_id: UserId, requester: UserId) -> Self {
        Self {
            locked: true,
            owner_id: Some(owner_id),
            held_by_requester: owner_id == requester,
        }
    }
}
