//! Typed seam to the shared key-value store.
//!
//! Everything the cache, bus and lock layers need from the store goes through
//! [`KeyValueStore`]. Multi-key writes are expressed as a [`WriteBatch`] and
//! applied atomically (MULTI/EXEC on Redis).

pub mod keys;
pub mod memory;
pub mod redis_store;

use std::{collections::BTreeSet, collections::HashMap, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable")]
    Unavailable,
    #[error("key '{0}' holds the wrong kind of value")]
    WrongType(String),
    #[error("unexpected store reply: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single write inside an atomic [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    HashSetAll {
        key: String,
        fields: Vec<(String, String)>,
    },
    SortedSetAdd {
        key: String,
        member: String,
        score: i64,
    },
    SortedSetRemove {
        key: String,
        member: String,
    },
    /// Appends to the tail of a list.
    ListPush {
        key: String,
        value: String,
    },
    /// Appends only when the list already exists, so a partial list is never
    /// started on a cold cache.
    ListPushIfExists {
        key: String,
        value: String,
    },
    /// Removes every occurrence of `value`.
    ListRemove {
        key: String,
        value: String,
    },
    /// Adds `delta` to a numeric hash field without letting it drop below
    /// `floor`. Skipped when the hash does not exist.
    CounterAdjust {
        key: String,
        field: String,
        delta: i64,
        floor: i64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
}

impl WriteOp {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::HashSetAll { key, .. }
            | Self::SortedSetAdd { key, .. }
            | Self::SortedSetRemove { key, .. }
            | Self::ListPush { key, .. }
            | Self::ListPushIfExists { key, .. }
            | Self::ListRemove { key, .. }
            | Self::CounterAdjust { key, .. }
            | Self::Expire { key, .. }
            | Self::Delete { key } => key,
        }
    }
}

/// Ordered set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn hash_set_all(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(WriteOp::HashSetAll {
            key: key.into(),
            fields,
        });
        self
    }

    #[must_use]
    pub fn sorted_set_add(
        mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: i64,
    ) -> Self {
        self.ops.push(WriteOp::SortedSetAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    #[must_use]
    pub fn sorted_set_remove(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(WriteOp::SortedSetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    #[must_use]
    pub fn list_push(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::ListPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn list_push_if_exists(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::ListPushIfExists {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn list_remove(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::ListRemove {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn counter_adjust(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
        floor: i64,
    ) -> Self {
        self.ops.push(WriteOp::CounterAdjust {
            key: key.into(),
            field: field.into(),
            delta,
            floor,
        });
        self
    }

    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(WriteOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct keys touched by this batch.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<&str> {
        self.ops.iter().map(WriteOp::key).collect()
    }
}

/// Primitives of the shared store used by this crate.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns an empty map when the hash does not exist.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn sorted_set_len(&self, key: &str) -> StoreResult<u64>;

    /// Members ordered by descending score over the inclusive rank window
    /// `[start, stop]`; negative ranks count from the end.
    async fn sorted_set_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<String>>;

    /// Drops the lowest-scored members so at most `keep` remain. Returns how
    /// many were removed.
    async fn trim_sorted_set(&self, key: &str, keep: usize) -> StoreResult<u64>;

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Sets `key` only if it does not exist yet. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Resets the TTL only if `key` currently holds `expected`, in one atomic step.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Deletes `key` only if it currently holds `expected`, in one atomic step.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}
