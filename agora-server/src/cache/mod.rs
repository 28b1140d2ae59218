//! Best-effort room cache in front of the store of record.
//!
//! Every store fault is mapped to [`CacheUnavailable`] by [`guard`], which logs
//! it once and counts it. Callers treat that outcome exactly like a miss and
//! consult the store of record.

pub mod batches;
pub mod room_cache;

use std::fmt::Display;

use thiserror::Error;
use tracing::warn;

pub use room_cache::RoomCacheRepository;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("room cache unavailable during {operation}: {reason}")]
pub struct CacheUnavailable {
    pub operation: &'static str,
    pub reason: String,
}

pub type CacheResult<T> = Result<T, CacheUnavailable>;

pub(crate) fn guard<T, E: Display>(operation: &'static str, result: Result<T, E>) -> CacheResult<T> {
    result.map_err(|err| {
        warn!(operation, error = %err, "room cache operation failed");
        metrics::counter!("room_cache_unavailable_total", "operation" => operation).increment(1);
        CacheUnavailable {
            operation,
            reason: err.to_string(),
        }
    })
}
