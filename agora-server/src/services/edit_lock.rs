//! Lease-based edit lock for proposals.
//!
//! One string key per proposal holds the owner's user id with a fixed lease.
//! Renewal and release check ownership and act in one atomic store call. A
//! holder that disappears frees the proposal once the lease runs out.

use std::{fmt, sync::Arc, time::Duration};

use shared::models::{LockStatus, ProposalId, UserId};
use tracing::{debug, info, instrument, warn};

use crate::store::{KeyValueStore, StoreResult, keys::proposal_lock_key};

#[derive(Clone)]
pub struct EditLockService {
    store: Arc<dyn KeyValueStore>,
    lease: Duration,
}

impl fmt::Debug for EditLockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditLockService")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl EditLockService {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Takes the lock, or refreshes the lease if `owner` already holds it.
    /// Returns `false` while someone else holds a live lease.
    ///
    /// # Errors
    /// Propagates store faults.
    #[instrument(name = "lock.try_acquire", skip(self), err)]
    pub async fn try_acquire(&self, proposal_id: ProposalId, owner: UserId) -> StoreResult<bool> {
        let key = proposal_lock_key(proposal_id);
        let value = owner.to_string();

        if self.store.set_if_absent(&key, &value, self.lease).await? {
            metrics::counter!("edit_lock_acquired_total").increment(1);
            info!(proposal_id, owner, "edit lock acquired");
            return Ok(true);
        }

        if self.store.expire_if_equals(&key, &value, self.lease).await? {
            debug!(proposal_id, owner, "edit lock re-acquired by holder");
            return Ok(true);
        }

        metrics::counter!("edit_lock_contended_total").increment(1);
        warn!(proposal_id, owner, "edit lock held by another user");
        Ok(false)
    }

    /// Extends the lease if `owner` still holds it. `false` means the caller
    /// has already lost the lock.
    ///
    /// # Errors
    /// Propagates store faults.
    #[instrument(name = "lock.renew", skip(self), err)]
    pub async fn renew(&self, proposal_id: ProposalId, owner: UserId) -> StoreResult<bool> {
        let renewed = self
            .store
            .expire_if_equals(&proposal_lock_key(proposal_id), &owner.to_string(), self.lease)
            .await?;
        if renewed {
            debug!(proposal_id, owner, "edit lock renewed");
        } else {
            debug!(proposal_id, owner, "renew ignored, lock not held by caller");
        }
        Ok(renewed)
    }

    /// Compare-and-delete. Releasing a lock held by someone else is a no-op.
    ///
    /// # Errors
    /// Propagates store faults.
    #[instrument(name = "lock.release", skip(self), err)]
    pub async fn release(&self, proposal_id: ProposalId, owner: UserId) -> StoreResult<()> {
        let released = self
            .store
            .delete_if_equals(&proposal_lock_key(proposal_id), &owner.to_string())
            .await?;
        if released {
            info!(proposal_id, owner, "edit lock released");
        } else {
            debug!(proposal_id, owner, "release ignored, lock not held by caller");
        }
        Ok(())
    }

    /// Current holder, if the lease is live.
    ///
    /// # Errors
    /// Propagates store faults.
    pub async fn current_owner(&self, proposal_id: ProposalId) -> StoreResult<Option<UserId>> {
        let Some(raw) = self.store.get(&proposal_lock_key(proposal_id)).await? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(owner) => Ok(Some(owner)),
            Err(_) => {
                warn!(proposal_id, value = %raw, "ignoring unparsable edit lock owner");
                Ok(None)
            }
        }
    }

    /// Lock state as seen by `requester`.
    ///
    /// # Errors
    /// Propagates store faults.
    pub async fn lock_status(
        &self,
        proposal_id: ProposalId,
        requester: UserId,
    ) -> StoreResult<LockStatus> {
        Ok(match self.current_owner(proposal_id).await? {
            Some(owner) => LockStatus::locked(owner, requester),
            None => LockStatus::unlocked(),
        })
    }
}
