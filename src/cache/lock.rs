//! Lease locks on the shared store
//!
//! A lock is a key written with set-if-absent and a short physical TTL. The
//! value is a random token unique to the acquisition, and release deletes
//! the key only while it still holds that token, so a holder whose lease
//! already expired cannot delete a newer holder's lock. The TTL is the only
//! recovery path for a holder that never releases.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::VolatileStore;
use crate::error::Result;

/// A held lease. Release it with [`LockManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
}

impl LockLease {
    /// Lock key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token written by this acquisition
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Acquires and releases lease locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn VolatileStore>,
}

impl LockManager {
    /// Create a lock manager over `store`
    pub fn new(store: Arc<dyn VolatileStore>) -> Self {
        Self { store }
    }

    /// Try to acquire `key` for `ttl`. Returns `None` when another holder has it.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &token, ttl).await? {
            debug!(lock = %key, "Lock acquired");
            Ok(Some(LockLease {
                key: key.to_string(),
                token,
            }))
        } else {
            debug!(lock = %key, "Lock held elsewhere");
            Ok(None)
        }
    }

    /// Release a lease. Returns false when the lease had already expired or
    /// been taken over. Store failures are logged, never propagated.
    pub async fn release(&self, lease: &LockLease) -> bool {
        match self.store.delete_if_equals(&lease.key, &lease.token).await {
            Ok(true) => {
                debug!(lock = %lease.key, "Lock released");
                true
            }
            Ok(false) => {
                warn!(lock = %lease.key, "Lock lease lost before release");
                false
            }
            Err(e) => {
                warn!(lock = %lease.key, error = %e, "Failed to release lock, waiting for TTL");
                false
            }
        }
    }
}
