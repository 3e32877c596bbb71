//! Per-domain mutual exclusion
//!
//! Issue, renew, revoke and delete for one domain never overlap.
//! Interactive callers use [`DomainLocks::try_acquire`] and fail fast;
//! the sweep uses [`DomainLocks::acquire_within`] and skips on timeout.
//! A domain's entry lives only while someone holds or waits for its lock.

use std::sync::Arc;
use std::time::Duration;

use certwarden_common::DomainName;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::LifecycleError;

type LockMap = DashMap<DomainName, Arc<Mutex<()>>>;

#[derive(Debug, Default)]
pub struct DomainLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of one domain operation
#[derive(Debug)]
pub struct DomainGuard {
    domain: DomainName,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl DomainGuard {
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds the only reference once nobody holds or waits
        self.locks
            .remove_if(&self.domain, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, domain: &DomainName) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(domain.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn guard(&self, domain: &DomainName, guard: OwnedMutexGuard<()>) -> DomainGuard {
        DomainGuard {
            domain: domain.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Take the lock or fail with `OperationInProgress`
    pub fn try_acquire(&self, domain: &DomainName) -> Result<DomainGuard, LifecycleError> {
        match self.lock_for(domain).try_lock_owned() {
            Ok(guard) => {
                trace!(domain = %domain, "Acquired domain lock");
                Ok(self.guard(domain, guard))
            }
            Err(_) => Err(LifecycleError::OperationInProgress {
                domain: domain.to_string(),
            }),
        }
    }

    /// Wait up to `wait` for the lock
    pub async fn acquire_within(&self, domain: &DomainName, wait: Duration) -> Option<DomainGuard> {
        let lock = self.lock_for(domain);
        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Some(self.guard(domain, guard)),
            Err(_) => {
                trace!(domain = %domain, wait = ?wait, "Timed out waiting for domain lock");
                None
            }
        }
    }

    pub fn is_locked(&self, domain: &DomainName) -> bool {
        self.locks
            .get(domain)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
