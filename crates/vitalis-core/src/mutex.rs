// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease-bound cross-process mutex.
//!
//! A lock is a row keyed by `resource_key`. Acquiring inserts the row, or
//! takes it over when the previous holder's lease has lapsed, in a single
//! statement. A crashed holder therefore blocks others for at most one lease.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::retry::{RetryPolicy, retry_throttled};

/// Default lease of a held lock.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    /// Guarded resource.
    pub resource_key: String,
    /// Unique owner id of this acquisition.
    pub owner: String,
}

/// Distributed mutex over the shared store.
#[derive(Clone)]
pub struct DistributedMutex {
    persistence: Arc<dyn Persistence>,
    lease_duration: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl DistributedMutex {
    /// Create a mutex with the default lease and poll interval.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            lease_duration: DEFAULT_LEASE_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }

    /// Override how long a lease lasts without renewal.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Override how often a contended lock is re-tried.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the retry policy for throttled renew and release calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lease duration.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Wait up to `timeout` for the lock.
    pub async fn acquire(&self, resource_key: &str, timeout: Duration) -> Result<LeaseGuard> {
        if resource_key.is_empty() {
            return Err(CoreError::invalid_argument(
                "resource_key",
                "must not be empty",
            ));
        }

        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .persistence
                .try_acquire_lock(resource_key, &owner, self.lease_duration)
                .await
            {
                Ok(true) => {
                    debug!(resource_key, owner = %owner, "Lock acquired");
                    return Ok(LeaseGuard {
                        resource_key: resource_key.to_string(),
                        owner,
                    });
                }
                Ok(false) => {}
                Err(CoreError::Throttled { .. }) => {
                    debug!(resource_key, "Lock attempt throttled");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(resource_key, timeout_ms = timeout.as_millis() as u64, "Lock timeout");
                return Err(CoreError::LockTimeout {
                    resource_key: resource_key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release the lock. Releasing twice, or after losing the lease, is a no-op.
    pub async fn release(&self, guard: &LeaseGuard) -> Result<()> {
        let removed = retry_throttled(&self.retry, "release_lock", || {
            self.persistence
                .release_lock(&guard.resource_key, &guard.owner)
        })
        .await?;
        debug!(resource_key = %guard.resource_key, removed, "Lock released");
        Ok(())
    }

    /// Extend the lease. Returns false if the lock was lost.
    pub async fn renew(&self, guard: &LeaseGuard) -> Result<bool> {
        retry_throttled(&self.retry, "renew_lock", || {
            self.persistence
                .renew_lock(&guard.resource_key, &guard.owner, self.lease_duration)
        })
        .await
    }

    /// Run `action` while holding the lock, renewing the lease as it runs.
    ///
    /// Returns `Ok(None)` if the lock could not be acquired within `timeout`,
    /// which callers treat as "another process is doing it".
    ///
    /// If the lease is taken over, or cannot be renewed for a whole lease
    /// duration, `action` is dropped unfinished and [`CoreError::LockLost`]
    /// is returned. The lock is not released on that path.
    pub async fn run_exclusive<T, F, Fut>(
        &self,
        resource_key: &str,
        timeout: Duration,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = match self.acquire(resource_key, timeout).await {
            Ok(guard) => guard,
            Err(CoreError::LockTimeout { .. }) => {
                info!(resource_key, "Lock held elsewhere, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let action = action();
        tokio::pin!(action);

        let renew_period = (self.lease_duration / 3).max(Duration::from_millis(10));
        let mut renew_every = tokio::time::interval(renew_period);
        renew_every.tick().await;
        let mut renewed_at = Instant::now();

        let outcome = loop {
            tokio::select! {
                result = &mut action => break Some(result),
                _ = renew_every.tick() => {
                    match self.renew(&guard).await {
                        Ok(true) => renewed_at = Instant::now(),
                        Ok(false) => {
                            warn!(resource_key, "Lock lease lost while running");
                            break None;
                        }
                        Err(e) if renewed_at.elapsed() >= self.lease_duration => {
                            warn!(resource_key, error = %e, "Lock lease lapsed without renewal");
                            break None;
                        }
                        Err(e) => warn!(resource_key, error = %e, "Failed to renew lock"),
                    }
                }
            }
        };

        let Some(outcome) = outcome else {
            return Err(CoreError::LockLost {
                resource_key: resource_key.to_string(),
            });
        };

        if let Err(e) = self.release(&guard).await {
            warn!(resource_key, error = %e, "Failed to release lock, it will expire");
        }
        outcome.map(Some)
    }
}
