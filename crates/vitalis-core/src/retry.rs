// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-site retry for operations the store did not accept.
//!
//! Every atomic operation in this crate is idempotent, so a
//! [`CoreError::Throttled`] result can be retried with identical arguments.
//! Components retry `Throttled` themselves ([`retry_throttled`]); transient
//! store failures are left to the orchestrator ([`retry_transient`]).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{CoreError, Result};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after `failures_so_far` failed attempts (0-based).
    pub fn backoff_for(&self, failures_so_far: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let millis = self.initial_backoff.as_millis() as f64 * factor.powi(failures_so_far as i32);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects, or
/// the policy runs out of attempts.
pub async fn retry_with<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&CoreError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) && failures + 1 < max_attempts => {
                let delay = policy.backoff_for(failures);
                warn!(
                    operation,
                    attempt = failures + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying operation"
                );
                failures += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry only [`CoreError::Throttled`].
pub async fn retry_throttled<T, F, Fut>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(
        policy,
        operation,
        |err| matches!(err, CoreError::Throttled { .. }),
        op,
    )
    .await
}

/// Retry any retryable error (throttling and transient store failures).
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(policy, operation, CoreError::is_retryable, op).await
}
