// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed store for long continuation tokens.
//!
//! Store continuation tokens can be too long to put in a public pagination
//! link. The vault keeps the raw token under `base64url(sha256(token))` with a
//! TTL, so the link only carries the short handle. Saving the same token twice
//! yields the same handle and refreshes its expiry.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::retry::{RetryPolicy, retry_throttled};

/// Default lifetime of a vault entry.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle derived from a raw token.
pub fn token_id(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Continuation token vault.
#[derive(Clone)]
pub struct ContinuationTokenVault {
    persistence: Arc<dyn Persistence>,
    ttl: Duration,
    retry: RetryPolicy,
}

impl ContinuationTokenVault {
    /// Create a vault with the default 24 hour TTL.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            ttl: DEFAULT_TOKEN_TTL,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `raw_token` and return its handle.
    pub async fn save(&self, raw_token: &str) -> Result<String> {
        if raw_token.is_empty() {
            return Err(CoreError::invalid_argument("token", "must not be empty"));
        }

        let id = token_id(raw_token);
        retry_throttled(&self.retry, "vault_save", || {
            self.persistence.upsert_token(&id, raw_token, self.ttl)
        })
        .await?;

        debug!(token_id = %id, token_len = raw_token.len(), "Stored continuation token");
        Ok(id)
    }

    /// Resolve a handle to the raw token. Expired entries are [`CoreError::NotFound`].
    pub async fn resolve(&self, id: &str) -> Result<String> {
        if id.is_empty() {
            return Err(CoreError::invalid_argument("id", "must not be empty"));
        }

        self.persistence
            .get_token(id)
            .await?
            .map(|entry| entry.token)
            .ok_or_else(|| CoreError::not_found("continuation token", id))
    }

    /// Delete expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        retry_throttled(&self.retry, "vault_purge", || {
            self.persistence.purge_expired_tokens()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_vault() -> (ContinuationTokenVault, sqlx::SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let vault = ContinuationTokenVault::new(Arc::new(SqlitePersistence::new(pool.clone())));
        (vault, pool)
    }

    #[test]
    fn test_token_id_is_stable_and_url_safe() {
        let a = token_id("abc+/=");
        assert_eq!(a, token_id("abc+/="));
        assert_ne!(a, token_id("abc+/=x"));
        assert_eq!(a.len(), 43);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[tokio::test]
    async fn test_round_trip_and_same_id() {
        let (vault, _pool) = test_vault().await;
        let raw = "x".repeat(4096);

        let first = vault.save(&raw).await.unwrap();
        let second = vault.save(&raw).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(vault.resolve(&first).await.unwrap(), raw);
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let (vault, _pool) = test_vault().await;
        assert!(matches!(
            vault.save("").await,
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_expired_handles() {
        let (vault, pool) = test_vault().await;
        assert!(matches!(
            vault.resolve("nope").await,
            Err(CoreError::NotFound { .. })
        ));

        let id = vault.save("short-lived").await.unwrap();
        sqlx::query("UPDATE continuation_tokens SET expires_at = ? WHERE id = ?")
            .bind(chrono::Utc::now() - chrono::Duration::seconds(1))
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            vault.resolve(&id).await,
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(vault.purge_expired().await.unwrap(), 1);
    }
}
