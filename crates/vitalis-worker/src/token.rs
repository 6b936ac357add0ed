// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded page tokens for links and job records.
//!
//! Store-native continuation tokens grow with the collection and can exceed
//! what a URL or a job record should carry. Anything leaving the data-access
//! layer carries the vault handle instead. A handle that has expired resolves
//! to `None`; the caller then restarts the enumeration from its first page.

use tracing::{debug, info};
use vitalis_core::ContinuationTokenVault;
use vitalis_core::error::{CoreError, Result};

/// Swaps raw store tokens for vault handles and back.
#[derive(Clone)]
pub struct PageTokenCodec {
    vault: ContinuationTokenVault,
}

impl PageTokenCodec {
    /// Create a codec over a vault.
    pub fn new(vault: ContinuationTokenVault) -> Self {
        Self { vault }
    }

    /// Store `raw_token` and return the handle to publish.
    pub async fn encode(&self, raw_token: &str) -> Result<String> {
        self.vault.save(raw_token).await
    }

    /// Resolve a published handle.
    ///
    /// Returns `None` when the entry is missing or expired.
    pub async fn decode(&self, handle: &str) -> Result<Option<String>> {
        match self.vault.resolve(handle).await {
            Ok(raw) => {
                debug!(token_id = handle, "Resolved page token");
                Ok(Some(raw))
            }
            Err(CoreError::NotFound { .. }) => {
                info!(token_id = handle, "Page token expired, restarting from the first page");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use vitalis_core::SqlitePersistence;

    async fn test_vault(ttl: Duration) -> ContinuationTokenVault {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        vitalis_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        ContinuationTokenVault::new(Arc::new(SqlitePersistence::new(pool))).with_ttl(ttl)
    }

    #[tokio::test]
    async fn test_handle_is_bounded_and_resolves() {
        let codec = PageTokenCodec::new(test_vault(Duration::from_secs(60)).await);
        let raw = "x".repeat(10_000);

        let handle = codec.encode(&raw).await.unwrap();
        assert!(handle.len() < 64);
        assert_ne!(handle, raw);
        assert_eq!(codec.decode(&handle).await.unwrap().as_deref(), Some(raw.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_handle_decodes_to_none() {
        let codec = PageTokenCodec::new(test_vault(Duration::from_secs(60)).await);
        assert_eq!(codec.decode("never-issued").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_handle_decodes_to_none() {
        let codec = PageTokenCodec::new(test_vault(Duration::from_millis(50)).await);
        let handle = codec.encode("page-2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(codec.decode(&handle).await.unwrap(), None);
    }
}
