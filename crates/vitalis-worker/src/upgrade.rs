// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema upgrade serialized across workers.
//!
//! Every worker calls [`run_schema_upgrade`] at startup. The first one to take
//! the `schema-upgrade` lock applies pending migrations; the others wait up to
//! the configured timeout and then move on, assuming the holder finishes it.

use std::time::Duration;

use tracing::info;
use vitalis_core::DistributedMutex;
use vitalis_core::error::CoreError;

use crate::db::DatabasePool;
use crate::error::Result;

/// Lock key guarding migrations.
pub const SCHEMA_UPGRADE_LOCK: &str = "schema-upgrade";

/// Whether this process applied the migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Migrations ran under the lock.
    Applied,
    /// Another process holds the lock.
    Skipped,
}

/// Apply pending migrations while holding the `schema-upgrade` lock.
pub async fn run_schema_upgrade(
    db: &DatabasePool,
    mutex: &DistributedMutex,
    timeout: Duration,
) -> Result<UpgradeOutcome> {
    db.bootstrap().await?;

    let applied = mutex
        .run_exclusive(SCHEMA_UPGRADE_LOCK, timeout, || async {
            db.migrate().await.map_err(|e| CoreError::Storage {
                operation: "schema_upgrade".to_string(),
                details: e.to_string(),
            })
        })
        .await?;

    match applied {
        Some(()) => {
            info!(backend = db.backend(), "Schema upgrade applied");
            Ok(UpgradeOutcome::Applied)
        }
        None => {
            info!(
                timeout_ms = timeout.as_millis() as u64,
                "Schema upgrade skipped, lock held by another worker"
            );
            Ok(UpgradeOutcome::Skipped)
        }
    }
}
