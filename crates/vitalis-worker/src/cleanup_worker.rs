// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes expired and finished coordination records.
//!
//! Each cycle:
//! 1. purges vault entries past their expiry,
//! 2. purges lock rows whose lease lapsed,
//! 3. deletes terminal tasks (completed, failed, canceled) finished more than
//!    `max_age` ago, in batches of `batch_size`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use vitalis_core::ContinuationTokenVault;
use vitalis_core::persistence::Persistence;
use vitalis_core::retry::{RetryPolicy, retry_throttled};

use crate::error::{Error, Result};

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether cleanup is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age after which terminal tasks are deleted.
    pub max_age: Duration,
    /// Maximum tasks to delete per batch.
    pub batch_size: i64,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
            batch_size: 100,
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VITALIS_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `VITALIS_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `VITALIS_CLEANUP_MAX_AGE_DAYS`: days before terminal tasks are deleted (default: 30)
    /// - `VITALIS_CLEANUP_BATCH_SIZE`: max tasks per batch (default: 100)
    pub fn from_env() -> Self {
        let enabled = std::env::var("VITALIS_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("VITALIS_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let max_age_days = std::env::var("VITALIS_CLEANUP_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let batch_size = std::env::var("VITALIS_CLEANUP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &i64| *v > 0)
            .unwrap_or(100);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            batch_size,
        }
    }
}

/// Counts from one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Vault entries removed.
    pub tokens_purged: u64,
    /// Lock rows removed.
    pub locks_purged: u64,
    /// Terminal tasks removed.
    pub tasks_deleted: u64,
}

/// Background worker that cleans up expired and finished records.
pub struct CleanupWorker {
    persistence: Arc<dyn Persistence>,
    vault: ContinuationTokenVault,
    retry: RetryPolicy,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: CleanupWorkerConfig) -> Self {
        Self {
            vault: ContinuationTokenVault::new(persistence.clone()),
            persistence,
            retry: RetryPolicy::default(),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signaled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Cleanup cycle failed");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run a single cleanup cycle.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let tokens_purged = self.vault.purge_expired().await?;
        let locks_purged = retry_throttled(&self.retry, "purge_expired_locks", || {
            self.persistence.purge_expired_locks()
        })
        .await?;
        let tasks_deleted = self.delete_old_tasks().await?;

        let report = CleanupReport {
            tokens_purged,
            locks_purged,
            tasks_deleted,
        };
        if report == CleanupReport::default() {
            debug!("Cleanup cycle completed, nothing to remove");
        } else {
            info!(
                tokens_purged,
                locks_purged, tasks_deleted, "Cleanup cycle completed"
            );
        }
        Ok(report)
    }

    async fn delete_old_tasks(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut total_deleted = 0u64;
        loop {
            let task_ids = self
                .persistence
                .get_terminal_tasks_older_than(cutoff, self.config.batch_size)
                .await?;
            if task_ids.is_empty() {
                break;
            }

            let batch_size = task_ids.len();
            let deleted = retry_throttled(&self.retry, "delete_tasks_batch", || {
                self.persistence.delete_tasks_batch(&task_ids)
            })
            .await?;
            total_deleted += deleted;

            debug!(
                batch_size,
                deleted, total_deleted, "Deleted batch of terminal tasks"
            );

            if batch_size < self.config.batch_size as usize {
                break;
            }
        }
        Ok(total_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use vitalis_core::{SqlitePersistence, TaskQueue, TaskStatus};

    async fn test_persistence() -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        vitalis_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqlitePersistence::new(pool))
    }

    #[test]
    fn test_default_config() {
        let config = CleanupWorkerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.max_age, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.batch_size, 100);
    }

    #[tokio::test]
    async fn test_run_once_deletes_terminal_tasks_only() {
        let persistence = test_persistence().await;
        let queue = TaskQueue::new(persistence.clone());

        for i in 0..3 {
            queue
                .create_task(&format!("done-{}", i), "Q1", 1, "x", true, 3)
                .await
                .unwrap();
        }
        let leased = queue
            .acquire_available_tasks("Q1", 3, Duration::from_secs(60))
            .await
            .unwrap();
        for task in &leased {
            let run_id = task.run_id.as_deref().unwrap();
            queue
                .complete_task(&task.task_id, run_id, TaskStatus::Completed, None)
                .await
                .unwrap();
        }
        queue.create_task("live", "Q1", 1, "x", true, 3).await.unwrap();

        let worker = CleanupWorker::new(
            persistence.clone(),
            CleanupWorkerConfig {
                enabled: true,
                max_age: Duration::ZERO,
                batch_size: 2,
                ..Default::default()
            },
        );
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.tasks_deleted, 3);
        assert!(persistence.get_task("done-0").await.unwrap().is_none());
        assert!(persistence.get_task("live").await.unwrap().is_some());

        let report = worker.run_once().await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_recent_terminal_tasks_are_kept() {
        let persistence = test_persistence().await;
        let queue = TaskQueue::new(persistence.clone());
        queue.create_task("T1", "Q1", 1, "x", true, 3).await.unwrap();
        queue.cancel_task("T1").await.unwrap();

        let worker = CleanupWorker::new(
            persistence.clone(),
            CleanupWorkerConfig {
                enabled: true,
                ..Default::default()
            },
        );
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.tasks_deleted, 0);
        assert!(persistence.get_task("T1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let worker = CleanupWorker::new(test_persistence().await, CleanupWorkerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("disabled worker should return at once");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let worker = Arc::new(CleanupWorker::new(
            test_persistence().await,
            CleanupWorkerConfig {
                enabled: true,
                ..Default::default()
            },
        ));
        let shutdown = worker.shutdown_handle();
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop on shutdown")
            .unwrap();
    }
}
