// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for vitalis-worker.
//!
//! [`WorkerRuntime`] runs the schema upgrade, then the task worker and the
//! cleanup worker as background tasks of an existing tokio application.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use vitalis_worker::db::DatabasePool;
//! use vitalis_worker::runtime::WorkerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = DatabasePool::connect("postgres://...", 10).await?;
//!
//!     let runtime = WorkerRuntime::builder()
//!         .persistence(db.persistence(Duration::from_secs(5)))
//!         .database(db)
//!         .queue_id("maintenance")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vitalis_core::persistence::Persistence;
use vitalis_core::throttle::ThrottleTuning;
use vitalis_core::{ContinuationTokenVault, DistributedMutex, TaskQueue, ThrottleSettings};

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::Config;
use crate::db::DatabasePool;
use crate::jobs::builtin_handlers;
use crate::orchestrator::{JobHandler, TaskWorker, TaskWorkerConfig};
use crate::token::PageTokenCodec;
use crate::upgrade::run_schema_upgrade;

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    database: Option<DatabasePool>,
    worker_config: TaskWorkerConfig,
    cleanup_config: CleanupWorkerConfig,
    token_ttl: Duration,
    upgrade_lock_timeout: Duration,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            database: None,
            worker_config: TaskWorkerConfig::default(),
            cleanup_config: CleanupWorkerConfig::default(),
            token_ttl: vitalis_core::vault::DEFAULT_TOKEN_TTL,
            upgrade_lock_timeout: Duration::from_secs(30),
            handlers: builtin_handlers(),
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.worker_config = TaskWorkerConfig::from(config);
        self.cleanup_config = config.cleanup.clone();
        self.token_ttl = config.token_ttl;
        self.upgrade_lock_timeout = config.upgrade_lock_timeout;
        self
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Database to migrate on start. Without it the schema upgrade is skipped.
    pub fn database(mut self, database: DatabasePool) -> Self {
        self.database = Some(database);
        self
    }

    /// Queue to lease from.
    pub fn queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.worker_config.queue_id = queue_id.into();
        self
    }

    /// Live leases allowed on the queue.
    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: i64) -> Self {
        self.worker_config.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    /// Pause between acquisition polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.worker_config.poll_interval = interval;
        self
    }

    /// Keep-alive period and stale-lease threshold.
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.worker_config.heartbeat_interval = interval;
        self.worker_config.heartbeat_timeout = timeout;
        self
    }

    /// Throttle settings applied to every job.
    pub fn throttle(mut self, settings: ThrottleSettings) -> Self {
        self.worker_config.throttle = settings;
        self
    }

    /// Throttle step sizes, ceiling and hysteresis band.
    pub fn throttle_tuning(mut self, tuning: ThrottleTuning) -> Self {
        self.worker_config.tuning = tuning;
        self
    }

    /// Cleanup worker settings.
    pub fn cleanup_config(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Lifetime of vault entries.
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Register an additional job handler.
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validate and build the runtime configuration.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        if self.worker_config.queue_id.trim().is_empty() {
            anyhow::bail!("queue_id must not be empty");
        }
        if self.worker_config.max_concurrent_tasks <= 0 {
            anyhow::bail!("max_concurrent_tasks must be positive");
        }
        if self.worker_config.heartbeat_interval.is_zero()
            || self.worker_config.heartbeat_interval * 3 > self.worker_config.heartbeat_timeout
        {
            anyhow::bail!("heartbeat interval must be at most a third of the heartbeat timeout");
        }
        if self.worker_config.tuning.window_size == 0 {
            anyhow::bail!("throttle window_size must be positive");
        }

        Ok(WorkerRuntimeConfig {
            persistence,
            database: self.database,
            worker_config: self.worker_config,
            cleanup_config: self.cleanup_config,
            token_ttl: self.token_ttl,
            upgrade_lock_timeout: self.upgrade_lock_timeout,
            handlers: self.handlers,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    database: Option<DatabasePool>,
    worker_config: TaskWorkerConfig,
    cleanup_config: CleanupWorkerConfig,
    token_ttl: Duration,
    upgrade_lock_timeout: Duration,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerRuntimeConfig {
    /// Upgrade the schema, then spawn the task worker and cleanup worker.
    pub async fn start(self) -> Result<WorkerRuntime> {
        if let Some(db) = &self.database {
            let mutex = DistributedMutex::new(self.persistence.clone());
            run_schema_upgrade(db, &mutex, self.upgrade_lock_timeout).await?;
        }

        let queue = TaskQueue::new(self.persistence.clone())
            .with_retry_policy(self.worker_config.retry.clone());
        let tokens = PageTokenCodec::new(
            ContinuationTokenVault::new(self.persistence.clone()).with_ttl(self.token_ttl),
        );

        let queue_id = self.worker_config.queue_id.clone();
        let mut builder = TaskWorker::builder(queue, tokens, self.worker_config);
        for handler in self.handlers {
            builder = builder.handler(handler);
        }
        let worker = builder.build();
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        let cleanup_worker = CleanupWorker::new(self.persistence.clone(), self.cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!(queue_id = %queue_id, "WorkerRuntime started");

        Ok(WorkerRuntime {
            worker_handle,
            cleanup_handle,
            worker_shutdown,
            cleanup_shutdown,
        })
    }
}

/// Running worker with its background tasks.
pub struct WorkerRuntime {
    worker_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    worker_shutdown: CancellationToken,
    cleanup_shutdown: Arc<Notify>,
}

impl WorkerRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Running jobs stop at their next checkpoint and keep their lease until
    /// it goes stale, so another worker resumes them from the saved cursor.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");

        self.worker_shutdown.cancel();
        self.cleanup_shutdown.notify_one();

        let mut failed = false;
        if let Err(e) = self.worker_handle.await {
            error!("Task worker panicked: {}", e);
            failed = true;
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker panicked: {}", e);
            failed = true;
        }

        if failed {
            anyhow::bail!("a background task panicked");
        }
        info!("WorkerRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished() && !self.cleanup_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BULK_HARD_DELETE_TASK_TYPE;
    use vitalis_core::TaskStatus;

    #[test]
    fn test_build_requires_persistence() {
        let err = WorkerRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("persistence"));
    }

    #[tokio::test]
    async fn test_build_rejects_heartbeat_too_close_to_timeout() {
        let db = DatabasePool::connect("sqlite::memory:", 1).await.unwrap();
        let result = WorkerRuntime::builder()
            .persistence(db.persistence(Duration::from_secs(5)))
            .heartbeat(Duration::from_secs(30), Duration::from_secs(60))
            .build();
        assert!(result.is_err());
    }

    fn loaded_config(tuning: ThrottleTuning) -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            queue_id: "maintenance".to_string(),
            max_concurrent_tasks: 2,
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            throttle: ThrottleSettings {
                target_percentage: Some(80),
                budget_per_second: 500.0,
                base_delay_ms: 20,
            },
            throttle_tuning: tuning,
            token_ttl: Duration::from_secs(600),
            upgrade_lock_timeout: Duration::from_secs(10),
            cleanup: CleanupWorkerConfig::default(),
        }
    }

    #[test]
    fn test_config_carries_throttle_tuning() {
        let tuning = ThrottleTuning {
            increase_step_ms: Some(40),
            decrease_step_ms: Some(5),
            max_throttle_delay_ms: Some(2000),
            lower_band_ratio: 0.6,
            window_size: 10,
        };
        let builder = WorkerRuntime::builder().config(&loaded_config(tuning.clone()));
        assert_eq!(builder.worker_config.tuning, tuning);
        assert_eq!(builder.worker_config.throttle.target_percentage, Some(80));

        let overridden = builder.throttle_tuning(ThrottleTuning::default());
        assert_eq!(overridden.worker_config.tuning, ThrottleTuning::default());
    }

    #[tokio::test]
    async fn test_build_rejects_empty_throttle_window() {
        let db = DatabasePool::connect("sqlite::memory:", 1).await.unwrap();
        let result = WorkerRuntime::builder()
            .persistence(db.persistence(Duration::from_secs(5)))
            .throttle_tuning(ThrottleTuning {
                window_size: 0,
                ..ThrottleTuning::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_runs_jobs_and_shuts_down() {
        let db = DatabasePool::connect("sqlite::memory:", 1).await.unwrap();
        let persistence = db.persistence(Duration::from_secs(5));

        let runtime = WorkerRuntime::builder()
            .persistence(persistence.clone())
            .database(db)
            .queue_id("maintenance")
            .poll_interval(Duration::from_millis(10))
            .throttle(ThrottleSettings {
                target_percentage: None,
                budget_per_second: 1000.0,
                base_delay_ms: 0,
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());

        persistence
            .save_resource_version("Patient", "p1", "{}")
            .await
            .unwrap();
        let queue = TaskQueue::new(persistence.clone());
        let input = serde_json::json!({ "resourceTypes": ["Patient"] }).to_string();
        queue
            .create_task("bulk-1", "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, false, 3)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.get_task("bulk-1").await.unwrap().status != TaskStatus::Completed {
            assert!(tokio::time::Instant::now() < deadline, "job did not complete");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(
            persistence
                .list_resource_versions("Patient", "p1")
                .await
                .unwrap()
                .is_empty()
        );

        runtime.shutdown().await.unwrap();
    }
}
