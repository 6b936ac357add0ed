// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable task queue with heartbeat leases.
//!
//! [`TaskQueue`] is the entry point for creating and leasing tasks. Each call
//! is one atomic unit against the store; `Throttled` results are retried here
//! with identical arguments, everything else is returned to the caller.
//!
//! A lease is identified by the `run_id` handed out at acquisition. Only the
//! holder of the current `run_id` can heartbeat or complete the task, so a
//! worker whose lease was reclaimed finds out on its next keep-alive.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{LeaseStatus, NewTask, Persistence, TaskRecord, TaskStatus};
use crate::retry::{RetryPolicy, retry_throttled};

/// Task queue handle shared by producers and workers.
#[derive(Clone)]
pub struct TaskQueue {
    persistence: Arc<dyn Persistence>,
    retry: RetryPolicy,
}

impl TaskQueue {
    /// Create a queue over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy used for throttled calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Create a queued task.
    ///
    /// When `is_unique_task_by_type` is false, creation fails with
    /// [`CoreError::DuplicateTask`] while another queued or running task of the
    /// same type exists.
    #[instrument(skip(self, input_data), fields(task_id = %task_id, queue_id = %queue_id))]
    pub async fn create_task(
        &self,
        task_id: &str,
        queue_id: &str,
        task_type_id: i32,
        input_data: &str,
        is_unique_task_by_type: bool,
        max_retry_count: i32,
    ) -> Result<TaskRecord> {
        let task = NewTask {
            task_id: task_id.to_string(),
            queue_id: queue_id.to_string(),
            task_type_id,
            input_data: input_data.to_string(),
            is_unique_task_by_type,
            max_retry_count,
        };
        task.validate()?;

        let record = retry_throttled(&self.retry, "create_task", || {
            self.persistence.create_task(&task)
        })
        .await?;

        info!(task_type_id, "Task created");
        Ok(record)
    }

    /// Lease available tasks of `queue_id`, up to `max_concurrent` live leases in total.
    pub async fn acquire_available_tasks(
        &self,
        queue_id: &str,
        max_concurrent: i64,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<TaskRecord>> {
        if queue_id.is_empty() {
            return Err(CoreError::invalid_argument("queue_id", "must not be empty"));
        }

        let leased = retry_throttled(&self.retry, "acquire_available_tasks", || {
            self.persistence
                .acquire_available_tasks(queue_id, max_concurrent, heartbeat_timeout)
        })
        .await?;

        if leased.is_empty() {
            debug!(queue_id, "No tasks available");
        }
        for task in &leased {
            if task.retry_count > 0 {
                warn!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count,
                    "Reclaimed stale lease"
                );
            } else {
                debug!(task_id = %task.task_id, "Leased task");
            }
        }
        Ok(leased)
    }

    /// Refresh the lease, optionally persisting the job record.
    pub async fn keep_alive(
        &self,
        task_id: &str,
        run_id: &str,
        task_context: Option<&str>,
    ) -> Result<LeaseStatus> {
        let status = retry_throttled(&self.retry, "keep_alive", || {
            self.persistence.keep_alive(task_id, run_id, task_context)
        })
        .await?;

        if !status.held {
            warn!(task_id, run_id, "Lease lost");
        }
        Ok(status)
    }

    /// Finish a leased task. Returns false if the lease was lost meanwhile.
    pub async fn complete_task(
        &self,
        task_id: &str,
        run_id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool> {
        let applied = retry_throttled(&self.retry, "complete_task", || {
            self.persistence
                .complete_task(task_id, run_id, status, result)
        })
        .await?;

        if applied {
            info!(task_id, run_id, %status, "Task finished");
        } else {
            warn!(task_id, run_id, %status, "Completion ignored, lease no longer held");
        }
        Ok(applied)
    }

    /// Request cooperative cancellation.
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord> {
        let record = retry_throttled(&self.retry, "cancel_task", || {
            self.persistence.cancel_task(task_id)
        })
        .await?;
        info!(task_id, status = %record.status, "Cancel requested");
        Ok(record)
    }

    /// Read a task.
    pub async fn get_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    /// Re-queue a failed or canceled task with a fresh retry budget.
    pub async fn reset_task(&self, task_id: &str) -> Result<TaskRecord> {
        let record = retry_throttled(&self.retry, "reset_task", || {
            self.persistence.reset_task(task_id)
        })
        .await?;
        info!(task_id, "Task reset");
        Ok(record)
    }

    /// Count tasks of a queue by status.
    pub async fn count_tasks(&self, queue_id: &str, status: TaskStatus) -> Result<i64> {
        self.persistence.count_tasks(queue_id, status).await
    }
}
