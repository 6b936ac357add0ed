// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job orchestrator: leases tasks and drives their handlers.
//!
//! [`TaskWorker`] polls its queue, spawns one tokio task per lease and keeps
//! each lease alive in the background while the [`JobHandler`] runs. Handlers
//! persist their progress with [`JobContext::checkpoint`] at page boundaries,
//! which is also where cancellation and lease loss are observed.
//!
//! Outcome mapping:
//!
//! | Handler result | Task |
//! |----------------|------|
//! | `Ok(result)` | `completed` |
//! | `Err(Canceled)` | `canceled` |
//! | `Err(Failed)` or a non-retryable core error | `failed` |
//! | `Err(LeaseLost)` | untouched, another worker owns it |
//! | `Err(Interrupted)` or a retryable core error | left `running`, reclaimed once stale |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vitalis_core::error::CoreError;
use vitalis_core::persistence::Persistence;
use vitalis_core::retry::{RetryPolicy, retry_transient};
use vitalis_core::throttle::ThrottleTuning;
use vitalis_core::{
    ProgressCursor, SharedThrottle, TaskQueue, TaskRecord, TaskStatus, ThrottleController,
    ThrottleMetric, ThrottleSettings,
};

use crate::config::Config;
use crate::token::PageTokenCodec;

/// Why a job stopped before producing a result.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Cancellation was requested for the task.
    #[error("task canceled")]
    Canceled,

    /// The lease was reclaimed by another worker.
    #[error("lease lost")]
    LeaseLost,

    /// The worker is shutting down.
    #[error("worker shutting down")]
    Interrupted,

    /// The job cannot succeed.
    #[error("{0}")]
    Failed(String),

    /// Core engine operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Progress persisted in a task's `task_context`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Enumeration position.
    #[serde(default)]
    pub cursor: ProgressCursor,
    /// Handler-owned progress.
    #[serde(default)]
    pub state: serde_json::Value,
}

impl JobRecord {
    /// Restore the record of a leased task. A task that never checkpointed
    /// starts from an empty record.
    pub fn from_task(task: &TaskRecord) -> Result<Self, JobError> {
        match task.task_context.as_deref() {
            None | Some("") => Ok(Self::default()),
            Some(snapshot) => serde_json::from_str(snapshot)
                .map_err(|e| JobError::Failed(format!("corrupt job record: {}", e))),
        }
    }
}

/// A job implementation for one task type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Task type this handler runs.
    fn task_type_id(&self) -> i32;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run (or resume) the job. The returned string becomes the task result.
    async fn execute(&self, ctx: &mut JobContext) -> Result<Option<String>, JobError>;
}

/// Everything a running job may touch.
pub struct JobContext {
    task: TaskRecord,
    run_id: String,
    record: JobRecord,
    queue: TaskQueue,
    throttle: SharedThrottle,
    tokens: PageTokenCodec,
    retry: RetryPolicy,
    lease_signal: CancellationToken,
    shutdown: CancellationToken,
}

impl JobContext {
    /// The leased task.
    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    /// Lease token of this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Input payload supplied at creation.
    pub fn input(&self) -> &str {
        &self.task.input_data
    }

    /// Enumeration position restored from the last checkpoint.
    pub fn cursor(&self) -> &ProgressCursor {
        &self.record.cursor
    }

    /// Mutable enumeration position; persisted on the next checkpoint.
    pub fn cursor_mut(&mut self) -> &mut ProgressCursor {
        &mut self.record.cursor
    }

    /// Handler-owned progress.
    pub fn state(&self) -> &serde_json::Value {
        &self.record.state
    }

    /// Replace the handler-owned progress; persisted on the next checkpoint.
    pub fn set_state(&mut self, state: serde_json::Value) {
        self.record.state = state;
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.queue.persistence()
    }

    /// Page token codec for vault-backed continuation tokens.
    pub fn tokens(&self) -> &PageTokenCodec {
        &self.tokens
    }

    /// Retry policy for store calls.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Throttle shared with the data-access layer.
    pub fn throttle(&self) -> &SharedThrottle {
        &self.throttle
    }

    /// Persist the job record and refresh the lease.
    ///
    /// Fails with [`JobError::LeaseLost`] or [`JobError::Canceled`] when the
    /// lease says so, and with [`JobError::Interrupted`] once the worker is
    /// shutting down (after the record is saved).
    pub async fn checkpoint(&mut self) -> Result<(), JobError> {
        let snapshot = serde_json::to_string(&self.record).map_err(CoreError::from)?;
        let status = retry_transient(&self.retry, "checkpoint", || {
            self.queue
                .keep_alive(&self.task.task_id, &self.run_id, Some(&snapshot))
        })
        .await?;

        if !status.held {
            return Err(JobError::LeaseLost);
        }
        if status.is_canceled {
            return Err(JobError::Canceled);
        }
        if self.shutdown.is_cancelled() {
            return Err(JobError::Interrupted);
        }
        debug!(
            task_id = %self.task.task_id,
            page = self.record.cursor.innermost().page,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Report the store cost of one unit of work. Returns the new throttle delay.
    pub fn report_cost(&self, resource_cost: f64) -> u64 {
        self.throttle.handle(ThrottleMetric::new(resource_cost))
    }

    /// Sleep the base plus throttle delay before the next unit of work.
    ///
    /// Wakes early when the background keep-alive sees the lease lost or a
    /// cancel request, or when the worker shuts down.
    pub async fn pace(&mut self) -> Result<(), JobError> {
        let delay = Duration::from_millis(self.throttle.total_delay_ms());
        let shutdown = self.shutdown.clone();
        let lease_signal = self.lease_signal.clone();

        let lease_changed = tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Err(JobError::Interrupted),
            _ = lease_signal.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if lease_changed {
            // The checkpoint reports whether the lease was lost or canceled.
            self.checkpoint().await?;
        }
        Ok(())
    }
}

/// Settings of a [`TaskWorker`].
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Queue to lease from.
    pub queue_id: String,
    /// Live leases allowed on the queue.
    pub max_concurrent_tasks: i64,
    /// Pause between acquisition polls.
    pub poll_interval: Duration,
    /// Keep-alive period of a running task.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a lease is stale.
    pub heartbeat_timeout: Duration,
    /// Throttle settings applied to every job.
    pub throttle: ThrottleSettings,
    /// Throttle control loop tuning.
    pub tuning: ThrottleTuning,
    /// Retry policy for transient store failures.
    pub retry: RetryPolicy,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            queue_id: "default".to_string(),
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            throttle: ThrottleSettings {
                target_percentage: None,
                budget_per_second: 1000.0,
                base_delay_ms: 50,
            },
            tuning: ThrottleTuning::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for TaskWorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_id: config.queue_id.clone(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            throttle: config.throttle.clone(),
            tuning: config.throttle_tuning.clone(),
            ..Self::default()
        }
    }
}

struct WorkerInner {
    queue: TaskQueue,
    tokens: PageTokenCodec,
    handlers: HashMap<i32, Arc<dyn JobHandler>>,
    config: TaskWorkerConfig,
    shutdown: CancellationToken,
}

/// Leases tasks from one queue and runs them.
#[derive(Clone)]
pub struct TaskWorker {
    inner: Arc<WorkerInner>,
}

/// Builder for [`TaskWorker`].
pub struct TaskWorkerBuilder {
    queue: TaskQueue,
    tokens: PageTokenCodec,
    handlers: HashMap<i32, Arc<dyn JobHandler>>,
    config: TaskWorkerConfig,
}

impl TaskWorkerBuilder {
    /// Register a handler for its task type, replacing any previous one.
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.task_type_id(), handler);
        self
    }

    /// Build the worker.
    pub fn build(self) -> TaskWorker {
        TaskWorker {
            inner: Arc::new(WorkerInner {
                queue: self.queue,
                tokens: self.tokens,
                handlers: self.handlers,
                config: self.config,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl TaskWorker {
    /// Start building a worker.
    pub fn builder(
        queue: TaskQueue,
        tokens: PageTokenCodec,
        config: TaskWorkerConfig,
    ) -> TaskWorkerBuilder {
        TaskWorkerBuilder {
            queue,
            tokens,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Token that stops the poll loop and interrupts running jobs.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Run the poll loop until shutdown, then wait for running jobs to stop.
    pub async fn run(&self) {
        let config = &self.inner.config;
        info!(
            queue_id = %config.queue_id,
            max_concurrent_tasks = config.max_concurrent_tasks,
            handlers = self.inner.handlers.len(),
            "Task worker started"
        );

        let mut jobs = JoinSet::new();
        loop {
            while let Some(joined) = jobs.try_join_next() {
                log_join(joined);
            }

            tokio::select! {
                biased;

                _ = self.inner.shutdown.cancelled() => {
                    info!("Task worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(config.poll_interval) => {
                    if let Err(e) = self.dispatch(&mut jobs).await {
                        error!(error = %e, "Failed to acquire tasks");
                    }
                }
            }
        }

        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }
        info!("Task worker stopped");
    }

    /// Lease available tasks once and run them to their outcome.
    /// Returns the number of tasks leased.
    pub async fn run_once(&self) -> Result<usize, CoreError> {
        let mut jobs = JoinSet::new();
        let leased = self.dispatch(&mut jobs).await?;
        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }
        Ok(leased)
    }

    async fn dispatch(&self, jobs: &mut JoinSet<()>) -> Result<usize, CoreError> {
        let config = &self.inner.config;
        let leased = retry_transient(&config.retry, "acquire_available_tasks", || {
            self.inner.queue.acquire_available_tasks(
                &config.queue_id,
                config.max_concurrent_tasks,
                config.heartbeat_timeout,
            )
        })
        .await?;

        let count = leased.len();
        for task in leased {
            let inner = self.inner.clone();
            jobs.spawn(async move { run_task(inner, task).await });
        }
        Ok(count)
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Job panicked");
        } else {
            warn!(error = %e, "Job was aborted");
        }
    }
}

async fn run_task(inner: Arc<WorkerInner>, task: TaskRecord) {
    let task_id = task.task_id.clone();
    let Some(run_id) = task.run_id.clone() else {
        error!(task_id = %task_id, "Leased task has no run id");
        return;
    };

    let Some(handler) = inner.handlers.get(&task.task_type_id).cloned() else {
        let message = format!("no handler registered for task type {}", task.task_type_id);
        warn!(task_id = %task_id, task_type_id = task.task_type_id, "Unknown task type");
        finish(&inner, &task_id, &run_id, TaskStatus::Failed, Some(&message)).await;
        return;
    };

    let record = match JobRecord::from_task(&task) {
        Ok(record) => record,
        Err(e) => {
            finish(&inner, &task_id, &run_id, TaskStatus::Failed, Some(&e.to_string())).await;
            return;
        }
    };

    let throttle = SharedThrottle::new(ThrottleController::new(inner.config.tuning.clone()));
    throttle.initialize(inner.config.throttle.clone());

    let lease_signal = CancellationToken::new();
    let stop_heartbeat = CancellationToken::new();
    let heartbeat = tokio::spawn(keep_lease_alive(
        inner.queue.clone(),
        task_id.clone(),
        run_id.clone(),
        inner.config.heartbeat_interval,
        lease_signal.clone(),
        stop_heartbeat.clone(),
    ));

    info!(
        task_id = %task_id,
        run_id = %run_id,
        job = handler.name(),
        retry_count = task.retry_count,
        "Running job"
    );

    let mut ctx = JobContext {
        task,
        run_id: run_id.clone(),
        record,
        queue: inner.queue.clone(),
        throttle,
        tokens: inner.tokens.clone(),
        retry: inner.config.retry.clone(),
        lease_signal,
        shutdown: inner.shutdown.clone(),
    };
    let outcome = handler.execute(&mut ctx).await;

    stop_heartbeat.cancel();
    if let Err(e) = heartbeat.await {
        warn!(task_id = %task_id, error = %e, "Keep-alive task ended abnormally");
    }

    match outcome {
        Ok(result) => {
            finish(&inner, &task_id, &run_id, TaskStatus::Completed, result.as_deref()).await;
        }
        Err(JobError::Canceled) => {
            finish(&inner, &task_id, &run_id, TaskStatus::Canceled, Some("canceled")).await;
        }
        Err(JobError::LeaseLost) => {
            warn!(task_id = %task_id, run_id = %run_id, "Lease lost, abandoning job");
        }
        Err(JobError::Interrupted) => {
            info!(task_id = %task_id, "Job interrupted by shutdown, it resumes once reclaimed");
        }
        Err(JobError::Core(e)) if e.is_retryable() => {
            warn!(
                task_id = %task_id,
                error = %e,
                "Job hit a transient failure, leaving it to be reclaimed"
            );
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Job failed");
            finish(&inner, &task_id, &run_id, TaskStatus::Failed, Some(&e.to_string())).await;
        }
    }
}

async fn finish(
    inner: &WorkerInner,
    task_id: &str,
    run_id: &str,
    status: TaskStatus,
    result: Option<&str>,
) {
    let completed = retry_transient(&inner.config.retry, "complete_task", || {
        inner.queue.complete_task(task_id, run_id, status, result)
    })
    .await;
    if let Err(e) = completed {
        error!(task_id, run_id, %status, error = %e, "Failed to record job outcome");
    }
}

async fn keep_lease_alive(
    queue: TaskQueue,
    task_id: String,
    run_id: String,
    interval: Duration,
    lease_signal: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            _ = ticker.tick() => {
                match queue.keep_alive(&task_id, &run_id, None).await {
                    Ok(status) if !status.held || status.is_canceled => {
                        lease_signal.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "Keep-alive failed"),
                }
            }
        }
    }
}
