//! Persistence interfaces and backends for vitalis-core.
//!
//! The store is only trusted to execute one statement or transaction
//! atomically. Every coordination primitive of the engine (insert-if-absent,
//! lease-by-staleness, mutex-by-row) is expressed as one such atomic unit per
//! trait method. When a unit exhausts its budget (lock timeout, busy database,
//! serialization failure) the backend returns [`CoreError::Throttled`] and the
//! caller repeats the identical call.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// Leased by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error or ran out of retries.
    Failed,
    /// Stopped after a cancel request.
    Canceled,
}

impl TaskStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal statuses are final and never leased again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(CoreError::invalid_argument(
                "status",
                format!("unknown task status '{}'", other),
            )),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Task record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    /// Globally unique task key.
    pub task_id: String,
    /// Queue the task belongs to.
    pub queue_id: String,
    /// Job category.
    pub task_type_id: i32,
    /// Opaque payload supplied at creation.
    pub input_data: String,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    /// Creation-time flag; when false the task was subject to type exclusivity.
    pub is_unique_task_by_type: bool,
    /// Number of times a stale lease on this task was reclaimed.
    pub retry_count: i32,
    /// Reclaims allowed before the task is failed.
    pub max_retry_count: i32,
    /// Lease token of the current (or last) acquisition.
    pub run_id: Option<String>,
    /// Cooperative cancel request.
    pub is_canceled: bool,
    /// Serialized job record (progress cursor and handler state).
    pub task_context: Option<String>,
    /// Terminal result payload.
    pub result: Option<String>,
    /// Last heartbeat (doubles as last-modified time for lease selection).
    pub heartbeat_at: DateTime<Utc>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was first leased.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Arguments of a task creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    /// Globally unique task key.
    pub task_id: String,
    /// Queue to place the task on.
    pub queue_id: String,
    /// Job category, must be positive.
    pub task_type_id: i32,
    /// Opaque payload.
    pub input_data: String,
    /// When false, no other non-terminal task of the same type may exist.
    pub is_unique_task_by_type: bool,
    /// Stale-lease reclaims allowed before the task is failed.
    pub max_retry_count: i32,
}

impl NewTask {
    /// Reject malformed input before touching the store.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.task_id.trim().is_empty() {
            return Err(CoreError::invalid_argument("task_id", "must not be empty"));
        }
        if self.queue_id.trim().is_empty() {
            return Err(CoreError::invalid_argument("queue_id", "must not be empty"));
        }
        if self.task_type_id <= 0 {
            return Err(CoreError::invalid_argument(
                "task_type_id",
                "must be a positive integer",
            ));
        }
        if self.max_retry_count < 0 {
            return Err(CoreError::invalid_argument(
                "max_retry_count",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

/// Result of a keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStatus {
    /// False when the task is no longer running under the caller's run id.
    pub held: bool,
    /// Cancel requested for the task.
    pub is_canceled: bool,
}

/// Continuation token vault entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenVaultEntry {
    /// Content hash of the token.
    pub id: String,
    /// Raw store token.
    pub token: String,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

/// Lease-bound distributed lock row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaseLock {
    /// Name of the guarded resource.
    pub resource_key: String,
    /// Identifier of the holder.
    pub lease_owner: String,
    /// When the holder acquired (or took over) the lock.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Version of a stored clinical resource.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceVersionRecord {
    /// Resource type (e.g. "Patient").
    pub resource_type: String,
    /// Logical id within the type.
    pub resource_id: String,
    /// Version number.
    pub version: i32,
    /// False for the current version.
    pub is_history: bool,
    /// Raw document.
    pub payload: String,
}

/// One page of resource ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePage {
    /// Ids on this page, ascending.
    pub resource_ids: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub continuation_token: Option<String>,
}

/// Execution budget of a single hard-delete invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardDeleteBudget {
    /// Maximum documents deleted per invocation.
    pub max_operations: u32,
    /// Wall-clock budget per invocation.
    pub max_duration: Duration,
}

impl Default for HardDeleteBudget {
    fn default() -> Self {
        Self {
            max_operations: 100,
            max_duration: Duration::from_secs(5),
        }
    }
}

/// Progress of a hard-delete invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardDeleteOutcome {
    /// Documents deleted by this invocation.
    pub deleted: u64,
    /// False when the budget ran out with matching documents left.
    pub accepted: bool,
}

/// Persistence interface used by the queue, vault, mutex and workers.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Task queue
    // ========================================================================

    /// Atomic check-then-insert of a `queued` task.
    ///
    /// Fails with [`CoreError::DuplicateTask`] when a row with the same
    /// `task_id` exists or, if `is_unique_task_by_type` is false, when a
    /// non-terminal row with the same `task_type_id` exists.
    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, CoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// Lease up to `max_concurrent - live leases` available tasks of `queue_id`.
    ///
    /// Available means `queued`, or `running` with a heartbeat older than
    /// `heartbeat_timeout`. Oldest heartbeat first. Reclaimed tasks have their
    /// retry count incremented; stale tasks out of retries are failed and
    /// queued tasks with a cancel request are canceled instead of leased.
    async fn acquire_available_tasks(
        &self,
        queue_id: &str,
        max_concurrent: i64,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    /// Refresh the heartbeat (and optionally the job record) of a lease.
    async fn keep_alive(
        &self,
        task_id: &str,
        run_id: &str,
        task_context: Option<&str>,
    ) -> Result<LeaseStatus, CoreError>;

    /// Move a running task to a terminal status. Returns false if the caller
    /// no longer holds the lease.
    async fn complete_task(
        &self,
        task_id: &str,
        run_id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Request cooperative cancellation. Queued tasks are canceled at once.
    async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord, CoreError>;

    /// Re-queue a failed or canceled task.
    async fn reset_task(&self, task_id: &str) -> Result<TaskRecord, CoreError>;

    /// Count tasks of a queue by status.
    async fn count_tasks(&self, queue_id: &str, status: TaskStatus) -> Result<i64, CoreError>;

    /// Terminal task ids finished before `older_than`, oldest first.
    async fn get_terminal_tasks_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError>;

    async fn delete_tasks_batch(&self, task_ids: &[String]) -> Result<u64, CoreError>;

    // ========================================================================
    // Continuation token vault
    // ========================================================================

    /// Insert the entry or refresh the expiry of an existing one.
    async fn upsert_token(
        &self,
        id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<TokenVaultEntry, CoreError>;

    /// Fetch an unexpired entry.
    async fn get_token(&self, id: &str) -> Result<Option<TokenVaultEntry>, CoreError>;

    async fn purge_expired_tokens(&self) -> Result<u64, CoreError>;

    // ========================================================================
    // Distributed locks
    // ========================================================================

    /// Insert the lock row, or take it over if its lease expired. Returns
    /// whether `owner` now holds the lock.
    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, CoreError>;

    /// Extend a held lease. Returns false if `owner` no longer holds it.
    async fn renew_lock(
        &self,
        resource_key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, CoreError>;

    /// Delete the lock row if `owner` holds it. Returns whether a row was removed.
    async fn release_lock(&self, resource_key: &str, owner: &str) -> Result<bool, CoreError>;

    async fn get_lock(&self, resource_key: &str) -> Result<Option<LeaseLock>, CoreError>;

    async fn purge_expired_locks(&self) -> Result<u64, CoreError>;

    // ========================================================================
    // Resources
    // ========================================================================

    /// Store a new current version, demoting the previous current version to history.
    async fn save_resource_version(
        &self,
        resource_type: &str,
        resource_id: &str,
        payload: &str,
    ) -> Result<ResourceVersionRecord, CoreError>;

    async fn list_resource_versions(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceVersionRecord>, CoreError>;

    /// Page through ids of current resources of a type, ascending.
    async fn list_resource_ids(
        &self,
        resource_type: &str,
        continuation_token: Option<&str>,
        page_size: i64,
    ) -> Result<ResourcePage, CoreError>;

    /// Delete every version of a resource within `budget`.
    async fn hard_delete(
        &self,
        resource_type: &str,
        resource_id: &str,
        budget: HardDeleteBudget,
    ) -> Result<HardDeleteOutcome, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

pub(crate) fn chrono_duration(field: &str, duration: Duration) -> Result<chrono::Duration, CoreError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::invalid_argument(field, format!("duration out of range: {}", e)))
}

/// Keyset token used by `list_resource_ids`: the last id of the previous page.
pub(crate) fn encode_resource_token(last_id: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(last_id.as_bytes())
}

pub(crate) fn decode_resource_token(token: &str) -> Result<String, CoreError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| CoreError::invalid_argument("continuation_token", e.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|e| CoreError::invalid_argument("continuation_token", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> NewTask {
        NewTask {
            task_id: "T1".to_string(),
            queue_id: "Q1".to_string(),
            task_type_id: 5,
            input_data: "payload".to_string(),
            is_unique_task_by_type: false,
            max_retry_count: 3,
        }
    }

    #[test]
    fn test_task_status_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_new_task_validation() {
        assert!(new_task().validate().is_ok());

        let cases = [
            (NewTask { task_id: String::new(), ..new_task() }, "task_id"),
            (NewTask { queue_id: " ".to_string(), ..new_task() }, "queue_id"),
            (NewTask { task_type_id: 0, ..new_task() }, "task_type_id"),
            (NewTask { max_retry_count: -1, ..new_task() }, "max_retry_count"),
        ];
        for (task, expected_field) in cases {
            match task.validate() {
                Err(CoreError::InvalidArgument { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected InvalidArgument for {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn test_resource_token_round_trip() {
        let token = encode_resource_token("patient-42");
        assert_eq!(decode_resource_token(&token).unwrap(), "patient-42");
        assert!(decode_resource_token("***").is_err());
    }
}
