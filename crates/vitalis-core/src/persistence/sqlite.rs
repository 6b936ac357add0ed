//! SQLite-backed persistence implementation.
//!
//! SQLite serializes writers, so each atomic unit is a single statement or a
//! transaction whose first statement writes. Timestamps are written by the
//! application as RFC 3339 UTC text and compared lexically.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;

use super::{
    HardDeleteBudget, HardDeleteOutcome, LeaseLock, LeaseStatus, NewTask, Persistence,
    ResourcePage, ResourceVersionRecord, TaskRecord, TaskStatus, TokenVaultEntry, chrono_duration,
    decode_resource_token, encode_resource_token,
};

const LEASE_EXPIRED_RESULT: &str = "lease expired with no retries left";

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |e| CoreError::from_sqlx(operation, e)
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/vitalis.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Storage {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::TransientStoreFailure {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| CoreError::Storage {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

        Ok(Self { pool })
    }

    /// Explain why a conditional reset matched no row.
    async fn diagnose_reset(&self, task_id: &str) -> CoreError {
        match self.get_task(task_id).await {
            Ok(None) => CoreError::not_found("task", task_id),
            Ok(Some(task)) if !matches!(task.status, TaskStatus::Failed | TaskStatus::Canceled) => {
                CoreError::invalid_argument(
                    "task_id",
                    format!("task is {}, only failed or canceled tasks can be reset", task.status),
                )
            }
            Ok(Some(_)) => CoreError::DuplicateTask {
                task_id: task_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ========================================================================
    // Task queue
    // ========================================================================

    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, CoreError> {
        task.validate()?;
        let now = Utc::now();

        let result = sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO tasks (
                task_id, queue_id, task_type_id, input_data, status,
                is_unique_task_by_type, retry_count, max_retry_count,
                heartbeat_at, created_at
            )
            SELECT ?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6, ?7, ?7
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks
                WHERE task_id = ?1
                   OR (?5 = 0 AND task_type_id = ?3 AND status IN ('queued', 'running'))
            )
            RETURNING *
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.queue_id)
        .bind(task.task_type_id)
        .bind(&task.input_data)
        .bind(task.is_unique_task_by_type)
        .bind(task.max_retry_count)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(CoreError::DuplicateTask {
                task_id: task.task_id.clone(),
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::DuplicateTask {
                    task_id: task.task_id.clone(),
                })
            }
            Err(e) => Err(CoreError::from_sqlx("create_task", e)),
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_task"))
    }

    async fn acquire_available_tasks(
        &self,
        queue_id: &str,
        max_concurrent: i64,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        if max_concurrent <= 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let expiration = now - chrono_duration("heartbeat_timeout", heartbeat_timeout)?;

        let mut tx = self.pool.begin().await.map_err(db_err("acquire"))?;

        // Canceled before any worker saw them.
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'canceled', finished_at = ?2, heartbeat_at = ?2
            WHERE queue_id = ?1 AND status = 'queued' AND is_canceled = 1
            "#,
        )
        .bind(queue_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        // Stale leases that must not be handed out again.
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN is_canceled = 1 THEN 'canceled' ELSE 'failed' END,
                result = CASE WHEN is_canceled = 1 THEN result ELSE ?4 END,
                finished_at = ?3,
                heartbeat_at = ?3
            WHERE queue_id = ?1
              AND status = 'running'
              AND heartbeat_at <= ?2
              AND (is_canceled = 1 OR retry_count >= max_retry_count)
            "#,
        )
        .bind(queue_id)
        .bind(expiration)
        .bind(now)
        .bind(LEASE_EXPIRED_RESULT)
        .execute(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        let (live,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE queue_id = ?1 AND status = 'running' AND heartbeat_at > ?2
            "#,
        )
        .bind(queue_id)
        .bind(expiration)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        let limit = (max_concurrent - live).max(0);
        if limit == 0 {
            tx.commit().await.map_err(db_err("acquire"))?;
            return Ok(Vec::new());
        }

        let candidates: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT task_id FROM tasks
            WHERE queue_id = ?1
              AND (status = 'queued' OR (status = 'running' AND heartbeat_at <= ?2))
            ORDER BY heartbeat_at ASC, created_at ASC
            LIMIT ?3
            "#,
        )
        .bind(queue_id)
        .bind(expiration)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        let mut leased = Vec::with_capacity(candidates.len());
        for (task_id,) in candidates {
            let run_id = Uuid::new_v4().to_string();
            let record = sqlx::query_as::<_, TaskRecord>(
                r#"
                UPDATE tasks
                SET retry_count = retry_count + CASE WHEN status = 'running' THEN 1 ELSE 0 END,
                    status = 'running',
                    run_id = ?2,
                    heartbeat_at = ?3,
                    started_at = COALESCE(started_at, ?3)
                WHERE task_id = ?1
                  AND (status = 'queued' OR (status = 'running' AND heartbeat_at <= ?4))
                RETURNING *
                "#,
            )
            .bind(&task_id)
            .bind(&run_id)
            .bind(now)
            .bind(expiration)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("acquire"))?;

            if let Some(record) = record {
                leased.push(record);
            }
        }

        tx.commit().await.map_err(db_err("acquire"))?;
        Ok(leased)
    }

    async fn keep_alive(
        &self,
        task_id: &str,
        run_id: &str,
        task_context: Option<&str>,
    ) -> Result<LeaseStatus, CoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET heartbeat_at = ?3, task_context = COALESCE(?4, task_context)
            WHERE task_id = ?1 AND run_id = ?2 AND status = 'running'
            RETURNING is_canceled
            "#,
        )
        .bind(task_id)
        .bind(run_id)
        .bind(Utc::now())
        .bind(task_context)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("keep_alive"))?;

        Ok(match row {
            Some((is_canceled,)) => LeaseStatus {
                held: true,
                is_canceled,
            },
            None => LeaseStatus {
                held: false,
                is_canceled: false,
            },
        })
    }

    async fn complete_task(
        &self,
        task_id: &str,
        run_id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool, CoreError> {
        if !status.is_terminal() {
            return Err(CoreError::invalid_argument(
                "status",
                format!("'{}' is not a terminal status", status),
            ));
        }
        let now = Utc::now();

        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?3, result = ?4, finished_at = ?5, heartbeat_at = ?5
            WHERE task_id = ?1 AND run_id = ?2 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(run_id)
        .bind(status.as_str())
        .bind(result)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("complete_task"))?;

        Ok(done.rows_affected() == 1)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let now = Utc::now();

        sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET is_canceled = CASE WHEN status IN ('queued', 'running') THEN 1 ELSE is_canceled END,
                finished_at = CASE WHEN status = 'queued' THEN ?2 ELSE finished_at END,
                status = CASE WHEN status = 'queued' THEN 'canceled' ELSE status END
            WHERE task_id = ?1
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("cancel_task"))?
        .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    async fn reset_task(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let now = Utc::now();

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET status = 'queued',
                is_canceled = 0,
                retry_count = 0,
                run_id = NULL,
                result = NULL,
                finished_at = NULL,
                heartbeat_at = ?2
            WHERE task_id = ?1
              AND status IN ('failed', 'canceled')
              AND (
                  is_unique_task_by_type = 1
                  OR NOT EXISTS (
                      SELECT 1 FROM tasks other
                      WHERE other.task_type_id = tasks.task_type_id
                        AND other.task_id <> tasks.task_id
                        AND other.status IN ('queued', 'running')
                  )
              )
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("reset_task"))?;

        match record {
            Some(record) => Ok(record),
            None => Err(self.diagnose_reset(task_id).await),
        }
    }

    async fn count_tasks(&self, queue_id: &str, status: TaskStatus) -> Result<i64, CoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE queue_id = ? AND status = ?")
                .bind(queue_id)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err("count_tasks"))?;
        Ok(count)
    }

    async fn get_terminal_tasks_older_than(
        &self,
        older_than: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT task_id FROM tasks
            WHERE status IN ('completed', 'failed', 'canceled')
              AND finished_at IS NOT NULL
              AND finished_at < ?1
            ORDER BY finished_at ASC
            LIMIT ?2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get_terminal_tasks_older_than"))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_tasks_batch(&self, task_ids: &[String]) -> Result<u64, CoreError> {
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed', 'canceled') AND task_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in task_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_tasks_batch"))?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Continuation token vault
    // ========================================================================

    async fn upsert_token(
        &self,
        id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<TokenVaultEntry, CoreError> {
        let expires_at = Utc::now() + chrono_duration("ttl", ttl)?;

        sqlx::query_as::<_, TokenVaultEntry>(
            r#"
            INSERT INTO continuation_tokens (id, token, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET expires_at = excluded.expires_at
            RETURNING id, token, expires_at
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("upsert_token"))
    }

    async fn get_token(&self, id: &str) -> Result<Option<TokenVaultEntry>, CoreError> {
        sqlx::query_as::<_, TokenVaultEntry>(
            r#"
            SELECT id, token, expires_at FROM continuation_tokens
            WHERE id = ?1 AND expires_at > ?2
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_token"))
    }

    async fn purge_expired_tokens(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM continuation_tokens WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err("purge_expired_tokens"))?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Distributed locks
    // ========================================================================

    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let expires_at = now + chrono_duration("lease", lease)?;

        let result = sqlx::query(
            r#"
            INSERT INTO lease_locks (resource_key, lease_owner, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(resource_key) DO UPDATE
            SET lease_owner = excluded.lease_owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE lease_locks.expires_at <= excluded.acquired_at
               OR lease_locks.lease_owner = excluded.lease_owner
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("try_acquire_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lock(
        &self,
        resource_key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let expires_at = now + chrono_duration("lease", lease)?;

        let result = sqlx::query(
            r#"
            UPDATE lease_locks SET expires_at = ?3
            WHERE resource_key = ?1 AND lease_owner = ?2 AND expires_at > ?4
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("renew_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, resource_key: &str, owner: &str) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM lease_locks WHERE resource_key = ? AND lease_owner = ?")
                .bind(resource_key)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(db_err("release_lock"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, resource_key: &str) -> Result<Option<LeaseLock>, CoreError> {
        sqlx::query_as::<_, LeaseLock>(
            "SELECT resource_key, lease_owner, acquired_at, expires_at FROM lease_locks WHERE resource_key = ?",
        )
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_lock"))
    }

    async fn purge_expired_locks(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM lease_locks WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err("purge_expired_locks"))?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Resources
    // ========================================================================

    async fn save_resource_version(
        &self,
        resource_type: &str,
        resource_id: &str,
        payload: &str,
    ) -> Result<ResourceVersionRecord, CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("save_resource_version"))?;

        sqlx::query(
            r#"
            UPDATE resources SET is_history = 1
            WHERE resource_type = ?1 AND resource_id = ?2 AND is_history = 0
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("save_resource_version"))?;

        let (latest,): (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM resources WHERE resource_type = ?1 AND resource_id = ?2",
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("save_resource_version"))?;

        let record = sqlx::query_as::<_, ResourceVersionRecord>(
            r#"
            INSERT INTO resources (resource_type, resource_id, version, is_history, payload)
            VALUES (?1, ?2, ?3, 0, ?4)
            RETURNING resource_type, resource_id, version, is_history, payload
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(latest + 1)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("save_resource_version"))?;

        tx.commit().await.map_err(db_err("save_resource_version"))?;
        Ok(record)
    }

    async fn list_resource_versions(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceVersionRecord>, CoreError> {
        sqlx::query_as::<_, ResourceVersionRecord>(
            r#"
            SELECT resource_type, resource_id, version, is_history, payload
            FROM resources
            WHERE resource_type = ?1 AND resource_id = ?2
            ORDER BY version ASC
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_resource_versions"))
    }

    async fn list_resource_ids(
        &self,
        resource_type: &str,
        continuation_token: Option<&str>,
        page_size: i64,
    ) -> Result<ResourcePage, CoreError> {
        if page_size <= 0 {
            return Err(CoreError::invalid_argument("page_size", "must be positive"));
        }
        let after = continuation_token.map(decode_resource_token).transpose()?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT resource_id FROM resources
            WHERE resource_type = ?1
              AND is_history = 0
              AND (?2 IS NULL OR resource_id > ?2)
            ORDER BY resource_id ASC
            LIMIT ?3
            "#,
        )
        .bind(resource_type)
        .bind(after)
        .bind(page_size + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_resource_ids"))?;

        let mut resource_ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        let has_more = resource_ids.len() as i64 > page_size;
        resource_ids.truncate(page_size as usize);
        let continuation_token = match resource_ids.last() {
            Some(last) if has_more => Some(encode_resource_token(last)),
            _ => None,
        };

        Ok(ResourcePage {
            resource_ids,
            continuation_token,
        })
    }

    async fn hard_delete(
        &self,
        resource_type: &str,
        resource_id: &str,
        budget: HardDeleteBudget,
    ) -> Result<HardDeleteOutcome, CoreError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(db_err("hard_delete"))?;

        // History first so the current version stays readable until the end.
        let versions: Vec<(i32,)> = sqlx::query_as(
            r#"
            SELECT version FROM resources
            WHERE resource_type = ?1 AND resource_id = ?2
            ORDER BY is_history DESC, version ASC
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("hard_delete"))?;

        let mut deleted = 0u64;
        for (version,) in &versions {
            // At least one delete per invocation so callers always make progress.
            let out_of_time = deleted > 0 && started.elapsed() >= budget.max_duration;
            if deleted >= u64::from(budget.max_operations) || out_of_time {
                break;
            }
            let result = sqlx::query(
                "DELETE FROM resources WHERE resource_type = ?1 AND resource_id = ?2 AND version = ?3",
            )
            .bind(resource_type)
            .bind(resource_id)
            .bind(*version)
            .execute(&mut *tx)
            .await
            .map_err(db_err("hard_delete"))?;
            deleted += result.rows_affected();
        }

        tx.commit().await.map_err(db_err("hard_delete"))?;

        Ok(HardDeleteOutcome {
            deleted,
            accepted: deleted as usize >= versions.len(),
        })
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("health_check"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn new_task(task_id: &str, task_type_id: i32, is_unique_task_by_type: bool) -> NewTask {
        NewTask {
            task_id: task_id.to_string(),
            queue_id: "Q1".to_string(),
            task_type_id,
            input_data: format!("input-{}", task_id),
            is_unique_task_by_type,
            max_retry_count: 3,
        }
    }

    /// Push a running task's heartbeat into the past.
    async fn age_heartbeat(pool: &SqlitePool, task_id: &str, by: chrono::Duration) {
        sqlx::query("UPDATE tasks SET heartbeat_at = ? WHERE task_id = ?")
            .bind(Utc::now() - by)
            .bind(task_id)
            .execute(pool)
            .await
            .expect("Failed to age heartbeat");
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let created = persistence
            .create_task(&new_task("T1", 5, true))
            .await
            .expect("Failed to create task");
        assert_eq!(created.status, TaskStatus::Queued);
        assert_eq!(created.retry_count, 0);
        assert!(created.run_id.is_none());

        let fetched = persistence
            .get_task("T1")
            .await
            .expect("Query should succeed")
            .expect("Task should exist");
        assert_eq!(fetched.task_id, "T1");
        assert_eq!(fetched.input_data, "input-T1");
        assert_eq!(fetched.task_type_id, 5);

        assert!(persistence.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence.create_task(&new_task("T1", 5, true)).await.unwrap();
        let err = persistence
            .create_task(&new_task("T1", 6, true))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateTask { task_id } if task_id == "T1"));
    }

    #[tokio::test]
    async fn test_type_exclusive_creation() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence.create_task(&new_task("T1", 5, false)).await.unwrap();
        let err = persistence
            .create_task(&new_task("T2", 5, false))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateTask { .. }));

        // A task that opts out of exclusivity is accepted alongside.
        persistence.create_task(&new_task("T3", 5, true)).await.unwrap();
        // Other types are unaffected.
        persistence.create_task(&new_task("T4", 6, false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_type_exclusivity_ends_when_task_terminates() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence.create_task(&new_task("T1", 5, false)).await.unwrap();
        let leased = persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let run_id = leased[0].run_id.clone().unwrap();
        assert!(
            persistence
                .complete_task("T1", &run_id, TaskStatus::Completed, Some("ok"))
                .await
                .unwrap()
        );

        persistence.create_task(&new_task("T2", 5, false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_task_rejected_before_store() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let err = persistence
            .create_task(&new_task("", 5, true))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_acquire_respects_concurrency_and_order() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool.clone());

        for id in ["T1", "T2", "T3"] {
            persistence.create_task(&new_task(id, 1, true)).await.unwrap();
        }
        age_heartbeat(&pool, "T3", chrono::Duration::seconds(5)).await;

        let leased = persistence
            .acquire_available_tasks("Q1", 2, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].task_id, "T3");
        assert!(leased.iter().all(|t| t.status == TaskStatus::Running));
        assert!(leased.iter().all(|t| t.run_id.is_some()));

        // Both slots are held by live leases.
        let again = persistence
            .acquire_available_tasks("Q1", 2, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(persistence.count_tasks("Q1", TaskStatus::Queued).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acquire_other_queue_is_isolated() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence.create_task(&new_task("T1", 1, true)).await.unwrap();

        let leased = persistence
            .acquire_available_tasks("Q2", 4, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(leased.is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed_with_new_run_id() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool.clone());
        persistence.create_task(&new_task("T1", 1, true)).await.unwrap();

        let first = persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let old_run = first[0].run_id.clone().unwrap();

        age_heartbeat(&pool, "T1", chrono::Duration::seconds(120)).await;

        let second = persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        let new_run = second[0].run_id.clone().unwrap();
        assert_ne!(old_run, new_run);
        assert_eq!(second[0].retry_count, 1);

        // The old holder lost its lease.
        let status = persistence.keep_alive("T1", &old_run, None).await.unwrap();
        assert!(!status.held);
        assert!(
            !persistence
                .complete_task("T1", &old_run, TaskStatus::Completed, None)
                .await
                .unwrap()
        );

        let status = persistence.keep_alive("T1", &new_run, None).await.unwrap();
        assert!(status.held);
    }

    #[tokio::test]
    async fn test_stale_lease_out_of_retries_is_failed() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool.clone());
        let task = NewTask {
            max_retry_count: 0,
            ..new_task("T1", 1, true)
        };
        persistence.create_task(&task).await.unwrap();

        persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        age_heartbeat(&pool, "T1", chrono::Duration::seconds(120)).await;

        let leased = persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(leased.is_empty());

        let task = persistence.get_task("T1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_deref(), Some(LEASE_EXPIRED_RESULT));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_persists_context_and_reports_cancel() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence.create_task(&new_task("T1", 1, true)).await.unwrap();
        let leased = persistence
            .acquire_available_tasks("Q1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let run_id = leased[0].run_id.clone().unwrap();

        let status = persistence
            .keep_alive("T1", &run_id, Some(r#"{"page":3}"#))
            .await
            .unwrap();
        assert_eq!(
            status,
            LeaseStatus {
                held: true,
                is_canceled: false
            }
        );

        // Context survives a heartbeat without one.
        persistence.keep_alive("T1", &run_id, None).await.unwrap();
        let task = persistence.get_task("T1").await.unwrap().unwrap();
        assert_eq!(task.task_context.as_deref(), Some(r#"{"page":3}"#));

        let canceled = persistence.cancel_task("T1").await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Running);
        assert!(canceled.is_canceled);

        let status = persistence.keep_alive("T1", &run_id, None).await.unwrap();
        assert!(status.held);
        assert!(status.is_canceled);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_is_immediate() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence.create_task(&new_task("T1", 1, true)).await.unwrap();

        let canceled = persistence.cancel_task("T1").await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(canceled.finished_at.is_some());

        let leased = persistence
            .acquire_available_tasks("Q1", 4, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(leased.is_empty());

        let err = persistence.cancel_task("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_complete_requires_terminal_status() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let err = persistence
            .complete_task("T1", "run", TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_reset_task() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence.create_task(&new_task("T1", 5, false)).await.unwrap();

        // Only failed or canceled tasks can be reset.
        let err = persistence.reset_task("T1").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));

        persistence.cancel_task("T1").await.unwrap();
        persistence.create_task(&new_task("T2", 5, false)).await.unwrap();

        // T2 now holds the type.
        let err = persistence.reset_task("T1").await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateTask { .. }));

        persistence.cancel_task("T2").await.unwrap();
        let reset = persistence.reset_task("T1").await.unwrap();
        assert_eq!(reset.status, TaskStatus::Queued);
        assert!(!reset.is_canceled);
        assert!(reset.finished_at.is_none());

        let err = persistence.reset_task("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_queries() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence.create_task(&new_task("T1", 1, true)).await.unwrap();
        persistence.create_task(&new_task("T2", 1, true)).await.unwrap();
        persistence.cancel_task("T1").await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let old = persistence
            .get_terminal_tasks_older_than(cutoff, 10)
            .await
            .unwrap();
        assert_eq!(old, vec!["T1".to_string()]);

        // Non-terminal ids are never deleted.
        let deleted = persistence
            .delete_tasks_batch(&["T1".to_string(), "T2".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(persistence.get_task("T2").await.unwrap().is_some());
        assert_eq!(persistence.delete_tasks_batch(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_token_upsert_refreshes_expiry() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let first = persistence
            .upsert_token("h1", "raw-token", Duration::from_secs(60))
            .await
            .unwrap();
        let second = persistence
            .upsert_token("h1", "raw-token", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.token, "raw-token");

        let fetched = persistence.get_token("h1").await.unwrap().unwrap();
        assert_eq!(fetched.token, "raw-token");
    }

    #[tokio::test]
    async fn test_expired_token_is_hidden_and_purged() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool.clone());
        persistence
            .upsert_token("h1", "raw-token", Duration::from_secs(60))
            .await
            .unwrap();

        sqlx::query("UPDATE continuation_tokens SET expires_at = ? WHERE id = 'h1'")
            .bind(Utc::now() - chrono::Duration::seconds(1))
            .execute(&pool)
            .await
            .unwrap();

        assert!(persistence.get_token("h1").await.unwrap().is_none());
        assert_eq!(persistence.purge_expired_tokens().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_exclusion_and_takeover() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool.clone());
        let lease = Duration::from_secs(30);

        assert!(persistence.try_acquire_lock("k", "A", lease).await.unwrap());
        assert!(!persistence.try_acquire_lock("k", "B", lease).await.unwrap());
        // Re-entrant for the same owner.
        assert!(persistence.try_acquire_lock("k", "A", lease).await.unwrap());
        assert!(persistence.renew_lock("k", "A", lease).await.unwrap());
        assert!(!persistence.renew_lock("k", "B", lease).await.unwrap());

        sqlx::query("UPDATE lease_locks SET expires_at = ? WHERE resource_key = 'k'")
            .bind(Utc::now() - chrono::Duration::seconds(1))
            .execute(&pool)
            .await
            .unwrap();

        // Expired lease can be taken over and can no longer be renewed.
        assert!(!persistence.renew_lock("k", "A", lease).await.unwrap());
        assert!(persistence.try_acquire_lock("k", "B", lease).await.unwrap());
        let lock = persistence.get_lock("k").await.unwrap().unwrap();
        assert_eq!(lock.lease_owner, "B");

        // Release by a non-owner is a no-op.
        assert!(!persistence.release_lock("k", "A").await.unwrap());
        assert!(persistence.release_lock("k", "B").await.unwrap());
        assert!(persistence.get_lock("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resource_versions_and_paging() {
        let persistence = SqlitePersistence::new(test_pool().await);

        for id in ["p1", "p2", "p3"] {
            persistence
                .save_resource_version("Patient", id, "{}")
                .await
                .unwrap();
        }
        let v2 = persistence
            .save_resource_version("Patient", "p1", r#"{"v":2}"#)
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert!(!v2.is_history);

        let versions = persistence
            .list_resource_versions("Patient", "p1")
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_history);

        let page = persistence
            .list_resource_ids("Patient", None, 2)
            .await
            .unwrap();
        assert_eq!(page.resource_ids, vec!["p1", "p2"]);
        let token = page.continuation_token.expect("more pages expected");

        let page = persistence
            .list_resource_ids("Patient", Some(&token), 2)
            .await
            .unwrap();
        assert_eq!(page.resource_ids, vec!["p3"]);
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_hard_delete_within_budget() {
        let persistence = SqlitePersistence::new(test_pool().await);
        for _ in 0..5 {
            persistence
                .save_resource_version("Patient", "p1", "{}")
                .await
                .unwrap();
        }

        let budget = HardDeleteBudget {
            max_operations: 2,
            max_duration: Duration::from_secs(5),
        };
        let outcome = persistence
            .hard_delete("Patient", "p1", budget)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            HardDeleteOutcome {
                deleted: 2,
                accepted: false
            }
        );

        // Current version is deleted last.
        let remaining = persistence
            .list_resource_versions("Patient", "p1")
            .await
            .unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().any(|v| !v.is_history));

        let outcome = persistence
            .hard_delete("Patient", "p1", HardDeleteBudget::default())
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.deleted, 3);

        // Nothing left is trivially accepted.
        let outcome = persistence
            .hard_delete("Patient", "p1", HardDeleteBudget::default())
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.deleted, 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let persistence = SqlitePersistence::new(test_pool().await);
        assert!(persistence.health_check_db().await.unwrap());
    }
}
