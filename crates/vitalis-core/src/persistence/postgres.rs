// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Every write runs in a transaction with `lock_timeout` set locally, so a
//! unit that cannot get its row locks in time fails with `55P03` and surfaces
//! as [`CoreError::Throttled`]. Creation is serialized per task type and
//! acquisition per queue with transaction-scoped advisory locks. `NOW()` is
//! the only clock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::CoreError;
use crate::migrations::POSTGRES as MIGRATOR;

use super::{
    HardDeleteBudget, HardDeleteOutcome, LeaseLock, LeaseStatus, NewTask, Persistence,
    ResourcePage, ResourceVersionRecord, TaskRecord, TaskStatus, TokenVaultEntry,
    decode_resource_token, encode_resource_token,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LEASE_EXPIRED_RESULT: &str = "lease expired with no retries left";

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |e| CoreError::from_sqlx(operation, e)
}

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Bound how long a single atomic unit waits for row locks.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR.run(&self.pool).await.map_err(|e| CoreError::Storage {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
    }

    async fn begin(&self, operation: &'static str) -> Result<Transaction<'_, Postgres>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err(operation))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_err(operation))?;

        Ok(tx)
    }

    async fn advisory_lock(
        tx: &mut Transaction<'_, Postgres>,
        operation: &'static str,
        key: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(db_err(operation))?;
        Ok(())
    }
}

fn task_type_lock_key(task_type_id: i32) -> String {
    format!("vitalis.task_type:{}", task_type_id)
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    // ========================================================================
    // Task queue
    // ========================================================================

    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, CoreError> {
        task.validate()?;

        let mut tx = self.begin("create_task").await?;
        Self::advisory_lock(&mut tx, "create_task", &task_type_lock_key(task.task_type_id))
            .await?;

        let result = sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO tasks (
                task_id, queue_id, task_type_id, input_data, status,
                is_unique_task_by_type, retry_count, max_retry_count,
                heartbeat_at, created_at
            )
            SELECT $1, $2, $3, $4, 'queued', $5, 0, $6, NOW(), NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks
                WHERE task_id = $1
                   OR (NOT $5 AND task_type_id = $3 AND status IN ('queued', 'running'))
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
        .fetch_optional(&mut *tx)
        .await;

        let record = match result {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(CoreError::DuplicateTask {
                    task_id: task.task_id.clone(),
                });
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CoreError::DuplicateTask {
                    task_id: task.task_id.clone(),
                });
            }
            Err(e) => return Err(CoreError::from_sqlx("create_task", e)),
        };

        tx.commit().await.map_err(db_err("create_task"))?;
        Ok(record)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = $1")
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
        let timeout_secs = seconds(heartbeat_timeout);

        let mut tx = self.begin("acquire").await?;
        Self::advisory_lock(&mut tx, "acquire", &format!("vitalis.queue:{}", queue_id)).await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'canceled', finished_at = NOW(), heartbeat_at = NOW()
            WHERE queue_id = $1 AND status = 'queued' AND is_canceled
            "#,
        )
        .bind(queue_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN is_canceled THEN 'canceled' ELSE 'failed' END,
                result = CASE WHEN is_canceled THEN result ELSE $3 END,
                finished_at = NOW(),
                heartbeat_at = NOW()
            WHERE queue_id = $1
              AND status = 'running'
              AND heartbeat_at <= NOW() - make_interval(secs => $2)
              AND (is_canceled OR retry_count >= max_retry_count)
            "#,
        )
        .bind(queue_id)
        .bind(timeout_secs)
        .bind(LEASE_EXPIRED_RESULT)
        .execute(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        let (live,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE queue_id = $1
              AND status = 'running'
              AND heartbeat_at > NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(queue_id)
        .bind(timeout_secs)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        let limit = (max_concurrent - live).max(0);
        if limit == 0 {
            tx.commit().await.map_err(db_err("acquire"))?;
            return Ok(Vec::new());
        }

        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT task_id FROM tasks
            WHERE queue_id = $1
              AND (
                  status = 'queued'
                  OR (status = 'running' AND heartbeat_at <= NOW() - make_interval(secs => $2))
              )
            ORDER BY heartbeat_at ASC, created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue_id)
        .bind(timeout_secs)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        if candidates.is_empty() {
            tx.commit().await.map_err(db_err("acquire"))?;
            return Ok(Vec::new());
        }

        let mut leased = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET retry_count = retry_count + CASE WHEN status = 'running' THEN 1 ELSE 0 END,
                status = 'running',
                run_id = gen_random_uuid()::text,
                heartbeat_at = NOW(),
                started_at = COALESCE(started_at, NOW())
            WHERE task_id = ANY($1)
            RETURNING *
            "#,
        )
        .bind(&candidates)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("acquire"))?;

        tx.commit().await.map_err(db_err("acquire"))?;

        // RETURNING order is unspecified; restore the selection order.
        leased.sort_by_key(|task| {
            candidates
                .iter()
                .position(|id| id == &task.task_id)
                .unwrap_or(usize::MAX)
        });
        Ok(leased)
    }

    async fn keep_alive(
        &self,
        task_id: &str,
        run_id: &str,
        task_context: Option<&str>,
    ) -> Result<LeaseStatus, CoreError> {
        let mut tx = self.begin("keep_alive").await?;

        let is_canceled: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET heartbeat_at = NOW(), task_context = COALESCE($3, task_context)
            WHERE task_id = $1 AND run_id = $2 AND status = 'running'
            RETURNING is_canceled
            "#,
        )
        .bind(task_id)
        .bind(run_id)
        .bind(task_context)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("keep_alive"))?;

        tx.commit().await.map_err(db_err("keep_alive"))?;

        Ok(LeaseStatus {
            held: is_canceled.is_some(),
            is_canceled: is_canceled.unwrap_or(false),
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

        let mut tx = self.begin("complete_task").await?;
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3, result = $4, finished_at = NOW(), heartbeat_at = NOW()
            WHERE task_id = $1 AND run_id = $2 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(run_id)
        .bind(status.as_str())
        .bind(result)
        .execute(&mut *tx)
        .await
        .map_err(db_err("complete_task"))?;
        tx.commit().await.map_err(db_err("complete_task"))?;

        Ok(done.rows_affected() == 1)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let mut tx = self.begin("cancel_task").await?;
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET is_canceled = CASE WHEN status IN ('queued', 'running') THEN TRUE ELSE is_canceled END,
                finished_at = CASE WHEN status = 'queued' THEN NOW() ELSE finished_at END,
                status = CASE WHEN status = 'queued' THEN 'canceled' ELSE status END
            WHERE task_id = $1
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("cancel_task"))?;
        tx.commit().await.map_err(db_err("cancel_task"))?;

        record.ok_or_else(|| CoreError::not_found("task", task_id))
    }

    async fn reset_task(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let Some(existing) = self.get_task(task_id).await? else {
            return Err(CoreError::not_found("task", task_id));
        };

        let mut tx = self.begin("reset_task").await?;
        Self::advisory_lock(
            &mut tx,
            "reset_task",
            &task_type_lock_key(existing.task_type_id),
        )
        .await?;

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET status = 'queued',
                is_canceled = FALSE,
                retry_count = 0,
                run_id = NULL,
                result = NULL,
                finished_at = NULL,
                heartbeat_at = NOW()
            WHERE task_id = $1
              AND status IN ('failed', 'canceled')
              AND (
                  is_unique_task_by_type
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
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("reset_task"))?;

        if let Some(record) = record {
            tx.commit().await.map_err(db_err("reset_task"))?;
            return Ok(record);
        }

        // Diagnose under the same type lock so a concurrent reset cannot
        // change the answer.
        let current = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("reset_task"))?;
        tx.commit().await.map_err(db_err("reset_task"))?;

        match current {
            None => Err(CoreError::not_found("task", task_id)),
            Some(task) if !matches!(task.status, TaskStatus::Failed | TaskStatus::Canceled) => {
                Err(CoreError::invalid_argument(
                    "task_id",
                    format!(
                        "task is {}, only failed or canceled tasks can be reset",
                        task.status
                    ),
                ))
            }
            Some(_) => Err(CoreError::DuplicateTask {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn count_tasks(&self, queue_id: &str, status: TaskStatus) -> Result<i64, CoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE queue_id = $1 AND status = $2")
            .bind(queue_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count_tasks"))
    }

    async fn get_terminal_tasks_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        sqlx::query_scalar(
            r#"
            SELECT task_id FROM tasks
            WHERE status IN ('completed', 'failed', 'canceled')
              AND finished_at IS NOT NULL
              AND finished_at < $1
            ORDER BY finished_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get_terminal_tasks_older_than"))
    }

    async fn delete_tasks_batch(&self, task_ids: &[String]) -> Result<u64, CoreError> {
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin("delete_tasks_batch").await?;
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE task_id = ANY($1) AND status IN ('completed', 'failed', 'canceled')
            "#,
        )
        .bind(task_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete_tasks_batch"))?;
        tx.commit().await.map_err(db_err("delete_tasks_batch"))?;

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
        let mut tx = self.begin("upsert_token").await?;
        let entry = sqlx::query_as::<_, TokenVaultEntry>(
            r#"
            INSERT INTO continuation_tokens (id, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            RETURNING id, token, expires_at
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(seconds(ttl))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("upsert_token"))?;
        tx.commit().await.map_err(db_err("upsert_token"))?;

        Ok(entry)
    }

    async fn get_token(&self, id: &str) -> Result<Option<TokenVaultEntry>, CoreError> {
        sqlx::query_as::<_, TokenVaultEntry>(
            r#"
            SELECT id, token, expires_at FROM continuation_tokens
            WHERE id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_token"))
    }

    async fn purge_expired_tokens(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM continuation_tokens WHERE expires_at <= NOW()")
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
        let mut tx = self.begin("try_acquire_lock").await?;
        let result = sqlx::query(
            r#"
            INSERT INTO lease_locks (resource_key, lease_owner, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (resource_key) DO UPDATE
            SET lease_owner = EXCLUDED.lease_owner,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE lease_locks.expires_at <= NOW()
               OR lease_locks.lease_owner = EXCLUDED.lease_owner
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(seconds(lease))
        .execute(&mut *tx)
        .await
        .map_err(db_err("try_acquire_lock"))?;
        tx.commit().await.map_err(db_err("try_acquire_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lock(
        &self,
        resource_key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, CoreError> {
        let mut tx = self.begin("renew_lock").await?;
        let result = sqlx::query(
            r#"
            UPDATE lease_locks SET expires_at = NOW() + make_interval(secs => $3)
            WHERE resource_key = $1 AND lease_owner = $2 AND expires_at > NOW()
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(seconds(lease))
        .execute(&mut *tx)
        .await
        .map_err(db_err("renew_lock"))?;
        tx.commit().await.map_err(db_err("renew_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, resource_key: &str, owner: &str) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM lease_locks WHERE resource_key = $1 AND lease_owner = $2")
                .bind(resource_key)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(db_err("release_lock"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, resource_key: &str) -> Result<Option<LeaseLock>, CoreError> {
        sqlx::query_as::<_, LeaseLock>(
            r#"
            SELECT resource_key, lease_owner, acquired_at, expires_at
            FROM lease_locks WHERE resource_key = $1
            "#,
        )
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_lock"))
    }

    async fn purge_expired_locks(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM lease_locks WHERE expires_at <= NOW()")
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
        let mut tx = self.begin("save_resource_version").await?;
        Self::advisory_lock(
            &mut tx,
            "save_resource_version",
            &format!("vitalis.resource:{}/{}", resource_type, resource_id),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE resources SET is_history = TRUE
            WHERE resource_type = $1 AND resource_id = $2 AND NOT is_history
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("save_resource_version"))?;

        let record = sqlx::query_as::<_, ResourceVersionRecord>(
            r#"
            INSERT INTO resources (resource_type, resource_id, version, is_history, payload)
            SELECT $1, $2, COALESCE(MAX(version), 0) + 1, FALSE, $3
            FROM resources
            WHERE resource_type = $1 AND resource_id = $2
            RETURNING resource_type, resource_id, version, is_history, payload
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
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
            WHERE resource_type = $1 AND resource_id = $2
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

        let mut resource_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT resource_id FROM resources
            WHERE resource_type = $1
              AND NOT is_history
              AND ($2::text IS NULL OR resource_id > $2)
            ORDER BY resource_id ASC
            LIMIT $3
            "#,
        )
        .bind(resource_type)
        .bind(after)
        .bind(page_size + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_resource_ids"))?;

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
        let mut tx = self.begin("hard_delete").await?;

        let versions: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT version FROM resources
            WHERE resource_type = $1 AND resource_id = $2
            ORDER BY is_history DESC, version ASC
            FOR UPDATE
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("hard_delete"))?;

        let mut deleted = 0u64;
        for version in &versions {
            // At least one delete per invocation so callers always make progress.
            let out_of_time = deleted > 0 && started.elapsed() >= budget.max_duration;
            if deleted >= u64::from(budget.max_operations) || out_of_time {
                break;
            }
            let result = sqlx::query(
                "DELETE FROM resources WHERE resource_type = $1 AND resource_id = $2 AND version = $3",
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
