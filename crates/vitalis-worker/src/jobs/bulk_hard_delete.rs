// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk hard delete: remove every version of every resource of the given types.
//!
//! Input: `{"resourceTypes": ["Observation", "Patient"]}`.
//!
//! Each resource type is a cursor filter. Ids are paged with the store's
//! continuation token, which is kept in the job record as a vault handle.
//! While a resource is being deleted the cursor holds a sub-search naming it,
//! so a resumed run finishes that resource before relisting the page.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vitalis_core::error::CoreError;
use vitalis_core::persistence::HardDeleteBudget;
use vitalis_core::resources::hard_delete_resource;
use vitalis_core::retry::retry_transient;

use crate::orchestrator::{JobContext, JobError, JobHandler};

/// Task type id of bulk hard delete tasks.
pub const BULK_HARD_DELETE_TASK_TYPE: i32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkHardDeleteInput {
    resource_types: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Progress {
    deleted: u64,
}

/// Handler for [`BULK_HARD_DELETE_TASK_TYPE`].
#[derive(Debug, Clone)]
pub struct BulkHardDeleteJob {
    page_size: i64,
    budget: HardDeleteBudget,
}

impl Default for BulkHardDeleteJob {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkHardDeleteJob {
    /// Create a handler with 100 ids per page and the default delete budget.
    pub fn new() -> Self {
        Self {
            page_size: 100,
            budget: HardDeleteBudget::default(),
        }
    }

    /// Ids listed per page.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Budget of each hard delete invocation.
    pub fn with_budget(mut self, budget: HardDeleteBudget) -> Self {
        self.budget = budget;
        self
    }

    async fn purge(
        &self,
        ctx: &mut JobContext,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<u64, JobError> {
        let deleted = hard_delete_resource(
            ctx.persistence(),
            ctx.retry(),
            resource_type,
            resource_id,
            self.budget,
        )
        .await?;
        ctx.cursor_mut().clear_sub_search();
        ctx.report_cost(deleted.max(1) as f64);
        ctx.pace().await?;
        Ok(deleted)
    }

    /// Raw store token for the current page, or `None` to start over.
    async fn current_page_token(&self, ctx: &mut JobContext) -> Result<Option<String>, JobError> {
        let Some(handle) = ctx.cursor().continuation_token.clone() else {
            return Ok(None);
        };
        match ctx.tokens().decode(&handle).await? {
            Some(raw) => Ok(Some(raw)),
            None => {
                let cursor = ctx.cursor_mut();
                cursor.continuation_token = None;
                cursor.page = 0;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobHandler for BulkHardDeleteJob {
    fn task_type_id(&self) -> i32 {
        BULK_HARD_DELETE_TASK_TYPE
    }

    fn name(&self) -> &'static str {
        "bulk-hard-delete"
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<Option<String>, JobError> {
        let input: BulkHardDeleteInput = serde_json::from_str(ctx.input())
            .map_err(|e| JobError::Failed(format!("invalid input: {}", e)))?;
        if input.resource_types.is_empty() || input.resource_types.iter().any(|t| t.is_empty()) {
            return Err(JobError::Failed(
                "resourceTypes must list at least one non-empty type".to_string(),
            ));
        }

        // Null until the first checkpoint.
        let mut progress: Progress = match ctx.state() {
            serde_json::Value::Null => Progress::default(),
            state => serde_json::from_value(state.clone())
                .map_err(|e| JobError::Failed(format!("corrupt progress record: {}", e)))?,
        };

        let resume = ctx.cursor().resume_point();
        info!(
            task_id = %ctx.task().task_id,
            depth = resume.depth,
            filter = resume.filter.unwrap_or("-"),
            page = resume.page,
            triggering_resource_id = resume.triggering_resource_id.unwrap_or("-"),
            deleted = progress.deleted,
            "Starting bulk hard delete"
        );

        for resource_type in &input.resource_types {
            if ctx.cursor().is_filter_completed(resource_type) {
                debug!(resource_type = %resource_type, "Resource type already done");
                continue;
            }
            if ctx.cursor().current_filter.as_deref() != Some(resource_type.as_str()) {
                ctx.cursor_mut().set_filter(resource_type.clone())?;
            }

            // Innermost first: finish the resource a previous run was deleting.
            let interrupted = ctx
                .cursor()
                .sub_search
                .as_ref()
                .and_then(|sub| sub.triggering_resource_id.clone());
            if let Some(resource_id) = interrupted {
                info!(resource_type = %resource_type, resource_id = %resource_id, "Resuming interrupted delete");
                progress.deleted += self.purge(ctx, resource_type, &resource_id).await?;
            }

            loop {
                let raw_token = self.current_page_token(ctx).await?;
                let page = retry_transient(ctx.retry(), "list_resource_ids", || {
                    ctx.persistence().list_resource_ids(
                        resource_type,
                        raw_token.as_deref(),
                        self.page_size,
                    )
                })
                .await?;
                ctx.report_cost(1.0);

                for resource_id in &page.resource_ids {
                    ctx.cursor_mut().new_sub_search(resource_id.clone())?;
                    ctx.checkpoint().await?;
                    progress.deleted += self.purge(ctx, resource_type, resource_id).await?;
                }

                ctx.set_state(serde_json::to_value(&progress).map_err(CoreError::from)?);
                match page.continuation_token {
                    Some(next) => {
                        let handle = ctx.tokens().encode(&next).await?;
                        ctx.cursor_mut().update_continuation_token(handle)?;
                        ctx.checkpoint().await?;
                    }
                    None => {
                        ctx.cursor_mut().complete_current_filter()?;
                        ctx.checkpoint().await?;
                        info!(resource_type = %resource_type, deleted = progress.deleted, "Resource type done");
                        break;
                    }
                }
            }
        }

        let summary = serde_json::json!({
            "deleted": progress.deleted,
            "resourceTypes": input.resource_types,
        });
        Ok(Some(summary.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{JobRecord, TaskWorker, TaskWorkerConfig};
    use crate::token::PageTokenCodec;
    use serde_json::json;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use vitalis_core::persistence::Persistence;
    use vitalis_core::{
        ContinuationTokenVault, ProgressCursor, SqlitePersistence, TaskQueue, TaskStatus,
        ThrottleSettings,
    };

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        vitalis_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    struct Fixture {
        pool: SqlitePool,
        persistence: Arc<dyn Persistence>,
        queue: TaskQueue,
        worker: TaskWorker,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool.clone()));
        let queue = TaskQueue::new(persistence.clone());
        let config = TaskWorkerConfig {
            queue_id: "maintenance".to_string(),
            throttle: ThrottleSettings {
                target_percentage: Some(80),
                budget_per_second: 1000.0,
                base_delay_ms: 0,
            },
            ..TaskWorkerConfig::default()
        };
        let job = BulkHardDeleteJob::new()
            .with_page_size(2)
            .with_budget(HardDeleteBudget {
                max_operations: 2,
                max_duration: std::time::Duration::from_secs(5),
            });
        let worker = TaskWorker::builder(
            queue.clone(),
            PageTokenCodec::new(ContinuationTokenVault::new(persistence.clone())),
            config,
        )
        .handler(Arc::new(job))
        .build();
        Fixture {
            pool,
            persistence,
            queue,
            worker,
        }
    }

    async fn seed(persistence: &Arc<dyn Persistence>, resource_type: &str, ids: &[&str], versions: usize) {
        for id in ids {
            for v in 0..versions {
                persistence
                    .save_resource_version(resource_type, id, &format!("{{\"v\":{}}}", v))
                    .await
                    .unwrap();
            }
        }
    }

    async fn remaining(persistence: &Arc<dyn Persistence>, resource_type: &str) -> usize {
        persistence
            .list_resource_ids(resource_type, None, 1000)
            .await
            .unwrap()
            .resource_ids
            .len()
    }

    async fn store_record(pool: &SqlitePool, task_id: &str, record: &JobRecord) {
        sqlx::query("UPDATE tasks SET task_context = ?1 WHERE task_id = ?2")
            .bind(serde_json::to_string(record).unwrap())
            .bind(task_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deletes_every_version_of_listed_types() {
        let f = fixture().await;
        seed(&f.persistence, "Patient", &["p1", "p2", "p3"], 3).await;
        seed(&f.persistence, "Observation", &["o1", "o2", "o3", "o4", "o5"], 2).await;
        seed(&f.persistence, "Encounter", &["e1"], 1).await;

        let input = json!({ "resourceTypes": ["Patient", "Observation"] }).to_string();
        f.queue
            .create_task("bulk-1", "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, false, 3)
            .await
            .unwrap();
        assert_eq!(f.worker.run_once().await.unwrap(), 1);

        let task = f.queue.get_task("bulk-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result: serde_json::Value = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["deleted"], 19);

        assert_eq!(remaining(&f.persistence, "Patient").await, 0);
        assert_eq!(remaining(&f.persistence, "Observation").await, 0);
        assert_eq!(remaining(&f.persistence, "Encounter").await, 1);
        assert!(f.persistence.list_resource_versions("Patient", "p1").await.unwrap().is_empty());

        let record: JobRecord = serde_json::from_str(task.task_context.as_deref().unwrap()).unwrap();
        assert_eq!(record.cursor.completed_filters, vec!["Patient", "Observation"]);
        assert!(record.cursor.sub_search.is_none());
    }

    #[tokio::test]
    async fn test_resumes_interrupted_resource_and_skips_completed_types() {
        let f = fixture().await;
        seed(&f.persistence, "Patient", &["p1"], 1).await;
        seed(&f.persistence, "Observation", &["o1", "o2", "o3"], 4).await;

        let input = json!({ "resourceTypes": ["Patient", "Observation"] }).to_string();
        f.queue
            .create_task("bulk-1", "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, false, 3)
            .await
            .unwrap();

        // A previous run finished Patient and died while deleting o2.
        let mut cursor = ProgressCursor::new();
        cursor.set_filter("Patient").unwrap();
        cursor.set_filter("Observation").unwrap();
        cursor.new_sub_search("o2").unwrap();
        store_record(
            &f.pool,
            "bulk-1",
            &JobRecord {
                cursor,
                state: json!({ "deleted": 5 }),
            },
        )
        .await;

        f.worker.run_once().await.unwrap();

        let task = f.queue.get_task("bulk-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        // Patient was marked done, so p1 survives.
        assert_eq!(remaining(&f.persistence, "Patient").await, 1);
        assert_eq!(remaining(&f.persistence, "Observation").await, 0);
        let result: serde_json::Value = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["deleted"], 5 + 12);
    }

    #[tokio::test]
    async fn test_expired_page_token_restarts_the_type() {
        let f = fixture().await;
        seed(&f.persistence, "Observation", &["o1", "o2", "o3"], 1).await;

        let input = json!({ "resourceTypes": ["Observation"] }).to_string();
        f.queue
            .create_task("bulk-1", "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, false, 3)
            .await
            .unwrap();

        let mut cursor = ProgressCursor::new();
        cursor.set_filter("Observation").unwrap();
        cursor.update_continuation_token("expired-handle").unwrap();
        store_record(&f.pool, "bulk-1", &JobRecord { cursor, state: json!(null) }).await;

        f.worker.run_once().await.unwrap();

        assert_eq!(f.queue.get_task("bulk-1").await.unwrap().status, TaskStatus::Completed);
        assert_eq!(remaining(&f.persistence, "Observation").await, 0);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_task() {
        let f = fixture().await;
        for (task_id, input) in [
            ("bad-json", "not json".to_string()),
            ("no-types", json!({ "resourceTypes": [] }).to_string()),
        ] {
            f.queue
                .create_task(task_id, "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, true, 3)
                .await
                .unwrap();
        }

        f.worker.run_once().await.unwrap();

        for task_id in ["bad-json", "no-types"] {
            let task = f.queue.get_task(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed, "{}", task_id);
        }
    }

    #[tokio::test]
    async fn test_corrupt_progress_fails_without_deleting() {
        let f = fixture().await;
        seed(&f.persistence, "Observation", &["o1", "o2"], 1).await;

        let input = json!({ "resourceTypes": ["Observation"] }).to_string();
        f.queue
            .create_task("bulk-1", "maintenance", BULK_HARD_DELETE_TASK_TYPE, &input, false, 3)
            .await
            .unwrap();
        let mut cursor = ProgressCursor::new();
        cursor.set_filter("Observation").unwrap();
        store_record(
            &f.pool,
            "bulk-1",
            &JobRecord {
                cursor,
                state: json!({ "deleted": "many" }),
            },
        )
        .await;

        f.worker.run_once().await.unwrap();

        let task = f.queue.get_task("bulk-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result.as_deref().unwrap().contains("corrupt progress record"));
        assert_eq!(remaining(&f.persistence, "Observation").await, 2);
    }
}
