// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for vitalis-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use uuid::Uuid;

use vitalis_core::migrations;
use vitalis_core::{Persistence, PostgresPersistence, SqlitePersistence};

/// Skip the current test when no PostgreSQL test database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Connect to TEST_DATABASE_URL and apply migrations.
pub async fn postgres_persistence() -> Option<Arc<dyn Persistence>> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(Arc::new(PostgresPersistence::new(pool)))
}

/// File-backed SQLite with several connections, so writers really contend.
///
/// The returned directory must outlive the persistence.
pub async fn file_sqlite() -> (TempDir, Arc<dyn Persistence>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("vitalis.db").display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to open SQLite database");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    (dir, Arc::new(SqlitePersistence::new(pool)))
}

/// Id unique across test runs sharing one database.
pub fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Task type unlikely to collide with other tests sharing one database.
pub fn unique_task_type() -> i32 {
    (Uuid::new_v4().as_u128() % 1_000_000_000) as i32 + 1000
}
