// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database connection for vitalis-worker.
//!
//! The worker runs against PostgreSQL in production and SQLite for
//! single-node deployments and tests. The backend is chosen from the URL
//! scheme.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};
use tracing::info;
use vitalis_core::migrations;
use vitalis_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};

use crate::error::{Error, Result};

/// The lock table has to exist before the `schema-upgrade` mutex can be
/// taken, so it is created outside the migrator.
const POSTGRES_LOCK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lease_locks (
    resource_key  TEXT PRIMARY KEY,
    lease_owner   TEXT NOT NULL,
    acquired_at   TIMESTAMPTZ NOT NULL,
    expires_at    TIMESTAMPTZ NOT NULL
);
"#;

const SQLITE_LOCK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lease_locks (
    resource_key  TEXT PRIMARY KEY NOT NULL,
    lease_owner   TEXT NOT NULL,
    acquired_at   DATETIME NOT NULL,
    expires_at    DATETIME NOT NULL
);
"#;

/// Connection pool for one of the supported backends.
#[derive(Debug, Clone)]
pub enum DatabasePool {
    /// PostgreSQL pool.
    Postgres(PgPool),
    /// SQLite pool.
    Sqlite(SqlitePool),
}

impl DatabasePool {
    /// Connect using a `postgres://` or `sqlite:` URL.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await?;
            info!("Connected to PostgreSQL");
            Ok(Self::Postgres(pool))
        } else if database_url.starts_with("sqlite:") {
            let url = if database_url.contains('?') || database_url.contains(":memory:") {
                database_url.to_string()
            } else {
                format!("{}?mode=rwc", database_url)
            };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(&url)
                .await?;
            info!("Connected to SQLite");
            Ok(Self::Sqlite(pool))
        } else {
            Err(Error::UnsupportedDatabase(redact(database_url)))
        }
    }

    /// Backend name for logging.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite(_) => "sqlite",
        }
    }

    /// Create the lock table if it is missing.
    pub async fn bootstrap(&self) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::raw_sql(POSTGRES_LOCK_TABLE).execute(pool).await?;
            }
            Self::Sqlite(pool) => {
                sqlx::raw_sql(SQLITE_LOCK_TABLE).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Apply pending migrations. Callers serialize this with the
    /// `schema-upgrade` mutex (see [`crate::upgrade`]).
    pub async fn migrate(&self) -> Result<()> {
        match self {
            Self::Postgres(pool) => migrations::run_postgres(pool).await?,
            Self::Sqlite(pool) => migrations::run_sqlite(pool).await?,
        }
        Ok(())
    }

    /// Persistence backend over this pool.
    pub fn persistence(&self, lock_timeout: Duration) -> Arc<dyn Persistence> {
        match self {
            Self::Postgres(pool) => {
                Arc::new(PostgresPersistence::new(pool.clone()).with_lock_timeout(lock_timeout))
            }
            Self::Sqlite(pool) => Arc::new(SqlitePersistence::new(pool.clone())),
        }
    }

    /// Close all connections.
    pub async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Keep the scheme, drop credentials and host details.
fn redact(database_url: &str) -> String {
    match database_url.split_once("://") {
        Some((scheme, _)) => format!("{}://…", scheme),
        None => "<unrecognized>".to_string(),
    }
}
