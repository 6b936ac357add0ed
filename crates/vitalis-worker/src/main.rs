// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vitalis Worker
//!
//! Leases tasks from a queue and runs them:
//! - schema upgrade under a distributed lock at startup
//! - bulk hard delete and other registered jobs
//! - periodic cleanup of expired tokens, locks and old tasks

use tracing::{info, warn};

use vitalis_worker::config::Config;
use vitalis_worker::db::DatabasePool;
use vitalis_worker::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitalis_worker=info,vitalis_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        queue_id = %config.queue_id,
        max_concurrent_tasks = config.max_concurrent_tasks,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "Starting Vitalis Worker"
    );

    let max_connections = (config.max_concurrent_tasks as u32).saturating_mul(2).max(5);
    let db = DatabasePool::connect(&config.database_url, max_connections).await?;
    let persistence = db.persistence(std::time::Duration::from_secs(5));

    let runtime = WorkerRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .database(db)
        .build()?
        .start()
        .await?;

    info!("Vitalis Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Vitalis Worker shut down");

    Ok(())
}
