// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vitalis-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core engine operation failed.
    #[error("Core error: {0}")]
    Core(#[from] vitalis_core::error::CoreError),

    /// Unsupported database URL.
    #[error("Unsupported database URL: {0}")]
    UnsupportedDatabase(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the worker Error.
pub type Result<T> = std::result::Result<T, Error>;
