// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vitalis-core.
//!
//! Every operation in this crate returns [`CoreError`]. The variants follow the
//! retry policy of the engine: [`CoreError::Throttled`] and
//! [`CoreError::TransientStoreFailure`] are safe to retry with identical
//! arguments, everything else is surfaced to the caller unchanged.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while coordinating long-running operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// Malformed caller input. Never retried automatically.
    InvalidArgument {
        /// The argument that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A task with the same id, or an active task of the same exclusive type, exists.
    DuplicateTask {
        /// The task ID that was rejected.
        task_id: String,
    },

    /// The store ran out of its execution budget before the atomic unit finished.
    Throttled {
        /// The operation that was not accepted.
        operation: String,
    },

    /// A distributed lock could not be acquired within the allotted time.
    LockTimeout {
        /// The contended lock.
        resource_key: String,
        /// How long the caller waited.
        timeout_ms: u64,
    },

    /// A held lock's lease lapsed or was taken over before the guarded work finished.
    LockLost {
        /// The lock that was lost.
        resource_key: String,
    },

    /// The requested entity is absent (or, for vault entries, expired).
    NotFound {
        /// Kind of entity (task, token, resource).
        kind: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// Network or availability failure talking to the store.
    TransientStoreFailure {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Persisted JSON could not be encoded or decoded.
    Serialization(String),

    /// Non-retryable store failure (constraint, schema, driver errors).
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::InvalidArgument`].
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::DuplicateTask { .. } => "DUPLICATE_TASK",
            Self::Throttled { .. } => "THROTTLED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::TransientStoreFailure { .. } => "TRANSIENT_STORE_FAILURE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// Whether the identical call may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::TransientStoreFailure { .. }
        )
    }

    /// Classify a driver error raised while running `operation`.
    ///
    /// Lock timeouts, serialization failures, deadlocks and SQLite busy/locked
    /// results mean the atomic unit did not finish within its budget and map
    /// to [`CoreError::Throttled`].
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let throttled = matches!(
                    db.code().as_deref(),
                    // PostgreSQL: serialization_failure, deadlock_detected,
                    // lock_not_available, query_canceled (statement_timeout)
                    Some("40001" | "40P01" | "55P03" | "57014")
                    // SQLite: BUSY, LOCKED and their extended codes
                    | Some("5" | "6" | "261" | "262" | "517" | "773")
                );
                if throttled {
                    Self::Throttled {
                        operation: operation.to_string(),
                    }
                } else {
                    Self::Storage {
                        operation: operation.to_string(),
                        details: err.to_string(),
                    }
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::TransientStoreFailure {
                operation: operation.to_string(),
                details: err.to_string(),
            },
            _ => Self::Storage {
                operation: operation.to_string(),
                details: err.to_string(),
            },
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { field, message } => {
                write!(f, "Invalid argument '{}': {}", field, message)
            }
            Self::DuplicateTask { task_id } => {
                write!(f, "Task '{}' conflicts with an existing task", task_id)
            }
            Self::Throttled { operation } => {
                write!(
                    f,
                    "Store did not accept '{}' within its execution budget",
                    operation
                )
            }
            Self::LockTimeout {
                resource_key,
                timeout_ms,
            } => {
                write!(
                    f,
                    "Timed out after {}ms waiting for lock '{}'",
                    timeout_ms, resource_key
                )
            }
            Self::LockLost { resource_key } => {
                write!(f, "Lease on lock '{}' was lost while held", resource_key)
            }
            Self::NotFound { kind, id } => write!(f, "{} '{}' not found", kind, id),
            Self::TransientStoreFailure { operation, details } => {
                write!(
                    f,
                    "Transient store failure during '{}': {}",
                    operation, details
                )
            }
            Self::Serialization(details) => write!(f, "Serialization error: {}", details),
            Self::Storage { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::from_sqlx("query", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
