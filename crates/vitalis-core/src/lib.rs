// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vitalis Core - Long-Running Operation Engine
//!
//! This crate provides the coordination primitives that let a fleet of
//! stateless workers run long, resumable jobs (bulk hard delete, reindexing,
//! exports) against a shared clinical data store. There is no central
//! coordinator: every cross-worker decision is a single atomic operation
//! against the store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   API / admin callers    │        │     vitalis-worker(s)    │
//! │   create / cancel tasks  │        │  lease, run, heartbeat   │
//! └──────────────────────────┘        └──────────────────────────┘
//!               │                                   │
//!               ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         vitalis-core                            │
//! │  TaskQueue  ProgressCursor  Throttle  TokenVault  Mutex         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              PostgreSQL or SQLite (shared store)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Task Status State Machine
//!
//! ```text
//!            create            acquire
//!   (none) ─────────► queued ───────────► running ──┬──► completed
//!                       │  ▲                 │      ├──► failed
//!               cancel  │  │ reset           │      └──► canceled
//!                       ▼  │                 │
//!                    canceled / failed ◄─────┘ stale lease, no retries left
//! ```
//!
//! A `running` task whose heartbeat is older than the heartbeat timeout is
//! stale and is leased again with a new `run_id`.
//!
//! # Atomic Operations
//!
//! | Operation | Unit |
//! |-----------|------|
//! | `create_task` | insert-if-absent (id, and type when exclusive) |
//! | `acquire_available_tasks` | count live leases, lease queued or stale rows |
//! | `keep_alive` / `complete_task` | update guarded by `run_id` |
//! | vault `save` | upsert by content hash |
//! | mutex `acquire` | insert or take over an expired lease |
//! | `hard_delete` | bounded delete, re-invoked until accepted |
//!
//! When a unit runs out of its execution budget the store returns
//! [`error::CoreError::Throttled`]; the call is repeated with identical
//! arguments.

#![deny(missing_docs)]

/// Progress cursor for resumable, hierarchical enumerations.
pub mod cursor;

/// Error types shared by all components.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Lease-bound distributed mutex.
pub mod mutex;

/// Persistence trait and PostgreSQL/SQLite backends.
pub mod persistence;

/// Durable task queue with heartbeat leases.
pub mod queue;

/// Bounded hard delete of resource versions.
pub mod resources;

/// Call-site retry for throttled operations.
pub mod retry;

/// Adaptive throttle controller.
pub mod throttle;

/// Continuation token vault.
pub mod vault;

pub use cursor::{ProgressCursor, ResumePoint};
pub use error::{CoreError, Result};
pub use mutex::{DistributedMutex, LeaseGuard};
pub use persistence::{
    LeaseStatus, Persistence, PostgresPersistence, SqlitePersistence, TaskRecord, TaskStatus,
};
pub use queue::TaskQueue;
pub use throttle::{SharedThrottle, ThrottleController, ThrottleMetric, ThrottleSettings};
pub use vault::ContinuationTokenVault;
