// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vitalis Worker - Job Orchestration
//!
//! This crate runs long jobs on top of `vitalis-core`. Any number of worker
//! processes may point at the same store; they coordinate only through the
//! core's atomic operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      vitalis-worker                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐              │
//! │  │   Schema    │  │    Task     │  │   Cleanup   │              │
//! │  │   Upgrade   │  │   Worker    │  │   Worker    │              │
//! │  └─────────────┘  └─────────────┘  └─────────────┘              │
//! │        │                │ spawns per lease                      │
//! │        │                ▼                                       │
//! │        │      JobHandler + JobContext + keep-alive              │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                │                  │
//!          ▼                ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        vitalis-core                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! 1. The task worker leases tasks with `acquire_available_tasks`.
//! 2. A keep-alive runs every heartbeat interval while the handler executes.
//! 3. The handler checkpoints its cursor at page boundaries.
//! 4. The outcome is recorded with `complete_task`, unless the lease was lost.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

#![deny(missing_docs)]

/// Cleanup of expired vault entries, expired locks and old tasks.
pub mod cleanup_worker;

/// Configuration loading from environment variables.
pub mod config;

/// Database connection and schema bootstrap.
pub mod db;

/// Error types.
pub mod error;

/// Built-in job handlers.
pub mod jobs;

/// Task worker, job handler trait and job context.
pub mod orchestrator;

/// Embeddable runtime.
pub mod runtime;

/// Vault-backed page tokens.
pub mod token;

/// Schema upgrade under the `schema-upgrade` lock.
pub mod upgrade;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{JobContext, JobError, JobHandler, JobRecord, TaskWorker};
pub use runtime::WorkerRuntime;
