// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in job handlers.

pub mod bulk_hard_delete;

use std::sync::Arc;

pub use bulk_hard_delete::{BULK_HARD_DELETE_TASK_TYPE, BulkHardDeleteJob};

use crate::orchestrator::JobHandler;

/// Handlers every worker registers.
pub fn builtin_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![Arc::new(BulkHardDeleteJob::new())]
}
