// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded hard delete of resource versions.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::persistence::{HardDeleteBudget, Persistence};
use crate::retry::{RetryPolicy, retry_throttled};

/// Delete every version of a resource, re-invoking the bounded store
/// operation until it reports the match set empty.
///
/// Each invocation deletes at most `budget.max_operations` documents. Returns
/// the total number of documents deleted; an already-deleted resource yields 0.
pub async fn hard_delete_resource(
    persistence: &Arc<dyn Persistence>,
    retry: &RetryPolicy,
    resource_type: &str,
    resource_id: &str,
    budget: HardDeleteBudget,
) -> Result<u64> {
    if resource_type.is_empty() || resource_id.is_empty() {
        return Err(CoreError::invalid_argument(
            "resource",
            "resource type and id must not be empty",
        ));
    }
    if budget.max_operations == 0 || budget.max_duration.is_zero() {
        return Err(CoreError::invalid_argument(
            "budget",
            "hard delete budget must allow at least one operation",
        ));
    }

    let mut total = 0u64;
    let mut invocations = 0u32;
    loop {
        let outcome = retry_throttled(retry, "hard_delete", || {
            persistence.hard_delete(resource_type, resource_id, budget)
        })
        .await?;
        invocations += 1;
        total += outcome.deleted;

        if outcome.accepted {
            break;
        }
        debug!(
            resource_type,
            resource_id,
            deleted = outcome.deleted,
            "Hard delete budget exhausted, re-invoking"
        );
    }

    if total > 0 {
        info!(resource_type, resource_id, total, invocations, "Resource hard deleted");
    }
    Ok(total)
}
