// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable, hierarchical progress cursor for long-running jobs.
//!
//! A job enumerates a sequence of filters (stages). Within a filter it pages
//! through results with a store continuation token. For each item on a page it
//! may fan out into a nested enumeration (a sub-search), tracked by a nested
//! cursor of the same shape:
//!
//! ```text
//! ProgressCursor { filter: "Patient", page: 3, token: "t3" }
//!   └── sub_search: ProgressCursor { trigger: "Patient/42", filter: "Observation?subject=Patient/42", page: 1 }
//! ```
//!
//! Rules:
//! - a filter in `completed_filters` is never re-entered,
//! - a sub-search must be drained (cleared) before its parent advances a page,
//! - on resume, the innermost active cursor is resumed first.
//!
//! The whole tree is serialized into the owning job record after every page
//! boundary, so a crash loses at most one page of work.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Resumable position within a (possibly nested) enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCursor {
    /// Store continuation token, or a vault handle standing in for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    /// Pages completed within the current filter.
    #[serde(default)]
    pub page: u64,
    /// Filter currently being enumerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_filter: Option<String>,
    /// Finished filters, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_filters: Vec<String>,
    /// Item of the parent enumeration that spawned this cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_resource_id: Option<String>,
    /// Active nested enumeration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_search: Option<Box<ProgressCursor>>,
}

/// Where to pick up an interrupted enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint<'a> {
    /// Nesting depth of the cursor to resume (0 = outermost).
    pub depth: usize,
    /// Filter to resume.
    pub filter: Option<&'a str>,
    /// Token to continue from; `None` restarts the filter's first page.
    pub continuation_token: Option<&'a str>,
    /// Pages already completed in this filter.
    pub page: u64,
    /// Parent item for nested cursors.
    pub triggering_resource_id: Option<&'a str>,
}

impl ProgressCursor {
    /// Create an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start enumerating `new_filter`, archiving the current one.
    pub fn set_filter(&mut self, new_filter: impl Into<String>) -> Result<()> {
        let new_filter = new_filter.into();
        if new_filter.is_empty() {
            return Err(CoreError::invalid_argument(
                "filter",
                "must not be empty",
            ));
        }
        if self.is_filter_completed(&new_filter) {
            return Err(CoreError::invalid_argument(
                "filter",
                format!("'{}' has already been completed", new_filter),
            ));
        }
        if self.sub_search.is_some() {
            return Err(CoreError::invalid_argument(
                "filter",
                "cannot change filter while a sub-search is active",
            ));
        }

        self.archive_current_filter();
        self.current_filter = Some(new_filter);
        Ok(())
    }

    /// Archive the current filter without starting another one.
    pub fn complete_current_filter(&mut self) -> Result<()> {
        if self.sub_search.is_some() {
            return Err(CoreError::invalid_argument(
                "filter",
                "cannot complete filter while a sub-search is active",
            ));
        }
        self.archive_current_filter();
        Ok(())
    }

    /// Record the token for the next page and advance the page counter.
    pub fn update_continuation_token(&mut self, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        if token.is_empty() {
            return Err(CoreError::invalid_argument(
                "continuation_token",
                "must not be empty",
            ));
        }
        if self.sub_search.is_some() {
            return Err(CoreError::invalid_argument(
                "continuation_token",
                "sub-search must be drained before advancing",
            ));
        }

        self.continuation_token = Some(token);
        self.page += 1;
        Ok(())
    }

    /// Start a nested enumeration for `triggering_resource_id`, replacing any existing one.
    pub fn new_sub_search(
        &mut self,
        triggering_resource_id: impl Into<String>,
    ) -> Result<&mut ProgressCursor> {
        let trigger = triggering_resource_id.into();
        if trigger.is_empty() {
            return Err(CoreError::invalid_argument(
                "triggering_resource_id",
                "must not be empty",
            ));
        }

        let nested = self.sub_search.insert(Box::new(ProgressCursor {
            triggering_resource_id: Some(trigger),
            ..ProgressCursor::default()
        }));
        Ok(nested.as_mut())
    }

    /// Drop the drained nested enumeration.
    pub fn clear_sub_search(&mut self) {
        self.sub_search = None;
    }

    /// Whether `filter` has been archived.
    pub fn is_filter_completed(&self, filter: &str) -> bool {
        self.completed_filters.iter().any(|f| f == filter)
    }

    /// Nesting depth below this cursor (0 when there is no sub-search).
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self;
        while let Some(nested) = cursor.sub_search.as_deref() {
            depth += 1;
            cursor = nested;
        }
        depth
    }

    /// Innermost active cursor.
    pub fn innermost(&self) -> &ProgressCursor {
        let mut cursor = self;
        while let Some(nested) = cursor.sub_search.as_deref() {
            cursor = nested;
        }
        cursor
    }

    /// Mutable access to the innermost active cursor.
    pub fn innermost_mut(&mut self) -> &mut ProgressCursor {
        match self.sub_search {
            Some(ref mut nested) => nested.innermost_mut(),
            None => self,
        }
    }

    /// Position to resume from: sub-searches resume before their parents.
    pub fn resume_point(&self) -> ResumePoint<'_> {
        let depth = self.depth();
        let cursor = self.innermost();
        ResumePoint {
            depth,
            filter: cursor.current_filter.as_deref(),
            continuation_token: cursor.continuation_token.as_deref(),
            page: cursor.page,
            triggering_resource_id: cursor.triggering_resource_id.as_deref(),
        }
    }

    /// Serialize the whole tree for the job record.
    pub fn to_snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore a cursor from [`to_snapshot`](Self::to_snapshot) output.
    pub fn from_snapshot(snapshot: &str) -> Result<Self> {
        Ok(serde_json::from_str(snapshot)?)
    }

    fn archive_current_filter(&mut self) {
        if let Some(done) = self.current_filter.take()
            && !self.is_filter_completed(&done)
        {
            self.completed_filters.push(done);
        }
        self.page = 0;
        self.continuation_token = None;
    }
}
