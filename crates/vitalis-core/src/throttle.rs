// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adaptive throttle for jobs that share a rate-limited store.
//!
//! A job reports the resource cost of every unit of work it performs. The
//! controller extrapolates the recent average cost to a per-second rate using
//! the job's current pacing (`base + throttle` delay) and nudges the extra
//! delay up when the rate exceeds the job's share of the budget, and down when
//! it falls below a hysteresis band under the target:
//!
//! ```text
//! rate = mean(window) * 1000 / (base_delay_ms + throttle_delay_ms)
//!
//! rate > target                     -> throttle += increase_step (<= ceiling)
//! rate < target * lower_band_ratio  -> throttle -= decrease_step (>= 0)
//! otherwise                         -> unchanged
//! ```
//!
//! The arithmetic lives in [`next_delay`], which has no side effects. The
//! controller never fails: out-of-range inputs are clamped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Per-job throttle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// Share of the store budget this job may consume (0-100). `None` disables throttling.
    pub target_percentage: Option<u8>,
    /// Total store budget in resource units per second.
    pub budget_per_second: f64,
    /// Pacing interval the job uses between units of work without throttling.
    pub base_delay_ms: u64,
}

impl ThrottleSettings {
    /// Target consumption in resource units per second, if throttling is enabled.
    pub fn target_rate(&self) -> Option<f64> {
        let percentage = f64::from(self.target_percentage?.min(100));
        let budget = if self.budget_per_second.is_finite() {
            self.budget_per_second.max(0.0)
        } else {
            0.0
        };
        Some(budget * percentage / 100.0)
    }
}

/// Step sizes and bounds of the control loop.
///
/// The defaults were tuned empirically; deployments may override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleTuning {
    /// Delay added when over target. `None` uses the base delay.
    pub increase_step_ms: Option<u64>,
    /// Delay removed when under the lower band. `None` uses the base delay.
    pub decrease_step_ms: Option<u64>,
    /// Ceiling for the throttle delay. `None` uses `max(20 * base, 1000)`.
    pub max_throttle_delay_ms: Option<u64>,
    /// Lower edge of the hysteresis band as a fraction of the target.
    pub lower_band_ratio: f64,
    /// Number of samples averaged per decision.
    pub window_size: usize,
}

impl Default for ThrottleTuning {
    fn default() -> Self {
        Self {
            increase_step_ms: None,
            decrease_step_ms: None,
            max_throttle_delay_ms: None,
            lower_band_ratio: 0.75,
            window_size: 5,
        }
    }
}

impl ThrottleTuning {
    fn increase_step(&self, base_delay_ms: u64) -> u64 {
        self.increase_step_ms.unwrap_or(base_delay_ms).max(1)
    }

    fn decrease_step(&self, base_delay_ms: u64) -> u64 {
        self.decrease_step_ms.unwrap_or(base_delay_ms).max(1)
    }

    fn ceiling(&self, base_delay_ms: u64) -> u64 {
        self.max_throttle_delay_ms
            .unwrap_or_else(|| base_delay_ms.saturating_mul(20).max(1000))
    }

    fn band_ratio(&self) -> f64 {
        if self.lower_band_ratio.is_finite() {
            self.lower_band_ratio.clamp(0.0, 1.0)
        } else {
            0.75
        }
    }
}

/// Resource cost reported by the data-access layer after a remote operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleMetric {
    /// Units consumed by the operation.
    pub resource_cost: f64,
}

impl ThrottleMetric {
    /// Create a metric for `resource_cost` units.
    pub fn new(resource_cost: f64) -> Self {
        Self { resource_cost }
    }
}

/// Snapshot of a controller's variables, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Configured target share, `None` when disabled.
    pub target_consumption_percentage: Option<u8>,
    /// Pacing interval without throttling.
    pub base_delay_ms: u64,
    /// Extra delay currently injected.
    pub throttle_delay_ms: u64,
    /// Recent samples, oldest first.
    pub recent_samples: Vec<f64>,
}

/// Compute the throttle delay following a decision over `average_cost`.
pub fn next_delay(
    current_delay_ms: u64,
    average_cost: f64,
    settings: &ThrottleSettings,
    tuning: &ThrottleTuning,
) -> u64 {
    let Some(target) = settings.target_rate() else {
        return 0;
    };

    let base = settings.base_delay_ms;
    let ceiling = tuning.ceiling(base);
    let current = current_delay_ms.min(ceiling);
    let interval_ms = base.saturating_add(current).max(1) as f64;
    let cost = if average_cost.is_finite() {
        average_cost.max(0.0)
    } else {
        0.0
    };
    let rate = cost * 1000.0 / interval_ms;

    if rate > target {
        current.saturating_add(tuning.increase_step(base)).min(ceiling)
    } else if rate < target * tuning.band_ratio() {
        current.saturating_sub(tuning.decrease_step(base))
    } else {
        current
    }
}

/// Feedback controller owned by a single job.
#[derive(Debug, Clone, Default)]
pub struct ThrottleController {
    settings: Option<ThrottleSettings>,
    tuning: ThrottleTuning,
    window: VecDeque<f64>,
    throttle_delay_ms: u64,
}

impl ThrottleController {
    /// Create an uninitialized controller; it applies no delay until [`initialize`](Self::initialize).
    pub fn new(tuning: ThrottleTuning) -> Self {
        Self {
            settings: None,
            tuning,
            window: VecDeque::new(),
            throttle_delay_ms: 0,
        }
    }

    /// Bind the controller to a job's settings, resetting its state.
    pub fn initialize(&mut self, settings: ThrottleSettings) {
        self.settings = Some(settings);
        self.window.clear();
        self.throttle_delay_ms = 0;
    }

    /// Whether the controller was initialized with a target.
    pub fn is_enabled(&self) -> bool {
        self.settings
            .as_ref()
            .is_some_and(|s| s.target_percentage.is_some())
    }

    /// Feed one consumption sample and return the new throttle delay.
    pub fn handle(&mut self, metric: ThrottleMetric) -> u64 {
        let Some(settings) = self.settings.as_ref().filter(|s| s.target_percentage.is_some())
        else {
            return 0;
        };

        let sample = if metric.resource_cost.is_finite() {
            metric.resource_cost.max(0.0)
        } else {
            0.0
        };
        self.window.push_back(sample);
        while self.window.len() > self.tuning.window_size.max(1) {
            self.window.pop_front();
        }

        let average = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.throttle_delay_ms = next_delay(self.throttle_delay_ms, average, settings, &self.tuning);
        self.throttle_delay_ms
    }

    /// Extra delay to inject before the next unit of work. 0 before initialization.
    pub fn get_throttle_based_delay(&self) -> u64 {
        if self.is_enabled() {
            self.throttle_delay_ms
        } else {
            0
        }
    }

    /// Base pacing interval, 0 before initialization.
    pub fn base_delay_ms(&self) -> u64 {
        self.settings.as_ref().map_or(0, |s| s.base_delay_ms)
    }

    /// Full pause the worker should take between units of work.
    pub fn total_delay_ms(&self) -> u64 {
        self.base_delay_ms()
            .saturating_add(self.get_throttle_based_delay())
    }

    /// Snapshot the controller state.
    pub fn state(&self) -> ThrottleState {
        ThrottleState {
            target_consumption_percentage: self.settings.as_ref().and_then(|s| s.target_percentage),
            base_delay_ms: self.base_delay_ms(),
            throttle_delay_ms: self.get_throttle_based_delay(),
            recent_samples: self.window.iter().copied().collect(),
        }
    }
}

/// Controller shared between the data-access layer (reporting costs) and the
/// worker (reading delays).
#[derive(Debug, Clone, Default)]
pub struct SharedThrottle {
    inner: Arc<Mutex<ThrottleController>>,
}

impl SharedThrottle {
    /// Wrap a controller.
    pub fn new(controller: ThrottleController) -> Self {
        Self {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    /// See [`ThrottleController::initialize`].
    pub fn initialize(&self, settings: ThrottleSettings) {
        self.lock().initialize(settings);
    }

    /// See [`ThrottleController::handle`].
    pub fn handle(&self, metric: ThrottleMetric) -> u64 {
        self.lock().handle(metric)
    }

    /// See [`ThrottleController::get_throttle_based_delay`].
    pub fn get_throttle_based_delay(&self) -> u64 {
        self.lock().get_throttle_based_delay()
    }

    /// See [`ThrottleController::total_delay_ms`].
    pub fn total_delay_ms(&self) -> u64 {
        self.lock().total_delay_ms()
    }

    /// See [`ThrottleController::state`].
    pub fn state(&self) -> ThrottleState {
        self.lock().state()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleController> {
        // A panic while holding the lock cannot leave the controller inconsistent;
        // every mutation is a single assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
