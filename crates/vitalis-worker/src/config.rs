// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use vitalis_core::throttle::{ThrottleSettings, ThrottleTuning};

use crate::cleanup_worker::CleanupWorkerConfig;

/// Vitalis worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Queue this worker leases from
    pub queue_id: String,
    /// Live leases allowed on the queue
    pub max_concurrent_tasks: i64,
    /// Pause between acquisition polls
    pub poll_interval: Duration,
    /// Keep-alive period of a running task
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a lease is stale
    pub heartbeat_timeout: Duration,
    /// Job throttle settings
    pub throttle: ThrottleSettings,
    /// Throttle step sizes, ceiling and hysteresis
    pub throttle_tuning: ThrottleTuning,
    /// Lifetime of vault entries
    pub token_ttl: Duration,
    /// How long to wait for the schema upgrade lock
    pub upgrade_lock_timeout: Duration,
    /// Database cleanup settings
    pub cleanup: CleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `VITALIS_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `VITALIS_QUEUE_ID`: queue to lease from (default: `default`)
    /// - `VITALIS_MAX_CONCURRENT_TASKS`: live leases per queue (default: 4)
    /// - `VITALIS_POLL_INTERVAL_MS`: acquisition poll interval (default: 1000)
    /// - `VITALIS_HEARTBEAT_INTERVAL_SECS`: keep-alive period (default: 10)
    /// - `VITALIS_HEARTBEAT_TIMEOUT_SECS`: stale lease threshold (default: 60)
    /// - `VITALIS_TARGET_RESOURCE_PERCENTAGE`: throttle target, unset disables throttling
    /// - `VITALIS_RESOURCE_BUDGET_PER_SECOND`: store budget (default: 1000)
    /// - `VITALIS_QUERY_DELAY_MS`: base delay between units of work (default: 50)
    /// - `VITALIS_THROTTLE_INCREASE_STEP_MS`: delay added when over target (default: base delay)
    /// - `VITALIS_THROTTLE_DECREASE_STEP_MS`: delay removed when under the band (default: base delay)
    /// - `VITALIS_THROTTLE_MAX_DELAY_MS`: throttle delay ceiling (default: max(20 x base, 1000))
    /// - `VITALIS_THROTTLE_LOWER_BAND_RATIO`: lower edge of the hysteresis band (default: 0.75)
    /// - `VITALIS_THROTTLE_WINDOW_SIZE`: samples averaged per decision (default: 5)
    /// - `VITALIS_TOKEN_TTL_SECS`: vault entry lifetime (default: 86400)
    /// - `VITALIS_UPGRADE_LOCK_TIMEOUT_SECS`: schema upgrade lock wait (default: 30)
    ///
    /// Cleanup variables are documented on [`CleanupWorkerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("VITALIS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("VITALIS_DATABASE_URL"))?;

        let queue_id = std::env::var("VITALIS_QUEUE_ID").unwrap_or_else(|_| "default".to_string());
        if queue_id.trim().is_empty() {
            return Err(ConfigError::Invalid("VITALIS_QUEUE_ID", "must not be empty"));
        }

        let max_concurrent_tasks: i64 = parse_var(
            "VITALIS_MAX_CONCURRENT_TASKS",
            4,
            "must be a positive integer",
        )?;
        if max_concurrent_tasks <= 0 {
            return Err(ConfigError::Invalid(
                "VITALIS_MAX_CONCURRENT_TASKS",
                "must be a positive integer",
            ));
        }

        let poll_interval_ms: u64 =
            parse_var("VITALIS_POLL_INTERVAL_MS", 1000, "must be a number of milliseconds")?;
        let heartbeat_interval_secs: u64 = parse_var(
            "VITALIS_HEARTBEAT_INTERVAL_SECS",
            10,
            "must be a number of seconds",
        )?;
        let heartbeat_timeout_secs: u64 = parse_var(
            "VITALIS_HEARTBEAT_TIMEOUT_SECS",
            60,
            "must be a number of seconds",
        )?;
        if heartbeat_interval_secs == 0 || heartbeat_interval_secs * 3 > heartbeat_timeout_secs {
            return Err(ConfigError::Invalid(
                "VITALIS_HEARTBEAT_INTERVAL_SECS",
                "must be positive and at most a third of VITALIS_HEARTBEAT_TIMEOUT_SECS",
            ));
        }

        let target_percentage = match std::env::var("VITALIS_TARGET_RESOURCE_PERCENTAGE") {
            Ok(v) if !v.trim().is_empty() => Some(v.trim().parse::<u8>().map_err(|_| {
                ConfigError::Invalid(
                    "VITALIS_TARGET_RESOURCE_PERCENTAGE",
                    "must be an integer between 0 and 100",
                )
            })?),
            _ => None,
        };
        if target_percentage.is_some_and(|p| p > 100) {
            return Err(ConfigError::Invalid(
                "VITALIS_TARGET_RESOURCE_PERCENTAGE",
                "must be an integer between 0 and 100",
            ));
        }

        let budget_per_second: f64 = parse_var(
            "VITALIS_RESOURCE_BUDGET_PER_SECOND",
            1000.0,
            "must be a non-negative number",
        )?;
        if !budget_per_second.is_finite() || budget_per_second < 0.0 {
            return Err(ConfigError::Invalid(
                "VITALIS_RESOURCE_BUDGET_PER_SECOND",
                "must be a non-negative number",
            ));
        }

        let base_delay_ms: u64 =
            parse_var("VITALIS_QUERY_DELAY_MS", 50, "must be a number of milliseconds")?;
        let throttle_tuning = throttle_tuning_from_env()?;

        let token_ttl_secs: u64 =
            parse_var("VITALIS_TOKEN_TTL_SECS", 86400, "must be a number of seconds")?;
        let upgrade_lock_timeout_secs: u64 = parse_var(
            "VITALIS_UPGRADE_LOCK_TIMEOUT_SECS",
            30,
            "must be a number of seconds",
        )?;

        Ok(Self {
            database_url,
            queue_id,
            max_concurrent_tasks,
            poll_interval: Duration::from_millis(poll_interval_ms),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_secs),
            throttle: ThrottleSettings {
                target_percentage,
                budget_per_second,
                base_delay_ms,
            },
            throttle_tuning,
            token_ttl: Duration::from_secs(token_ttl_secs),
            upgrade_lock_timeout: Duration::from_secs(upgrade_lock_timeout_secs),
            cleanup: CleanupWorkerConfig::from_env(),
        })
    }
}

fn throttle_tuning_from_env() -> Result<ThrottleTuning, ConfigError> {
    let defaults = ThrottleTuning::default();

    let lower_band_ratio: f64 = parse_var(
        "VITALIS_THROTTLE_LOWER_BAND_RATIO",
        defaults.lower_band_ratio,
        "must be a number between 0 and 1",
    )?;
    if !(0.0..=1.0).contains(&lower_band_ratio) {
        return Err(ConfigError::Invalid(
            "VITALIS_THROTTLE_LOWER_BAND_RATIO",
            "must be a number between 0 and 1",
        ));
    }

    let window_size: usize = parse_var(
        "VITALIS_THROTTLE_WINDOW_SIZE",
        defaults.window_size,
        "must be a positive integer",
    )?;
    if window_size == 0 {
        return Err(ConfigError::Invalid(
            "VITALIS_THROTTLE_WINDOW_SIZE",
            "must be a positive integer",
        ));
    }

    Ok(ThrottleTuning {
        increase_step_ms: parse_optional_var(
            "VITALIS_THROTTLE_INCREASE_STEP_MS",
            "must be a number of milliseconds",
        )?,
        decrease_step_ms: parse_optional_var(
            "VITALIS_THROTTLE_DECREASE_STEP_MS",
            "must be a number of milliseconds",
        )?,
        max_throttle_delay_ms: parse_optional_var(
            "VITALIS_THROTTLE_MAX_DELAY_MS",
            "must be a number of milliseconds",
        )?,
        lower_band_ratio,
        window_size,
    })
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

/// Like [`parse_var`], but unset or blank means `None`.
fn parse_optional_var<T: FromStr>(
    key: &'static str,
    message: &'static str,
) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key, message)),
        _ => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
