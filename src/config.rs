//! Runtime configuration for the feed engine
//!
//! Defaults come from [`constants`](crate::constants). A config can be
//! deserialized from JSON (all fields optional, durations in milliseconds)
//! or built from `FEED_*` environment variables.

use crate::{constants::*, error::EngineError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of registered subscriptions
    pub max_subscriptions: usize,
    /// Updates admitted per throttle window
    pub max_updates_per_second: usize,
    /// Throttle window length
    pub throttle_window_ms: u64,
    /// Drain the queue in batches when more than one entry is waiting
    pub batching_enabled: bool,
    /// Entries drained per batch pass
    pub max_batch_size: usize,
    /// Age after which buffered data is cleared
    pub max_data_age_ms: u64,
    /// Idle time after which a subscription is removed
    pub subscription_timeout_ms: u64,
    /// Staleness sweep cadence
    pub cleanup_interval_ms: u64,
    /// Metrics / alert cadence
    pub metrics_interval_ms: u64,
    /// Scheduler scan cadence
    pub scheduler_tick_ms: u64,
    /// Upper bound for one fetch
    pub fetch_timeout_ms: u64,
    /// Errors (failed fetches and deliveries) tolerated before a
    /// subscription is disabled
    pub error_threshold: u32,
    /// Fetch retry behaviour
    pub retry: RetryPolicy,
    /// Alert thresholds
    pub alerts: AlertThresholds,
}

/// Retry behaviour for a single scheduled fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Thresholds that trigger advisory alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Alert when successful / total dispatches falls below this, once at
    /// least one dispatch has been recorded
    pub min_success_rate: f64,
    /// Alert when the rolling dispatch rate (per second) falls below this.
    /// Only evaluated while at least one subscription is active, so an idle
    /// engine with nobody listening does not raise it.
    pub min_update_rate: f64,
    pub max_queue_length: usize,
    pub max_average_data_age_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: MAX_SUBSCRIPTIONS,
            max_updates_per_second: MAX_UPDATES_PER_SECOND,
            throttle_window_ms: THROTTLE_WINDOW_MS,
            batching_enabled: true,
            max_batch_size: MAX_BATCH_SIZE,
            max_data_age_ms: MAX_DATA_AGE_MS,
            subscription_timeout_ms: SUBSCRIPTION_TIMEOUT_MS,
            cleanup_interval_ms: CLEANUP_INTERVAL_MS,
            metrics_interval_ms: METRICS_INTERVAL_MS,
            scheduler_tick_ms: SCHEDULER_TICK_MS,
            fetch_timeout_ms: FETCH_TIMEOUT_MS,
            error_threshold: ERROR_THRESHOLD,
            retry: RetryPolicy::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: ALERT_MIN_SUCCESS_RATE,
            min_update_rate: ALERT_MIN_UPDATE_RATE,
            max_queue_length: ALERT_MAX_QUEUE_LENGTH,
            max_average_data_age_ms: ALERT_MAX_DATA_AGE_MS,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("Failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults overridden by `FEED_*` environment variables
    ///
    /// Recognised variables: `FEED_MAX_SUBSCRIPTIONS`, `FEED_MAX_UPDATES_PER_SECOND`,
    /// `FEED_BATCHING_ENABLED`, `FEED_MAX_BATCH_SIZE`, `FEED_MAX_DATA_AGE_MS`,
    /// `FEED_SUBSCRIPTION_TIMEOUT_MS`, `FEED_CLEANUP_INTERVAL_MS`,
    /// `FEED_METRICS_INTERVAL_MS`, `FEED_FETCH_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();

        override_from_env("FEED_MAX_SUBSCRIPTIONS", &mut config.max_subscriptions)?;
        override_from_env(
            "FEED_MAX_UPDATES_PER_SECOND",
            &mut config.max_updates_per_second,
        )?;
        override_from_env("FEED_BATCHING_ENABLED", &mut config.batching_enabled)?;
        override_from_env("FEED_MAX_BATCH_SIZE", &mut config.max_batch_size)?;
        override_from_env("FEED_MAX_DATA_AGE_MS", &mut config.max_data_age_ms)?;
        override_from_env(
            "FEED_SUBSCRIPTION_TIMEOUT_MS",
            &mut config.subscription_timeout_ms,
        )?;
        override_from_env("FEED_CLEANUP_INTERVAL_MS", &mut config.cleanup_interval_ms)?;
        override_from_env("FEED_METRICS_INTERVAL_MS", &mut config.metrics_interval_ms)?;
        override_from_env("FEED_FETCH_TIMEOUT_MS", &mut config.fetch_timeout_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks that every bound and cadence is usable
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("max_subscriptions", self.max_subscriptions as u64),
            ("max_updates_per_second", self.max_updates_per_second as u64),
            ("throttle_window_ms", self.throttle_window_ms),
            ("max_batch_size", self.max_batch_size as u64),
            ("max_data_age_ms", self.max_data_age_ms),
            ("subscription_timeout_ms", self.subscription_timeout_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("scheduler_tick_ms", self.scheduler_tick_ms),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("retry.max_attempts", self.retry.max_attempts as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EngineError::config(format!("{} must be positive", name)));
            }
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }

        if !(0.0..=1.0).contains(&self.alerts.min_success_rate) {
            return Err(EngineError::config(format!(
                "alerts.min_success_rate must be in [0, 1], got {}",
                self.alerts.min_success_rate
            )));
        }

        Ok(())
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    pub fn max_data_age(&self) -> Duration {
        Duration::from_millis(self.max_data_age_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) -> Result<(), EngineError> {
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| EngineError::config(format!("Invalid value for {}: {:?}", key, raw)))?;
    }
    Ok(())
}
