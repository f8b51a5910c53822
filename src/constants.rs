//! Default values for the feed distribution engine
//!
//! Every value here can be overridden at runtime through
//! [`EngineConfig`](crate::config::EngineConfig); these are the defaults
//! the engine falls back to.

/// Maximum number of concurrent subscriptions
pub const MAX_SUBSCRIPTIONS: usize = 1000;

/// Maximum number of updates admitted per throttle window
pub const MAX_UPDATES_PER_SECOND: usize = 50;

/// Length of the throttle window (in milliseconds)
pub const THROTTLE_WINDOW_MS: u64 = 1000;

/// Maximum number of queue entries drained by one batch pass
pub const MAX_BATCH_SIZE: usize = 10;

/// Age after which a buffered payload is considered stale (in milliseconds)
pub const MAX_DATA_AGE_MS: u64 = 60_000;

/// Idle time after which a subscription is removed (in milliseconds)
pub const SUBSCRIPTION_TIMEOUT_MS: u64 = 300_000;

/// Cadence of the staleness / throttle purge cycle (in milliseconds)
pub const CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Cadence of metrics recomputation and alert evaluation (in milliseconds)
pub const METRICS_INTERVAL_MS: u64 = 10_000;

/// How often the scheduler scans for due subscriptions (in milliseconds)
pub const SCHEDULER_TICK_MS: u64 = 100;

/// Upper bound for a single fetch against a data source (in milliseconds)
pub const FETCH_TIMEOUT_MS: u64 = 10_000;

/// Default fetch interval for new subscriptions (in milliseconds)
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;

/// Smallest allowed subscription interval (in milliseconds)
pub const MIN_INTERVAL_MS: u64 = 100;

/// Largest allowed subscription interval (in milliseconds)
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Default subscription priority
pub const DEFAULT_PRIORITY: u8 = 5;

/// Highest allowed subscription priority
pub const MAX_PRIORITY: u8 = 10;

/// Consecutive fetch failures tolerated before a subscription is disabled
pub const ERROR_THRESHOLD: u32 = 5;

/// Window used for the rolling update rate (in seconds)
pub const RATE_WINDOW_SECS: u64 = 60;

/// Number of dispatch passes kept for batch efficiency / latency samples
pub const MAX_SAMPLES: usize = 100;

/// Capacity of the engine event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fetch attempts per scheduled cycle (1 = no retry)
pub const MAX_RETRY_ATTEMPTS: u32 = 1;

/// Initial backoff delay for retries (in milliseconds)
pub const INITIAL_BACKOFF_MS: u64 = 250;

/// Maximum backoff delay for retries (in milliseconds)
pub const MAX_BACKOFF_MS: u64 = 5_000;

/// Alert when the dispatch success rate falls below this fraction
pub const ALERT_MIN_SUCCESS_RATE: f64 = 0.9;

/// Alert when the rolling update rate falls below this many updates/sec
pub const ALERT_MIN_UPDATE_RATE: f64 = 1.0;

/// Alert when more than this many entries are waiting in the queue
pub const ALERT_MAX_QUEUE_LENGTH: usize = 100;

/// Alert when the average buffered data age exceeds this (in milliseconds)
pub const ALERT_MAX_DATA_AGE_MS: u64 = 30_000;

/// User agent for HTTP requests
pub const USER_AGENT: &str = "realtime-feed-sdk/0.1.0";
