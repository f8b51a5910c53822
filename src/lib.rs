//! # Real-time Feed Distribution SDK
//!
//! Keeps many consumers up to date with frequently changing data (prices,
//! gas estimates, contract state...) pulled from pluggable data sources.
//!
//! Consumers subscribe to a named feed with an optional filter, a fetch
//! interval and a priority. The engine fetches on schedule, throttles the
//! incoming stream, queues admitted updates by priority, coalesces bursts
//! per feed, delivers to every interested subscriber, caches the latest
//! payload, expires stale data and idle subscriptions, and reports metrics
//! and alerts.
//!
//! ## Usage
//!
//! ```no_run
//! use realtime_feed_sdk::{observer, EngineConfig, FeedEngine, SubscribeOptions, TriggerOptions};
//! use realtime_feed_sdk::sources::HttpJsonSource;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(HttpJsonSource::new("https://feeds.example.com")?);
//! let engine = FeedEngine::new(EngineConfig::default(), source)?;
//! engine.start();
//!
//! // Fetched every second and pushed to the observer
//! engine
//!     .subscribe(
//!         "gas_price",
//!         observer::from_fn(|update| println!("{}: {}", update.feed, update.payload)),
//!         SubscribeOptions::default().with_interval(Duration::from_secs(1)),
//!     )
//!     .await?;
//!
//! // Payloads can also be pushed directly
//! engine
//!     .trigger_update("gas_price", serde_json::json!({"gwei": 21}), TriggerOptions::default())
//!     .await;
//!
//! if let Some(latest) = engine.get_cached_data("gas_price").await {
//!     println!("latest gas price: {}", latest);
//! }
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod observer;
pub mod queue;
pub mod registry;
mod scheduler;
pub mod source;
pub mod sources;
pub mod store;
pub mod throttle;
pub mod types;

// Re-export commonly used types
pub use config::{AlertThresholds, EngineConfig, RetryPolicy};
pub use engine::FeedEngine;
pub use error::{DeliveryError, EngineError, SourceError};
pub use metrics::MetricsSnapshot;
pub use observer::{ChannelObserver, FeedObserver};
pub use registry::SubscriptionSnapshot;
pub use source::FeedSource;
pub use types::{
    Alert, AlertKind, ComponentHealth, EngineEvent, FeedUpdate, HealthStatus, SubscribeOptions,
    SubscriptionId, TriggerOptions, TriggerOutcome, UnsubscribeReason,
};
