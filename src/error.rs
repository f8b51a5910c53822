//! Error types for the feed distribution engine

use thiserror::Error;

/// Errors that can occur when fetching a payload from a data source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network request failed
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Invalid response from the source
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Feed not supported by this source
    #[error("Feed not supported: {0}")]
    UnsupportedFeed(String),

    /// Source API error
    #[error("Source API error: {0}")]
    ApiError(String),

    /// Timeout waiting for response
    #[error("Request timeout")]
    Timeout,
}

/// Errors surfaced by the engine
///
/// Only `CapacityExceeded` and `Config` are ever returned to callers of
/// `subscribe`. Fetch and processing errors are absorbed by the engine,
/// logged, and reflected in metrics and per-subscription error counters.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The registry already holds `max` subscriptions
    #[error("Subscription capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    /// Invalid engine configuration or subscription options
    #[error("Configuration error: {0}")]
    Config(String),

    /// The data source failed for a feed
    #[error("Fetch failed for {feed}: {source}")]
    Fetch {
        feed: String,
        #[source]
        source: SourceError,
    },

    /// One or more deliveries failed while dispatching a feed
    #[error("Processing failed for {feed}: {failed} delivery failure(s)")]
    Processing { feed: String, failed: usize },
}

impl EngineError {
    /// Creates a CapacityExceeded error
    pub fn capacity_exceeded(max: usize) -> Self {
        Self::CapacityExceeded { max }
    }

    /// Creates a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a Fetch error
    pub fn fetch(feed: &str, source: SourceError) -> Self {
        Self::Fetch {
            feed: feed.to_string(),
            source,
        }
    }

    /// Creates a Processing error
    pub fn processing(feed: &str, failed: usize) -> Self {
        Self::Processing {
            feed: feed.to_string(),
            failed,
        }
    }
}

/// Errors an observer can report for a single delivery
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Bounded channel had no room for the update
    #[error("Observer channel is full")]
    ChannelFull,

    /// Receiving side of the channel was dropped
    #[error("Observer channel is closed")]
    ChannelClosed,

    /// Observer panicked while handling the update
    #[error("Observer panicked: {0}")]
    Panicked(String),

    /// Observer refused the update
    #[error("Observer rejected update: {0}")]
    Rejected(String),
}
