//! Data source abstraction for fetching feed payloads

use crate::error::SourceError;
use async_trait::async_trait;
use serde_json::Value;

/// Trait for feed data sources
///
/// Implementations fetch the current payload for a named feed from some
/// upstream (price oracle, contract call, gas estimator, HTTP API...). The
/// engine treats them as opaque: calls may be slow, may fail, and may
/// complete out of order. Implementations must not have side effects the
/// engine can observe.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetches the current payload for a feed
    ///
    /// # Arguments
    /// * `feed` - Feed name, e.g. `"gas_price"`
    /// * `filter` - Optional subscription filter, forwarded as fetch parameters
    ///
    /// # Returns
    /// `Ok(Some(payload))` when data is available, `Ok(None)` when the
    /// source has nothing to publish, or an error if the fetch fails
    async fn fetch(&self, feed: &str, filter: Option<&Value>) -> Result<Option<Value>, SourceError>;

    /// Returns the name of this source
    fn source_name(&self) -> &'static str;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    enum Scripted {
        Payload(Value),
        Empty,
        Error(String),
        Hang,
    }

    /// Mock source for testing
    #[derive(Clone, Default)]
    pub struct MockSource {
        responses: Arc<Mutex<HashMap<String, Scripted>>>,
        calls: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl MockSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_payload(&self, feed: &str, payload: Value) {
            self.script(feed, Scripted::Payload(payload));
        }

        pub fn set_empty(&self, feed: &str) {
            self.script(feed, Scripted::Empty);
        }

        pub fn set_error(&self, feed: &str, message: &str) {
            self.script(feed, Scripted::Error(message.to_string()));
        }

        /// Makes every fetch for `feed` never complete
        pub fn set_hang(&self, feed: &str) {
            self.script(feed, Scripted::Hang);
        }

        pub fn call_count(&self, feed: &str) -> usize {
            self.calls.lock().unwrap().get(feed).copied().unwrap_or(0)
        }

        fn script(&self, feed: &str, response: Scripted) {
            self.responses
                .lock()
                .unwrap()
                .insert(feed.to_string(), response);
        }
    }

    #[async_trait]
    impl FeedSource for MockSource {
        async fn fetch(
            &self,
            feed: &str,
            _filter: Option<&Value>,
        ) -> Result<Option<Value>, SourceError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(feed.to_string())
                .or_insert(0) += 1;

            let response = self.responses.lock().unwrap().get(feed).cloned();
            match response {
                Some(Scripted::Payload(payload)) => Ok(Some(payload)),
                Some(Scripted::Empty) => Ok(None),
                Some(Scripted::Error(message)) => Err(SourceError::ApiError(message)),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(86_400)).await;
                    Err(SourceError::Timeout)
                }
                None => Err(SourceError::UnsupportedFeed(feed.to_string())),
            }
        }

        fn source_name(&self) -> &'static str {
            "mock"
        }
    }
}
