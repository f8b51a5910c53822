//! Failover data source implementation

use crate::{error::SourceError, source::FeedSource};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Data source that tries multiple sources in order until one succeeds
pub struct FailoverSource {
    sources: Vec<Arc<dyn FeedSource>>,
}

impl FailoverSource {
    /// Creates a new failover source
    ///
    /// The sources are tried in the order they are provided. A source that
    /// answers `Ok(None)` counts as a success.
    pub fn new(sources: Vec<Arc<dyn FeedSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl FeedSource for FailoverSource {
    async fn fetch(
        &self,
        feed: &str,
        filter: Option<&Value>,
    ) -> Result<Option<Value>, SourceError> {
        let mut last_error = None;

        for source in &self.sources {
            match source.fetch(feed, filter).await {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    tracing::warn!(
                        source = source.source_name(),
                        feed = feed,
                        error = %e,
                        "Source failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SourceError::InvalidResponse("No sources configured for failover".to_string())
        }))
    }

    fn source_name(&self) -> &'static str {
        "failover"
    }
}
