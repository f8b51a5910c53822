//! HTTP JSON data source implementation

use crate::{
    constants::{FETCH_TIMEOUT_MS, USER_AGENT},
    error::SourceError,
    source::FeedSource,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Data source that GETs `{base_url}/{feed}` and returns the JSON body
///
/// An object filter is sent as query parameters. A 404 means the upstream
/// has nothing for the feed yet and yields `Ok(None)`.
pub struct HttpJsonSource {
    client: Client,
    base_url: String,
}

impl HttpJsonSource {
    /// Creates a new HTTP source rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(SourceError::NetworkError)?;

        Ok(Self::with_client(client, base_url))
    }

    /// Creates a source sharing an existing client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Builds the URL for a feed
    fn build_url(&self, feed: &str) -> String {
        format!("{}/{}", self.base_url, feed)
    }

    /// Flattens an object filter into query parameters
    ///
    /// Strings are sent verbatim, other scalars and nested values as JSON.
    fn query_params(filter: Option<&Value>) -> Vec<(String, String)> {
        let Some(Value::Object(map)) = filter else {
            return Vec::new();
        };

        map.iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl FeedSource for HttpJsonSource {
    async fn fetch(
        &self,
        feed: &str,
        filter: Option<&Value>,
    ) -> Result<Option<Value>, SourceError> {
        let url = self.build_url(feed);
        tracing::debug!(url = %url, "Fetching feed over HTTP");

        let response = self
            .client
            .get(&url)
            .query(&Self::query_params(filter))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::NetworkError(e)
                }
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::TOO_MANY_REQUESTS => return Err(SourceError::RateLimitExceeded),
            status if !status.is_success() => {
                return Err(SourceError::ApiError(format!(
                    "HTTP {}: {}",
                    status,
                    response.text().await.unwrap_or_default()
                )));
            }
            _ => {}
        }

        let response_text = response.text().await.map_err(SourceError::NetworkError)?;

        let payload: Value = serde_json::from_str(&response_text).map_err(|e| {
            SourceError::InvalidResponse(format!(
                "Failed to parse response for {}: {}. Response: {}",
                feed, e, response_text
            ))
        })?;

        if payload.is_null() {
            return Ok(None);
        }

        Ok(Some(payload))
    }

    fn source_name(&self) -> &'static str {
        "http-json"
    }
}
