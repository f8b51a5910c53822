//! In-memory store of the latest payload per feed

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Latest known payload for one feed
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// `None` once the staleness monitor cleared it
    pub payload: Option<Value>,
    /// Monotonic write time, never regresses
    pub updated_at: Instant,
    /// Wall-clock time the payload entered the engine
    pub received_at: DateTime<Utc>,
}

impl BufferEntry {
    /// Age of the buffered data
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated_at)
    }
}

/// Type alias for the buffer map (feed -> entry)
type BufferMap = HashMap<String, BufferEntry>;

/// Per-feed cache of "most recent payload + timestamp"
///
/// Consumers read from here between pushes. Reads return owned copies so
/// callers never hold the lock.
pub struct DataBufferStore {
    buffers: Arc<RwLock<BufferMap>>,
    max_data_age: Duration,
}

impl DataBufferStore {
    /// Creates a new store whose entries expire after `max_data_age`
    pub fn new(max_data_age: Duration) -> Self {
        Self {
            buffers: Arc::new(RwLock::new(HashMap::new())),
            max_data_age,
        }
    }

    /// Writes the payload for a feed
    ///
    /// # Returns
    /// `false` if the buffer already holds a newer write, which is kept
    pub async fn write(
        &self,
        feed: &str,
        payload: Value,
        updated_at: Instant,
        received_at: DateTime<Utc>,
    ) -> bool {
        let mut buffers = self.buffers.write().await;

        if let Some(existing) = buffers.get(feed) {
            if existing.updated_at > updated_at {
                tracing::debug!(feed = feed, "Ignoring out-of-order buffer write");
                return false;
            }
        }

        buffers.insert(
            feed.to_string(),
            BufferEntry {
                payload: Some(payload),
                updated_at,
                received_at,
            },
        );
        tracing::trace!(feed = feed, "Buffer updated");
        true
    }

    /// Gets the cached payload for a feed
    ///
    /// # Returns
    /// The payload, or `None` if the feed was never written, was cleared,
    /// or is older than the maximum data age
    pub async fn get(&self, feed: &str, now: Instant) -> Option<Value> {
        let buffers = self.buffers.read().await;
        let entry = buffers.get(feed)?;

        if entry.age(now) > self.max_data_age {
            return None;
        }

        entry.payload.clone()
    }

    /// Gets the full buffer entry, regardless of staleness
    pub async fn entry(&self, feed: &str) -> Option<BufferEntry> {
        self.buffers.read().await.get(feed).cloned()
    }

    /// Checks if data is stale or missing for a feed
    pub async fn is_stale(&self, feed: &str, now: Instant) -> bool {
        match self.buffers.read().await.get(feed) {
            Some(entry) => entry.payload.is_none() || entry.age(now) > self.max_data_age,
            None => true,
        }
    }

    /// Feeds whose buffer still holds a payload past the maximum data age
    pub async fn stale_feeds(&self, now: Instant) -> Vec<String> {
        let buffers = self.buffers.read().await;
        let mut stale: Vec<String> = buffers
            .iter()
            .filter(|(_, entry)| entry.payload.is_some() && entry.age(now) > self.max_data_age)
            .map(|(feed, _)| feed.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Clears every buffer older than the maximum data age
    ///
    /// # Returns
    /// The feeds that were cleared
    pub async fn clear_stale(&self, now: Instant) -> Vec<String> {
        let mut buffers = self.buffers.write().await;
        let mut cleared = Vec::new();

        for (feed, entry) in buffers.iter_mut() {
            if entry.payload.is_some() && entry.age(now) > self.max_data_age {
                entry.payload = None;
                cleared.push(feed.clone());
            }
        }

        cleared.sort();
        cleared
    }

    /// Average age across all non-empty buffers
    pub async fn average_age(&self, now: Instant) -> Option<Duration> {
        let buffers = self.buffers.read().await;
        let ages: Vec<Duration> = buffers
            .values()
            .filter(|entry| entry.payload.is_some())
            .map(|entry| entry.age(now))
            .collect();

        if ages.is_empty() {
            return None;
        }

        Some(ages.iter().sum::<Duration>() / ages.len() as u32)
    }

    /// Number of buffers currently holding a payload
    pub async fn len(&self) -> usize {
        self.buffers
            .read()
            .await
            .values()
            .filter(|entry| entry.payload.is_some())
            .count()
    }

    /// Drops every buffer
    pub async fn clear(&self) {
        self.buffers.write().await.clear();
    }
}
