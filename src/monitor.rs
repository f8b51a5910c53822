//! Periodic eviction of stale buffers and idle subscriptions

use crate::{
    registry::{Removed, SubscriptionRegistry},
    store::DataBufferStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// What one sweep evicted
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Feeds whose buffer was cleared
    pub cleared_feeds: Vec<String>,
    /// Subscriptions removed from the registry
    pub removed: Vec<Removed>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.cleared_feeds.is_empty() && self.removed.is_empty()
    }
}

/// Clears buffers older than the maximum data age and removes subscriptions
/// that are disabled or have gone without a delivery for too long
pub struct StalenessMonitor {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    store: Arc<DataBufferStore>,
    subscription_timeout: Duration,
}

impl StalenessMonitor {
    pub fn new(
        registry: Arc<RwLock<SubscriptionRegistry>>,
        store: Arc<DataBufferStore>,
        subscription_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            subscription_timeout,
        }
    }

    /// Runs one sweep at `now`
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let removed = self
            .registry
            .write()
            .await
            .sweep(now, self.subscription_timeout);

        let cleared_feeds = self.store.clear_stale(now).await;

        for feed in &cleared_feeds {
            tracing::info!(feed = %feed, "Cleared stale buffer");
        }
        for sub in &removed {
            tracing::info!(
                subscription_id = %sub.id,
                feed = %sub.feed,
                reason = ?sub.reason,
                "Removed subscription"
            );
        }

        SweepReport {
            cleared_feeds,
            removed,
        }
    }
}
