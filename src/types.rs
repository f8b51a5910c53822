//! Types for the feed distribution engine

use crate::{
    constants::{DEFAULT_INTERVAL_MS, DEFAULT_PRIORITY},
    metrics::MetricsSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a subscription, never reused within an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0.simple())
    }
}

/// Options accepted by `subscribe`
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Fetch parameters for the data source, also matched against payloads
    pub filter: Option<Value>,
    /// How often the scheduler fetches for this subscription
    pub interval: Duration,
    /// Queue priority of updates this subscription schedules (0..=10)
    pub priority: u8,
    /// Whether the scheduler fetches on `interval` for this subscription
    pub auto_renew: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: None,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            priority: DEFAULT_PRIORITY,
            auto_renew: true,
        }
    }
}

impl SubscribeOptions {
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }
}

/// Options accepted by `trigger_update`
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Skip throttle admission for this call only
    pub force: bool,
    /// Queue priority; defaults to the highest priority among interested subscriptions
    pub priority: Option<u8>,
}

impl TriggerOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What happened to a triggered update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Admitted and delivered by a dispatch pass started by this call
    Dispatched,
    /// Admitted and left for the dispatch pass already in flight
    Queued,
    /// Dropped by the throttle gate
    Throttled,
}

/// A payload delivered to an observer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedUpdate {
    /// Subscription receiving the update
    pub subscription_id: SubscriptionId,
    /// Feed name
    pub feed: String,
    /// Most recent payload for the feed
    pub payload: Value,
    /// When the payload entered the engine
    pub timestamp: DateTime<Utc>,
    /// Number of queued updates folded into this delivery
    pub coalesced: usize,
}

/// Why a subscription left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeReason {
    /// Explicit `unsubscribe` call
    Requested,
    /// No delivery within the subscription timeout
    IdleTimeout,
    /// Subscription was disabled and swept
    Disabled,
    /// Engine shut down
    Shutdown,
}

/// Kind of threshold breach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    LowUpdateRate,
    QueueBacklog,
    StaleData,
}

/// Advisory alert raised by the metrics cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    /// Observed value
    pub value: f64,
    /// Threshold that was crossed
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Events surfaced to engine callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// A subscription was registered
    Subscribed {
        id: Uuid,
        subscription_id: SubscriptionId,
        feed: String,
        timestamp: DateTime<Utc>,
    },

    /// A subscription was removed
    Unsubscribed {
        id: Uuid,
        subscription_id: SubscriptionId,
        feed: String,
        reason: UnsubscribeReason,
        timestamp: DateTime<Utc>,
    },

    /// A subscription exceeded its error threshold
    SubscriptionDisabled {
        id: Uuid,
        subscription_id: SubscriptionId,
        feed: String,
        error_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// Periodic metrics snapshot
    Metrics { id: Uuid, snapshot: MetricsSnapshot },

    /// Threshold breach
    Alert { id: Uuid, alert: Alert },
}

impl EngineEvent {
    pub(crate) fn subscribed(subscription_id: SubscriptionId, feed: &str) -> Self {
        Self::Subscribed {
            id: Uuid::new_v4(),
            subscription_id,
            feed: feed.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn unsubscribed(
        subscription_id: SubscriptionId,
        feed: &str,
        reason: UnsubscribeReason,
    ) -> Self {
        Self::Unsubscribed {
            id: Uuid::new_v4(),
            subscription_id,
            feed: feed.to_string(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn disabled(subscription_id: SubscriptionId, feed: &str, error_count: u32) -> Self {
        Self::SubscriptionDisabled {
            id: Uuid::new_v4(),
            subscription_id,
            feed: feed.to_string(),
            error_count,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn metrics(snapshot: MetricsSnapshot) -> Self {
        Self::Metrics {
            id: Uuid::new_v4(),
            snapshot,
        }
    }

    pub(crate) fn alert(alert: Alert) -> Self {
        Self::Alert {
            id: Uuid::new_v4(),
            alert,
        }
    }

    /// Get the event ID
    pub fn id(&self) -> Uuid {
        match self {
            EngineEvent::Subscribed { id, .. } => *id,
            EngineEvent::Unsubscribed { id, .. } => *id,
            EngineEvent::SubscriptionDisabled { id, .. } => *id,
            EngineEvent::Metrics { id, .. } => *id,
            EngineEvent::Alert { id, .. } => *id,
        }
    }

    /// Get the event type as string
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::Subscribed { .. } => "SUBSCRIBED",
            EngineEvent::Unsubscribed { .. } => "UNSUBSCRIBED",
            EngineEvent::SubscriptionDisabled { .. } => "SUBSCRIPTION_DISABLED",
            EngineEvent::Metrics { .. } => "METRICS",
            EngineEvent::Alert { .. } => "ALERT",
        }
    }
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Subscribed {
                subscription_id,
                feed,
                ..
            } => write!(f, "Subscribed {} to {}", subscription_id, feed),
            EngineEvent::Unsubscribed {
                subscription_id,
                feed,
                reason,
                ..
            } => write!(
                f,
                "Unsubscribed {} from {} ({:?})",
                subscription_id, feed, reason
            ),
            EngineEvent::SubscriptionDisabled {
                subscription_id,
                error_count,
                ..
            } => write!(
                f,
                "Subscription {} disabled after {} errors",
                subscription_id, error_count
            ),
            EngineEvent::Metrics { snapshot, .. } => write!(
                f,
                "Metrics: {} updates, {:.2}/s",
                snapshot.total_updates, snapshot.current_rate
            ),
            EngineEvent::Alert { alert, .. } => {
                write!(f, "Alert {:?}: {}", alert.kind, alert.message)
            }
        }
    }
}

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// System is healthy and all components are operational
    Healthy,
    /// System is degraded but still functional
    Degraded,
    /// System is unhealthy and requires attention
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Component-specific details
    pub details: std::collections::HashMap<String, Value>,
    /// Last checked timestamp
    pub last_checked: DateTime<Utc>,
}
