//! Subscription registry
//!
//! Owns every registered subscription, enforces the capacity bound and
//! answers "who is interested in this feed/payload". The registry itself is
//! plain data; the engine guards it with a lock and never holds that lock
//! while calling an observer.

use crate::{
    constants::{MAX_INTERVAL_MS, MAX_PRIORITY, MIN_INTERVAL_MS},
    error::EngineError,
    observer::FeedObserver,
    types::{SubscribeOptions, SubscriptionId, UnsubscribeReason},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A registered interest in a feed
pub struct Subscription {
    id: SubscriptionId,
    feed: String,
    filter: Option<Value>,
    observer: Arc<dyn FeedObserver>,
    interval: Duration,
    priority: u8,
    auto_renew: bool,
    created_at: DateTime<Utc>,
    last_update_time: Instant,
    last_delivery: Option<DateTime<Utc>>,
    last_fetch_at: Option<Instant>,
    fetch_in_flight: bool,
    update_count: u64,
    error_count: u32,
    is_active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("feed", &self.feed)
            .field("priority", &self.priority)
            .field("update_count", &self.update_count)
            .field("error_count", &self.error_count)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Counts one error and deactivates once `error_count` exceeds `threshold`
    ///
    /// # Returns
    /// `true` if this error disabled the subscription
    fn record_error(&mut self, threshold: u32) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        if self.is_active && self.error_count > threshold {
            self.is_active = false;
            return true;
        }
        false
    }

    fn snapshot(&self, now: Instant) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id,
            feed: self.feed.clone(),
            filter: self.filter.clone(),
            interval_ms: self.interval.as_millis() as u64,
            priority: self.priority,
            auto_renew: self.auto_renew,
            update_count: self.update_count,
            error_count: self.error_count,
            is_active: self.is_active,
            created_at: self.created_at,
            last_update: self.last_delivery,
            idle_ms: now.saturating_duration_since(self.last_update_time).as_millis() as u64,
        }
    }
}

/// Read-only copy of a subscription handed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub feed: String,
    pub filter: Option<Value>,
    pub interval_ms: u64,
    pub priority: u8,
    pub auto_renew: bool,
    pub update_count: u64,
    pub error_count: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// Wall-clock time of the last successful delivery
    pub last_update: Option<DateTime<Utc>>,
    /// Time since the last delivery (or creation)
    pub idle_ms: u64,
}

/// A fetch the scheduler should run for one subscription
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub subscription_id: SubscriptionId,
    pub feed: String,
    pub filter: Option<Value>,
}

/// Result of recording a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// Failure counted, subscription unchanged
    Counted { error_count: u32 },
    /// Threshold exceeded, subscription is now inactive
    Disabled { error_count: u32 },
    /// Subscription no longer registered
    Unknown,
}

/// A subscription removed by a sweep
#[derive(Debug, Clone)]
pub struct Removed {
    pub id: SubscriptionId,
    pub feed: String,
    pub reason: UnsubscribeReason,
}

/// Set of active subscriptions with a capacity bound
pub struct SubscriptionRegistry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    max_subscriptions: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            subscriptions: HashMap::new(),
            max_subscriptions,
        }
    }

    /// Registers a subscription
    ///
    /// # Errors
    /// `CapacityExceeded` when the registry is full, `Config` for an empty
    /// feed name, an interval outside the allowed range, or a priority above
    /// the maximum.
    pub fn insert(
        &mut self,
        feed: &str,
        observer: Arc<dyn FeedObserver>,
        options: SubscribeOptions,
        now: Instant,
    ) -> Result<SubscriptionId, EngineError> {
        validate_options(feed, &options)?;

        if self.subscriptions.len() >= self.max_subscriptions {
            return Err(EngineError::capacity_exceeded(self.max_subscriptions));
        }

        let mut id = SubscriptionId::new();
        while self.subscriptions.contains_key(&id) {
            id = SubscriptionId::new();
        }

        self.subscriptions.insert(
            id,
            Subscription {
                id,
                feed: feed.to_string(),
                filter: options.filter,
                observer,
                interval: options.interval,
                priority: options.priority,
                auto_renew: options.auto_renew,
                created_at: Utc::now(),
                last_update_time: now,
                last_delivery: None,
                last_fetch_at: None,
                fetch_in_flight: false,
                update_count: 0,
                error_count: 0,
                is_active: true,
            },
        );

        Ok(id)
    }

    pub fn remove(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.remove(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.values().filter(|s| s.is_active).count()
    }

    /// Active subscriptions on `feed` whose filter accepts `payload`
    ///
    /// # Returns
    /// The matching ids and the highest priority among them
    pub fn matching(&self, feed: &str, payload: &Value) -> (HashSet<SubscriptionId>, Option<u8>) {
        let mut ids = HashSet::new();
        let mut priority = None;

        for sub in self.subscriptions.values() {
            if sub.is_active && sub.feed == feed && filter_matches(sub.filter.as_ref(), payload) {
                ids.insert(sub.id);
                priority = priority.max(Some(sub.priority));
            }
        }

        (ids, priority)
    }

    /// Resolves which of `targets` should receive `payload` right now
    ///
    /// Ids that were unsubscribed or disabled are skipped, as are ids whose
    /// filter no longer matches. Ids in `origins` fetched this payload
    /// themselves and skip the filter check.
    pub fn delivery_targets(
        &self,
        targets: &HashSet<SubscriptionId>,
        origins: &HashSet<SubscriptionId>,
        feed: &str,
        payload: &Value,
    ) -> Vec<(SubscriptionId, Arc<dyn FeedObserver>)> {
        let mut resolved: Vec<_> = targets
            .iter()
            .chain(origins.difference(targets))
            .filter_map(|id| self.subscriptions.get(id))
            .filter(|sub| {
                sub.is_active
                    && sub.feed == feed
                    && (origins.contains(&sub.id)
                        || filter_matches(sub.filter.as_ref(), payload))
            })
            .map(|sub| (sub.id, sub.created_at, sub.observer.clone()))
            .collect();

        // Oldest subscription first so delivery order is deterministic
        resolved.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        resolved.into_iter().map(|(id, _, obs)| (id, obs)).collect()
    }

    /// Records the outcome of one delivery attempt
    ///
    /// # Returns
    /// The error count if this failed delivery pushed the subscription over
    /// `threshold` and disabled it
    pub fn record_delivery(
        &mut self,
        id: &SubscriptionId,
        success: bool,
        now: Instant,
        threshold: u32,
    ) -> Option<u32> {
        let sub = self.subscriptions.get_mut(id)?;

        if success {
            sub.update_count += 1;
            sub.last_update_time = now;
            sub.last_delivery = Some(Utc::now());
            None
        } else if sub.record_error(threshold) {
            Some(sub.error_count)
        } else {
            None
        }
    }

    /// Picks subscriptions whose next fetch is due and marks them in flight
    pub fn due_for_fetch(&mut self, now: Instant) -> Vec<FetchJob> {
        let mut jobs: Vec<(u8, DateTime<Utc>, FetchJob)> = Vec::new();

        for sub in self.subscriptions.values_mut() {
            if !sub.is_active || !sub.auto_renew || sub.fetch_in_flight {
                continue;
            }
            let due = match sub.last_fetch_at {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= sub.interval,
            };
            if due {
                sub.fetch_in_flight = true;
                sub.last_fetch_at = Some(now);
                jobs.push((
                    sub.priority,
                    sub.created_at,
                    FetchJob {
                        subscription_id: sub.id,
                        feed: sub.feed.clone(),
                        filter: sub.filter.clone(),
                    },
                ));
            }
        }

        jobs.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        jobs.into_iter().map(|(_, _, job)| job).collect()
    }

    /// Clears the in-flight mark after a successful fetch
    pub fn record_fetch_success(&mut self, id: &SubscriptionId) {
        if let Some(sub) = self.subscriptions.get_mut(id) {
            sub.fetch_in_flight = false;
        }
    }

    /// Counts a failed fetch and disables the subscription above `threshold`
    pub fn record_fetch_failure(&mut self, id: &SubscriptionId, threshold: u32) -> FetchFailure {
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return FetchFailure::Unknown;
        };

        sub.fetch_in_flight = false;

        if sub.record_error(threshold) {
            FetchFailure::Disabled {
                error_count: sub.error_count,
            }
        } else {
            FetchFailure::Counted {
                error_count: sub.error_count,
            }
        }
    }

    /// Removes inactive subscriptions and those idle longer than `timeout`
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Removed> {
        let expired: Vec<Removed> = self
            .subscriptions
            .values()
            .filter_map(|sub| {
                let reason = if !sub.is_active {
                    UnsubscribeReason::Disabled
                } else if now.saturating_duration_since(sub.last_update_time) > timeout {
                    UnsubscribeReason::IdleTimeout
                } else {
                    return None;
                };
                Some(Removed {
                    id: sub.id,
                    feed: sub.feed.clone(),
                    reason,
                })
            })
            .collect();

        for removed in &expired {
            self.subscriptions.remove(&removed.id);
        }

        expired
    }

    /// Removes every subscription
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.subscriptions.drain().map(|(_, sub)| sub).collect()
    }

    pub fn snapshot(&self, id: &SubscriptionId, now: Instant) -> Option<SubscriptionSnapshot> {
        self.subscriptions.get(id).map(|sub| sub.snapshot(now))
    }

    /// Snapshots of every registered subscription, oldest first
    pub fn snapshots(&self, now: Instant) -> Vec<SubscriptionSnapshot> {
        let mut all: Vec<_> = self.subscriptions.values().map(|s| s.snapshot(now)).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

fn validate_options(feed: &str, options: &SubscribeOptions) -> Result<(), EngineError> {
    if feed.trim().is_empty() {
        return Err(EngineError::config("feed name must not be empty"));
    }

    let interval_ms = options.interval.as_millis();
    if interval_ms < MIN_INTERVAL_MS as u128 || interval_ms > MAX_INTERVAL_MS as u128 {
        return Err(EngineError::config(format!(
            "interval must be between {}ms and {}ms, got {}ms",
            MIN_INTERVAL_MS, MAX_INTERVAL_MS, interval_ms
        )));
    }

    if options.priority > MAX_PRIORITY {
        return Err(EngineError::config(format!(
            "priority must be at most {}, got {}",
            MAX_PRIORITY, options.priority
        )));
    }

    Ok(())
}

/// Whether a subscription filter accepts a payload
///
/// No filter accepts everything. An object filter requires each of its keys
/// to be present in the payload object with an equal value. Any other
/// filter must equal the payload.
pub fn filter_matches(filter: Option<&Value>, payload: &Value) -> bool {
    match (filter, payload) {
        (None, _) => true,
        (Some(Value::Object(wanted)), Value::Object(fields)) => wanted
            .iter()
            .all(|(key, value)| fields.get(key) == Some(value)),
        (Some(Value::Object(_)), _) => false,
        (Some(wanted), payload) => wanted == payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer;
    use serde_json::json;

    fn noop() -> Arc<dyn FeedObserver> {
        observer::from_fn(|_| {})
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let mut registry = SubscriptionRegistry::new(2);
        let now = Instant::now();

        registry.insert("price", noop(), SubscribeOptions::default(), now).unwrap();
        registry.insert("price", noop(), SubscribeOptions::default(), now).unwrap();
        let err = registry
            .insert("price", noop(), SubscribeOptions::default(), now)
            .unwrap_err();

        assert!(matches!(err, EngineError::CapacityExceeded { max: 2 }));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_options() {
        let mut registry = SubscriptionRegistry::new(10);
        let now = Instant::now();

        let too_fast = SubscribeOptions::default().with_interval(Duration::from_millis(10));
        assert!(matches!(
            registry.insert("price", noop(), too_fast, now),
            Err(EngineError::Config(_))
        ));

        let too_urgent = SubscribeOptions::default().with_priority(MAX_PRIORITY + 1);
        assert!(matches!(
            registry.insert("price", noop(), too_urgent, now),
            Err(EngineError::Config(_))
        ));

        assert!(matches!(
            registry.insert("  ", noop(), SubscribeOptions::default(), now),
            Err(EngineError::Config(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_filter_matching() {
        let payload = json!({"chain": "ethereum", "pool": "weth-usdc", "tvl": 10});

        assert!(filter_matches(None, &payload));
        assert!(filter_matches(Some(&json!({"chain": "ethereum"})), &payload));
        assert!(!filter_matches(Some(&json!({"chain": "polygon"})), &payload));
        assert!(!filter_matches(Some(&json!({"missing": 1})), &payload));
        assert!(filter_matches(Some(&json!(42)), &json!(42)));
        assert!(!filter_matches(Some(&json!({"chain": "ethereum"})), &json!(42)));
    }

    #[tokio::test]
    async fn test_matching_and_priority() {
        let mut registry = SubscriptionRegistry::new(10);
        let now = Instant::now();

        let eth = registry
            .insert(
                "pool",
                noop(),
                SubscribeOptions::default()
                    .with_filter(json!({"chain": "ethereum"}))
                    .with_priority(8),
                now,
            )
            .unwrap();
        let any = registry
            .insert("pool", noop(), SubscribeOptions::default().with_priority(2), now)
            .unwrap();
        registry
            .insert("gas", noop(), SubscribeOptions::default().with_priority(10), now)
            .unwrap();

        let (ids, priority) = registry.matching("pool", &json!({"chain": "ethereum"}));
        assert_eq!(ids, HashSet::from([eth, any]));
        assert_eq!(priority, Some(8));

        let (ids, priority) = registry.matching("pool", &json!({"chain": "polygon"}));
        assert_eq!(ids, HashSet::from([any]));
        assert_eq!(priority, Some(2));

        let (ids, priority) = registry.matching("unknown", &json!({}));
        assert!(ids.is_empty());
        assert_eq!(priority, None);
    }

    #[tokio::test]
    async fn test_fetch_failures_disable_above_threshold() {
        let mut registry = SubscriptionRegistry::new(10);
        let id = registry
            .insert("gas", noop(), SubscribeOptions::default(), Instant::now())
            .unwrap();

        for n in 1..=5 {
            assert_eq!(
                registry.record_fetch_failure(&id, 5),
                FetchFailure::Counted { error_count: n }
            );
        }
        assert_eq!(
            registry.record_fetch_failure(&id, 5),
            FetchFailure::Disabled { error_count: 6 }
        );
        assert!(!registry.get(&id).unwrap().is_active());
        assert!(registry.due_for_fetch(Instant::now()).is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_successes_do_not_reset_error_count() {
        let mut registry = SubscriptionRegistry::new(10);
        let id = registry
            .insert("gas", noop(), SubscribeOptions::default(), Instant::now())
            .unwrap();

        for _ in 0..5 {
            registry.record_fetch_failure(&id, 5);
        }
        registry.record_fetch_success(&id);
        assert!(registry.get(&id).unwrap().is_active());

        assert_eq!(
            registry.record_fetch_failure(&id, 5),
            FetchFailure::Disabled { error_count: 6 }
        );
        let snapshot = registry.snapshot(&id, Instant::now()).unwrap();
        assert!(!snapshot.is_active);
        assert_eq!(snapshot.error_count, 6);

        // Already disabled: further failures are only counted
        assert_eq!(
            registry.record_fetch_failure(&id, 5),
            FetchFailure::Counted { error_count: 7 }
        );
    }

    #[tokio::test]
    async fn test_delivery_failures_disable_above_threshold() {
        let mut registry = SubscriptionRegistry::new(10);
        let now = Instant::now();
        let id = registry
            .insert("gas", noop(), SubscribeOptions::default(), now)
            .unwrap();

        for _ in 0..5 {
            assert_eq!(registry.record_delivery(&id, false, now, 5), None);
        }
        assert_eq!(registry.record_delivery(&id, true, now, 5), None);
        assert_eq!(registry.record_delivery(&id, false, now, 5), Some(6));
        assert_eq!(registry.record_delivery(&id, false, now, 5), None);

        let snapshot = registry.snapshot(&id, now).unwrap();
        assert!(!snapshot.is_active);
        assert_eq!(snapshot.error_count, 7);
        assert_eq!(snapshot.update_count, 1);
    }

    #[tokio::test]
    async fn test_origin_skips_filter_check() {
        let mut registry = SubscriptionRegistry::new(10);
        let now = Instant::now();
        let filtered = registry
            .insert(
                "price",
                noop(),
                SubscribeOptions::default().with_filter(json!({"chain": "eth"})),
                now,
            )
            .unwrap();
        let other = registry
            .insert(
                "price",
                noop(),
                SubscribeOptions::default().with_filter(json!({"chain": "sol"})),
                now,
            )
            .unwrap();

        let payload = json!({"price": 1});
        let (matched, _) = registry.matching("price", &payload);
        assert!(matched.is_empty());

        let origins = HashSet::from([filtered]);
        let targets: Vec<_> = registry
            .delivery_targets(&matched, &origins, "price", &payload)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(targets, vec![filtered]);
        assert!(!targets.contains(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_for_fetch_respects_interval_and_in_flight() {
        let mut registry = SubscriptionRegistry::new(10);
        let start = Instant::now();
        let id = registry
            .insert(
                "gas",
                noop(),
                SubscribeOptions::default().with_interval(Duration::from_secs(1)),
                start,
            )
            .unwrap();
        registry
            .insert(
                "manual",
                noop(),
                SubscribeOptions::default().with_auto_renew(false),
                start,
            )
            .unwrap();

        let jobs = registry.due_for_fetch(start);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].subscription_id, id);

        // In flight: not picked again even once the interval elapses
        assert!(registry.due_for_fetch(start + Duration::from_secs(2)).is_empty());

        registry.record_fetch_success(&id);
        assert!(registry.due_for_fetch(start + Duration::from_millis(500)).is_empty());
        assert_eq!(registry.due_for_fetch(start + Duration::from_secs(1)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_and_disabled() {
        let mut registry = SubscriptionRegistry::new(10);
        let start = Instant::now();
        let idle = registry
            .insert("gas", noop(), SubscribeOptions::default(), start)
            .unwrap();
        let disabled = registry
            .insert("gas", noop(), SubscribeOptions::default(), start)
            .unwrap();
        let fresh = registry
            .insert("gas", noop(), SubscribeOptions::default(), start)
            .unwrap();

        for _ in 0..6 {
            registry.record_fetch_failure(&disabled, 5);
        }
        let later = start + Duration::from_secs(120);
        registry.record_delivery(&fresh, true, later, 5);

        let removed = registry.sweep(later, Duration::from_secs(60));
        let mut reasons: Vec<_> = removed.iter().map(|r| (r.id, r.reason)).collect();
        reasons.sort_by_key(|(id, _)| *id);
        let mut expected = vec![
            (idle, UnsubscribeReason::IdleTimeout),
            (disabled, UnsubscribeReason::Disabled),
        ];
        expected.sort_by_key(|(id, _)| *id);

        assert_eq!(reasons, expected);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&fresh).is_some());
    }
}
