//! Feed engine handle
//!
//! `FeedEngine` ties the registry, throttle gate, queue, dispatcher, buffer
//! store, staleness monitor and metrics together and owns the control loop.
//! It is a cheap `Clone` handle; every clone drives the same engine.

use crate::{
    config::EngineConfig,
    constants::{DEFAULT_PRIORITY, EVENT_CHANNEL_CAPACITY, MAX_PRIORITY},
    dispatcher::{BatchDispatcher, DispatchSettings},
    error::EngineError,
    metrics::{evaluate_alerts, Gauges, MetricsCollector, MetricsSnapshot},
    monitor::StalenessMonitor,
    observer::FeedObserver,
    queue::{UpdateQueue, UpdateQueueEntry},
    registry::{FetchFailure, FetchJob, SubscriptionRegistry, SubscriptionSnapshot},
    scheduler::{FetchCompletion, Scheduler},
    source::FeedSource,
    store::DataBufferStore,
    throttle::ThrottleGate,
    types::{
        ComponentHealth, EngineEvent, HealthStatus, SubscribeOptions, SubscriptionId,
        TriggerOptions, TriggerOutcome, UnsubscribeReason,
    },
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// State shared between the public handle and the control loop
pub(crate) struct EngineCore {
    config: EngineConfig,
    source: Arc<dyn FeedSource>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    throttle: Mutex<ThrottleGate>,
    dispatcher: BatchDispatcher,
    store: Arc<DataBufferStore>,
    metrics: Arc<MetricsCollector>,
    monitor: StalenessMonitor,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineCore {
    fn new(config: EngineConfig, source: Arc<dyn FeedSource>) -> Self {
        let registry = Arc::new(RwLock::new(SubscriptionRegistry::new(config.max_subscriptions)));
        let queue = Arc::new(Mutex::new(UpdateQueue::new()));
        let store = Arc::new(DataBufferStore::new(config.max_data_age()));
        let metrics = Arc::new(MetricsCollector::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let dispatcher = BatchDispatcher::new(
            registry.clone(),
            queue,
            store.clone(),
            metrics.clone(),
            events.clone(),
            DispatchSettings {
                batching_enabled: config.batching_enabled,
                max_batch_size: config.max_batch_size,
                error_threshold: config.error_threshold,
            },
        );
        let monitor = StalenessMonitor::new(
            registry.clone(),
            store.clone(),
            config.subscription_timeout(),
        );
        let throttle = Mutex::new(ThrottleGate::new(
            config.max_updates_per_second,
            config.throttle_window(),
        ));

        Self {
            config,
            source,
            registry,
            throttle,
            dispatcher,
            store,
            metrics,
            monitor,
            events,
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn source(&self) -> Arc<dyn FeedSource> {
        self.source.clone()
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine; events are best effort
        let _ = self.events.send(event);
    }

    /// Marks due subscriptions in flight and returns their fetch jobs
    pub(crate) async fn due_fetches(&self, now: Instant) -> Vec<FetchJob> {
        self.registry.write().await.due_for_fetch(now)
    }

    /// Admits an update and runs a dispatch pass
    ///
    /// `origin` is the subscription whose scheduled fetch produced the
    /// payload. It is always targeted, even if the payload does not carry
    /// its filter keys.
    pub(crate) async fn trigger_update(
        &self,
        feed: &str,
        payload: Value,
        options: TriggerOptions,
        origin: Option<SubscriptionId>,
    ) -> TriggerOutcome {
        let now = Instant::now();
        let (subscribers, origins, subscriber_priority) = {
            let registry = self.registry.read().await;
            let (mut subscribers, mut priority) = registry.matching(feed, &payload);
            let mut origins = HashSet::new();

            if let Some(sub) = origin
                .and_then(|id| registry.get(&id))
                .filter(|sub| sub.is_active() && sub.feed() == feed)
            {
                subscribers.insert(sub.id());
                origins.insert(sub.id());
                priority = priority.max(Some(sub.priority()));
            }

            (subscribers, origins, priority)
        };

        {
            let mut throttle = self.throttle.lock().await;
            if options.force {
                throttle.record_forced(now);
            } else if !throttle.admit(now) {
                drop(throttle);
                self.metrics.record_throttled().await;
                tracing::debug!(feed = feed, "Update throttled");
                return TriggerOutcome::Throttled;
            }
        }

        let priority = options
            .priority
            .or(subscriber_priority)
            .unwrap_or(DEFAULT_PRIORITY)
            .min(MAX_PRIORITY);

        tracing::trace!(
            feed = feed,
            priority = priority,
            subscribers = subscribers.len(),
            forced = options.force,
            "Update admitted"
        );

        let entry = UpdateQueueEntry::new(feed, payload, priority, subscribers, now)
            .with_origins(origins);
        self.dispatcher.enqueue(entry).await;

        if self.dispatcher.process().await {
            TriggerOutcome::Dispatched
        } else {
            TriggerOutcome::Queued
        }
    }

    /// Folds a finished fetch back into the engine
    pub(crate) async fn complete_fetch(&self, done: FetchCompletion) {
        let FetchCompletion { job, result } = done;

        match result {
            Ok(payload) => {
                let still_registered = {
                    let mut registry = self.registry.write().await;
                    registry.record_fetch_success(&job.subscription_id);
                    registry
                        .get(&job.subscription_id)
                        .map(|sub| sub.is_active())
                        .unwrap_or(false)
                };

                match payload {
                    Some(payload) if still_registered => {
                        self.trigger_update(
                            &job.feed,
                            payload,
                            TriggerOptions::default(),
                            Some(job.subscription_id),
                        )
                        .await;
                    }
                    Some(_) => {
                        tracing::debug!(
                            subscription_id = %job.subscription_id,
                            feed = %job.feed,
                            "Dropping fetch result for removed subscription"
                        );
                    }
                    None => {}
                }
            }
            Err(source_error) => {
                let e = EngineError::fetch(&job.feed, source_error);
                self.metrics.record_fetch_failure().await;
                let outcome = self
                    .registry
                    .write()
                    .await
                    .record_fetch_failure(&job.subscription_id, self.config.error_threshold);

                match outcome {
                    FetchFailure::Counted { error_count } => {
                        tracing::warn!(
                            subscription_id = %job.subscription_id,
                            feed = %job.feed,
                            error_count = error_count,
                            error = %e,
                            "Scheduled fetch failed"
                        );
                    }
                    FetchFailure::Disabled { error_count } => {
                        tracing::warn!(
                            subscription_id = %job.subscription_id,
                            feed = %job.feed,
                            error_count = error_count,
                            error = %e,
                            "Subscription disabled after repeated fetch failures"
                        );
                        self.emit(EngineEvent::disabled(
                            job.subscription_id,
                            &job.feed,
                            error_count,
                        ));
                    }
                    FetchFailure::Unknown => {
                        tracing::debug!(
                            subscription_id = %job.subscription_id,
                            error = %e,
                            "Fetch failed for removed subscription"
                        );
                    }
                }
            }
        }
    }

    /// Staleness sweep plus throttle window housekeeping
    pub(crate) async fn run_cleanup(&self) {
        let now = Instant::now();
        let report = self.monitor.sweep(now).await;
        self.throttle.lock().await.purge(now);

        for removed in report.removed {
            self.emit(EngineEvent::unsubscribed(removed.id, &removed.feed, removed.reason));
        }
    }

    /// Refreshes metrics, publishes them and raises alerts
    pub(crate) async fn run_metrics_cycle(&self) {
        let now = Instant::now();
        let gauges = self.gauges(now).await;
        let snapshot = self.metrics.refresh(now, gauges).await;

        tracing::debug!(
            total_updates = snapshot.total_updates,
            current_rate = snapshot.current_rate,
            queue_length = snapshot.queue_length,
            "Metrics refreshed"
        );

        let alerts = evaluate_alerts(&snapshot, &self.config.alerts);
        self.emit(EngineEvent::metrics(snapshot));

        for alert in alerts {
            tracing::warn!(
                kind = ?alert.kind,
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
            self.emit(EngineEvent::alert(alert));
        }
    }

    async fn gauges(&self, now: Instant) -> Gauges {
        let (subscription_count, active_subscription_count) = {
            let registry = self.registry.read().await;
            (registry.len(), registry.active_count())
        };

        Gauges {
            queue_length: self.dispatcher.queue_len().await,
            subscription_count,
            active_subscription_count,
            average_data_age: self.store.average_age(now).await,
        }
    }
}

/// Handle on a running control loop
struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Real-time feed distribution engine
///
/// # Example
/// ```no_run
/// use realtime_feed_sdk::{observer, EngineConfig, FeedEngine, SubscribeOptions};
/// use realtime_feed_sdk::sources::HttpJsonSource;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = Arc::new(HttpJsonSource::new("https://feeds.example.com")?);
/// let engine = FeedEngine::new(EngineConfig::default(), source)?;
/// engine.start();
///
/// let id = engine
///     .subscribe(
///         "gas_price",
///         observer::from_fn(|update| println!("{}: {}", update.feed, update.payload)),
///         SubscribeOptions::default(),
///     )
///     .await?;
///
/// // ...
/// engine.unsubscribe(&id).await;
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FeedEngine {
    core: Arc<EngineCore>,
    running: Arc<std::sync::Mutex<Option<RunningLoop>>>,
}

impl FeedEngine {
    /// Creates an engine that fetches scheduled updates from `source`
    ///
    /// # Errors
    /// `Config` if the configuration fails validation
    pub fn new(config: EngineConfig, source: Arc<dyn FeedSource>) -> Result<Self, EngineError> {
        config.validate()?;

        Ok(Self {
            core: Arc::new(EngineCore::new(config, source)),
            running: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Creates an engine configured from `FEED_*` environment variables
    pub fn from_env(source: Arc<dyn FeedSource>) -> Result<Self, EngineError> {
        Self::new(EngineConfig::from_env()?, source)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Starts the control loop
    ///
    /// Must be called from within a tokio runtime. Calling it on a running
    /// engine does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(self.core.clone(), shutdown_rx);
        let handle = tokio::spawn(scheduler.run());

        tracing::info!(
            source = self.core.source.source_name(),
            max_subscriptions = self.core.config.max_subscriptions,
            max_updates_per_second = self.core.config.max_updates_per_second,
            "Feed engine started"
        );

        *running = Some(RunningLoop { shutdown_tx, handle });
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or_else(|e| e.into_inner().is_some())
    }

    /// Stops the control loop and releases all engine state
    ///
    /// In-flight fetches are aborted, queued updates are dropped without
    /// dispatch, every subscription is removed with an `Unsubscribed`
    /// event and the buffer store is emptied.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(RunningLoop { shutdown_tx, handle }) = running {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Control loop ended abnormally");
            }
        }

        let dropped = self.core.dispatcher.discard_pending().await;
        let removed = self.core.registry.write().await.drain();
        self.core.store.clear().await;

        for sub in &removed {
            self.core.emit(EngineEvent::unsubscribed(
                sub.id(),
                sub.feed(),
                UnsubscribeReason::Shutdown,
            ));
        }

        tracing::info!(
            dropped_updates = dropped,
            removed_subscriptions = removed.len(),
            "Feed engine stopped"
        );
    }

    /// Registers interest in a feed
    ///
    /// # Arguments
    /// * `feed` - Feed name
    /// * `observer` - Receives every delivered update
    /// * `options` - Filter, fetch interval, priority and auto-renew flag
    ///
    /// # Errors
    /// `CapacityExceeded` when the registry is full, `Config` for invalid
    /// options
    pub async fn subscribe(
        &self,
        feed: &str,
        observer: Arc<dyn FeedObserver>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, EngineError> {
        let interval_ms = options.interval.as_millis() as u64;
        let priority = options.priority;

        let id = self
            .core
            .registry
            .write()
            .await
            .insert(feed, observer, options, Instant::now())?;

        tracing::info!(
            subscription_id = %id,
            feed = feed,
            interval_ms = interval_ms,
            priority = priority,
            "Subscription created"
        );
        self.core.emit(EngineEvent::subscribed(id, feed));

        Ok(id)
    }

    /// Removes a subscription
    ///
    /// # Returns
    /// `false` if the id was not registered
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.core.registry.write().await.remove(id);

        match removed {
            Some(sub) => {
                tracing::info!(subscription_id = %id, feed = sub.feed(), "Subscription removed");
                self.core.emit(EngineEvent::unsubscribed(
                    sub.id(),
                    sub.feed(),
                    UnsubscribeReason::Requested,
                ));
                true
            }
            None => false,
        }
    }

    /// Publishes a payload to a feed's subscribers
    ///
    /// The update goes through throttle admission unless `options.force` is
    /// set. Its priority is `options.priority`, falling back to the highest
    /// priority among matching subscriptions.
    pub async fn trigger_update(
        &self,
        feed: &str,
        payload: Value,
        options: TriggerOptions,
    ) -> TriggerOutcome {
        self.core.trigger_update(feed, payload, options, None).await
    }

    /// Latest payload for a feed, `None` if missing or older than the
    /// maximum data age
    pub async fn get_cached_data(&self, feed: &str) -> Option<Value> {
        self.core.store.get(feed, Instant::now()).await
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let gauges = self.core.gauges(now).await;
        self.core.metrics.snapshot(now, gauges).await
    }

    /// Snapshots of active subscriptions, oldest first
    pub async fn active_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        let mut snapshots = self.subscriptions().await;
        snapshots.retain(|sub| sub.is_active);
        snapshots
    }

    /// Snapshots of every registered subscription, including disabled ones
    pub async fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.core.registry.read().await.snapshots(Instant::now())
    }

    pub async fn subscription(&self, id: &SubscriptionId) -> Option<SubscriptionSnapshot> {
        self.core.registry.read().await.snapshot(id, Instant::now())
    }

    /// Subscribes to engine lifecycle, metrics and alert events
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    /// Perform a health check on the engine
    ///
    /// # Returns
    /// `Unhealthy` when the control loop is not running, `Degraded` when
    /// any alert is active, a feed is stale or a subscription is disabled,
    /// `Healthy` otherwise
    pub async fn health_check(&self) -> ComponentHealth {
        let now = Instant::now();
        let metrics = self.get_metrics().await;
        let alerts = evaluate_alerts(&metrics, &self.core.config.alerts);
        let stale_feeds = self.core.store.stale_feeds(now).await;
        let cached_feeds = self.core.store.len().await;
        let throttle_in_window = self.core.throttle.lock().await.in_window();
        let disabled = metrics.subscription_count - metrics.active_subscription_count;
        let running = self.is_running();

        let mut details = HashMap::new();
        details.insert("running".to_string(), serde_json::json!(running));
        details.insert(
            "source_name".to_string(),
            serde_json::json!(self.core.source.source_name()),
        );
        details.insert(
            "subscriptions".to_string(),
            serde_json::json!(metrics.subscription_count),
        );
        details.insert(
            "disabled_subscriptions".to_string(),
            serde_json::json!(disabled),
        );
        details.insert("cached_feeds".to_string(), serde_json::json!(cached_feeds));
        details.insert("stale_feeds".to_string(), serde_json::json!(stale_feeds));
        details.insert(
            "queue_length".to_string(),
            serde_json::json!(metrics.queue_length),
        );
        details.insert(
            "throttle_in_window".to_string(),
            serde_json::json!(throttle_in_window),
        );
        details.insert(
            "alerts".to_string(),
            serde_json::json!(alerts.iter().map(|a| a.kind).collect::<Vec<_>>()),
        );

        let status = if !running {
            HealthStatus::Unhealthy
        } else if !alerts.is_empty() || !stale_feeds.is_empty() || disabled > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let message = match status {
            HealthStatus::Healthy => "Feed engine is operational".to_string(),
            HealthStatus::Degraded => format!(
                "Feed engine is degraded: {} alerts, {} stale feeds, {} disabled subscriptions",
                alerts.len(),
                stale_feeds.len(),
                disabled
            ),
            HealthStatus::Unhealthy => "Feed engine control loop is not running".to_string(),
        };

        ComponentHealth {
            name: "feed_engine".to_string(),
            status,
            message: Some(message),
            details,
            last_checked: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{self, ChannelObserver};
    use crate::source::mock::MockSource;
    use crate::types::FeedUpdate;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn engine_with(config: EngineConfig) -> (FeedEngine, MockSource) {
        let mock = MockSource::new();
        let engine = FeedEngine::new(config, Arc::new(mock.clone())).unwrap();
        (engine, mock)
    }

    fn recorder() -> (Arc<dyn FeedObserver>, Arc<StdMutex<Vec<FeedUpdate>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let obs = observer::from_fn(move |update| sink.lock().unwrap().push(update.clone()));
        (obs, seen)
    }

    fn manual() -> SubscribeOptions {
        SubscribeOptions::default().with_auto_renew(false)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        let result = FeedEngine::new(config, Arc::new(MockSource::new()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_trigger_delivers_and_caches() {
        let (engine, _) = engine_with(EngineConfig::default());
        let (obs, seen) = recorder();
        let id = engine.subscribe("gas", obs, manual()).await.unwrap();

        let outcome = engine
            .trigger_update("gas", json!({"gwei": 21}), TriggerOptions::default())
            .await;
        assert_eq!(outcome, TriggerOutcome::Dispatched);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].subscription_id, id);
        assert_eq!(seen[0].payload, json!({"gwei": 21}));
        drop(seen);

        assert_eq!(engine.get_cached_data("gas").await, Some(json!({"gwei": 21})));
        assert_eq!(engine.subscription(&id).await.unwrap().update_count, 1);
    }

    #[tokio::test]
    async fn test_filter_limits_delivery() {
        let (engine, _) = engine_with(EngineConfig::default());
        let (fast_obs, fast) = recorder();
        let (all_obs, all) = recorder();

        engine
            .subscribe("gas", fast_obs, manual().with_filter(json!({"tier": "fast"})))
            .await
            .unwrap();
        engine.subscribe("gas", all_obs, manual()).await.unwrap();

        engine
            .trigger_update("gas", json!({"tier": "slow", "gwei": 9}), TriggerOptions::default())
            .await;
        engine
            .trigger_update("gas", json!({"tier": "fast", "gwei": 30}), TriggerOptions::default())
            .await;

        assert_eq!(fast.lock().unwrap().len(), 1);
        assert_eq!(all.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_update_bypasses_throttle() {
        let config = EngineConfig {
            max_updates_per_second: 2,
            ..Default::default()
        };
        let (engine, _) = engine_with(config);
        let (obs, seen) = recorder();
        engine.subscribe("gas", obs, manual()).await.unwrap();

        for i in 0..3 {
            engine
                .trigger_update("gas", json!(i), TriggerOptions::default())
                .await;
        }
        let forced = engine
            .trigger_update("gas", json!(99), TriggerOptions::forced())
            .await;

        assert_eq!(forced, TriggerOutcome::Dispatched);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(engine.get_metrics().await.throttled_updates, 1);
        assert_eq!(engine.get_cached_data("gas").await, Some(json!(99)));
    }

    #[tokio::test]
    async fn test_events_for_subscription_lifecycle() {
        let (engine, _) = engine_with(EngineConfig::default());
        let mut events = engine.events();

        let id = engine
            .subscribe("gas", observer::from_fn(|_| {}), manual())
            .await
            .unwrap();
        assert!(engine.unsubscribe(&id).await);
        assert!(!engine.unsubscribe(&id).await);

        match events.recv().await.unwrap() {
            EngineEvent::Subscribed { subscription_id, .. } => assert_eq!(subscription_id, id),
            other => panic!("unexpected event: {}", other),
        }
        match events.recv().await.unwrap() {
            EngineEvent::Unsubscribed { reason, .. } => {
                assert_eq!(reason, UnsubscribeReason::Requested)
            }
            other => panic!("unexpected event: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_fetch_publishes_to_subscribers() {
        let (engine, mock) = engine_with(EngineConfig::default());
        mock.set_payload("gas", json!({"gwei": 18}));

        let (obs, mut rx) = ChannelObserver::channel(16);
        engine
            .subscribe(
                "gas",
                obs,
                SubscribeOptions::default().with_interval(Duration::from_millis(500)),
            )
            .await
            .unwrap();
        engine.start();
        assert!(engine.is_running());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, json!({"gwei": 18}));

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert!(mock.call_count("gas") >= 3);

        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_fetch_publishes_nothing() {
        let (engine, mock) = engine_with(EngineConfig::default());
        mock.set_empty("gas");
        let (obs, seen) = recorder();
        let id = engine.subscribe("gas", obs, SubscribeOptions::default()).await.unwrap();

        engine.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(mock.call_count("gas") >= 1);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(engine.subscription(&id).await.unwrap().error_count, 0);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_only_delays_its_subscription() {
        let config = EngineConfig {
            fetch_timeout_ms: 60_000,
            ..Default::default()
        };
        let (engine, mock) = engine_with(config);
        mock.set_hang("slow");
        mock.set_payload("gas", json!(1));

        let (obs, seen) = recorder();
        let fast = SubscribeOptions::default().with_interval(Duration::from_millis(200));
        engine.subscribe("slow", observer::from_fn(|_| {}), fast.clone()).await.unwrap();
        engine.subscribe("gas", obs, fast).await.unwrap();

        engine.start();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(mock.call_count("slow"), 1);
        assert!(seen.lock().unwrap().len() >= 4);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_cycle_emits_snapshot_and_alerts() {
        let config = EngineConfig {
            metrics_interval_ms: 1_000,
            ..Default::default()
        };
        let (engine, _) = engine_with(config);
        let mut events = engine.events();

        let failing = observer::from_fn(|_| panic!("observer bug"));
        engine.subscribe("gas", failing, manual()).await.unwrap();
        engine
            .trigger_update("gas", json!(1), TriggerOptions::default())
            .await;

        engine.start();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let mut saw_metrics = false;
        let mut alerts = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Metrics { snapshot, .. } => {
                    saw_metrics = true;
                    assert_eq!(snapshot.failed_updates, 1);
                }
                EngineEvent::Alert { alert, .. } => alerts.push(alert.kind),
                _ => {}
            }
        }

        assert!(saw_metrics);
        assert!(alerts.contains(&crate::types::AlertKind::LowSuccessRate));
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_state() {
        let (engine, _) = engine_with(EngineConfig::default());
        let id = engine
            .subscribe("gas", observer::from_fn(|_| {}), manual())
            .await
            .unwrap();
        engine
            .trigger_update("gas", json!(5), TriggerOptions::default())
            .await;
        engine.start();
        let mut events = engine.events();

        engine.stop().await;

        assert!(engine.subscription(&id).await.is_none());
        assert_eq!(engine.get_cached_data("gas").await, None);
        match events.recv().await.unwrap() {
            EngineEvent::Unsubscribed { reason, .. } => {
                assert_eq!(reason, UnsubscribeReason::Shutdown)
            }
            other => panic!("unexpected event: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reports_status() {
        let (engine, _) = engine_with(EngineConfig::default());
        assert_eq!(engine.health_check().await.status, HealthStatus::Unhealthy);

        engine.start();
        let health = engine.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.details["running"], json!(true));

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetching_subscription_receives_payload_without_filter_keys() {
        let config = EngineConfig {
            cleanup_interval_ms: 1_000,
            subscription_timeout_ms: 1_500,
            ..Default::default()
        };
        let (engine, mock) = engine_with(config);
        mock.set_payload("gas", json!({"gwei": 18}));

        let fast_tier = json!({"tier": "fast"});
        let (fetch_obs, fetched) = recorder();
        let fetcher = engine
            .subscribe(
                "gas",
                fetch_obs,
                SubscribeOptions::default()
                    .with_filter(fast_tier.clone())
                    .with_interval(Duration::from_millis(500)),
            )
            .await
            .unwrap();
        let (sibling_obs, sibling) = recorder();
        engine
            .subscribe("gas", sibling_obs, manual().with_filter(fast_tier))
            .await
            .unwrap();

        engine.start();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let fetched = fetched.lock().unwrap().clone();
        assert!(fetched.len() >= 4);
        assert!(fetched.iter().all(|u| u.payload == json!({"gwei": 18})));
        assert!(sibling.lock().unwrap().is_empty());

        // Its own deliveries keep it from being swept as idle
        let snapshot = engine.subscription(&fetcher).await.unwrap();
        assert!(snapshot.is_active);
        assert_eq!(snapshot.update_count, fetched.len() as u64);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_disabled_and_idle_subscriptions() {
        let config = EngineConfig {
            cleanup_interval_ms: 1_000,
            subscription_timeout_ms: 1_500,
            ..Default::default()
        };
        let (engine, mock) = engine_with(config);
        mock.set_error("broken", "upstream unavailable");
        let mut events = engine.events();

        let broken = engine
            .subscribe(
                "broken",
                observer::from_fn(|_| {}),
                SubscribeOptions::default().with_interval(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let idle = engine
            .subscribe("quiet", observer::from_fn(|_| {}), manual())
            .await
            .unwrap();

        // Nobody listens on this feed, so the idle subscription stays untouched
        for i in 0..3 {
            engine
                .trigger_update("unwatched", json!(i), TriggerOptions::default())
                .await;
        }
        assert_eq!(engine.core.throttle.lock().await.in_window(), 3);

        engine.start();

        // First sweep at 1s: broken was disabled by its sixth failure
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert!(engine.subscription(&broken).await.is_none());
        assert!(engine.subscription(&idle).await.is_some());
        assert_eq!(engine.core.throttle.lock().await.in_window(), 0);

        // Second sweep at 2s: idle for longer than the timeout
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(engine.subscriptions().await.is_empty());

        let mut disabled = Vec::new();
        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::SubscriptionDisabled {
                    subscription_id,
                    error_count,
                    ..
                } => disabled.push((subscription_id, error_count)),
                EngineEvent::Unsubscribed {
                    subscription_id,
                    reason,
                    ..
                } => removed.push((subscription_id, reason)),
                _ => {}
            }
        }
        assert_eq!(disabled, vec![(broken, 6)]);
        assert_eq!(
            removed,
            vec![
                (broken, UnsubscribeReason::Disabled),
                (idle, UnsubscribeReason::IdleTimeout),
            ]
        );

        engine.stop().await;
    }
}
