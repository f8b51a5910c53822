//! Queue draining and delivery to observers
//!
//! A pass drains the queue either one entry at a time or in batches of up
//! to `max_batch_size`. In a batch, entries for the same feed collapse to
//! the latest one (by timestamp, then insertion order) and their subscriber
//! sets are unioned, so each feed is dispatched once per batch.
//!
//! Only one pass runs at a time. A trigger that arrives while a pass is in
//! flight leaves its entry queued; the running pass keeps draining until
//! the queue is empty.

use crate::{
    error::{DeliveryError, EngineError},
    metrics::MetricsCollector,
    queue::{UpdateQueue, UpdateQueueEntry},
    registry::SubscriptionRegistry,
    store::DataBufferStore,
    types::{EngineEvent, FeedUpdate, SubscriptionId},
};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

/// One feed's worth of work for a dispatch
struct FeedDispatch {
    latest: UpdateQueueEntry,
    subscribers: HashSet<SubscriptionId>,
    origins: HashSet<SubscriptionId>,
    coalesced: usize,
}

impl FeedDispatch {
    fn from_entry(entry: UpdateQueueEntry) -> Self {
        let subscribers = entry.subscribers.clone();
        let origins = entry.origins.clone();
        Self {
            latest: entry,
            subscribers,
            origins,
            coalesced: 1,
        }
    }

    fn absorb(&mut self, entry: UpdateQueueEntry) {
        self.subscribers.extend(entry.subscribers.iter().copied());
        self.origins.extend(entry.origins.iter().copied());
        self.coalesced += 1;
        if entry.is_newer_than(&self.latest) {
            self.latest = entry;
        }
    }
}

/// Resets the in-flight flag when a pass ends, even on unwind
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Dispatch tuning taken from the engine config
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub batching_enabled: bool,
    pub max_batch_size: usize,
    /// Errors a subscription may accumulate before it is disabled
    pub error_threshold: u32,
}

/// Drains the update queue and delivers payloads
pub struct BatchDispatcher {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    queue: Arc<Mutex<UpdateQueue>>,
    store: Arc<DataBufferStore>,
    metrics: Arc<MetricsCollector>,
    events: broadcast::Sender<EngineEvent>,
    settings: DispatchSettings,
    in_flight: AtomicBool,
}

impl BatchDispatcher {
    pub fn new(
        registry: Arc<RwLock<SubscriptionRegistry>>,
        queue: Arc<Mutex<UpdateQueue>>,
        store: Arc<DataBufferStore>,
        metrics: Arc<MetricsCollector>,
        events: broadcast::Sender<EngineEvent>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            store,
            metrics,
            events,
            settings: DispatchSettings {
                max_batch_size: settings.max_batch_size.max(1),
                ..settings
            },
            in_flight: AtomicBool::new(false),
        }
    }

    /// Adds an admitted entry to the queue
    pub async fn enqueue(&self, entry: UpdateQueueEntry) {
        self.queue.lock().await.insert(entry);
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Discards every queued entry without dispatching it
    pub async fn discard_pending(&self) -> usize {
        self.queue.lock().await.clear()
    }

    /// Runs dispatch passes until the queue is empty
    ///
    /// # Returns
    /// `false` if another pass was already in flight, in which case that
    /// pass picks up whatever is queued
    pub async fn process(&self) -> bool {
        let mut ran = false;

        loop {
            if self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return ran;
            }
            ran = true;

            {
                let _guard = InFlightGuard(&self.in_flight);
                self.run_pass().await;
            }

            // An entry may have landed between the last drain and the release
            if self.queue.lock().await.is_empty() {
                return ran;
            }
        }
    }

    async fn run_pass(&self) {
        let started = Instant::now();
        let mut processed = 0usize;

        loop {
            let drained = {
                let mut queue = self.queue.lock().await;
                if self.settings.batching_enabled && queue.len() > 1 {
                    queue.dequeue_up_to(self.settings.max_batch_size)
                } else {
                    queue.dequeue_one().into_iter().collect()
                }
            };

            if drained.is_empty() {
                break;
            }
            processed += drained.len();

            for work in group_by_feed(drained) {
                let feed = work.latest.feed.clone();
                if let Err(e) = self.dispatch_feed(work).await {
                    tracing::warn!(feed = %feed, error = %e, "Dispatch completed with failures");
                }
            }
        }

        if processed > 0 {
            let elapsed = started.elapsed();
            self.metrics.record_pass(processed, elapsed).await;
            tracing::debug!(
                entries = processed,
                elapsed_ms = elapsed.as_millis() as u64,
                "Dispatch pass complete"
            );
        }
    }

    /// Writes the buffer and notifies every current target for one feed
    async fn dispatch_feed(&self, work: FeedDispatch) -> Result<usize, EngineError> {
        let FeedDispatch {
            latest,
            subscribers,
            origins,
            coalesced,
        } = work;

        self.store
            .write(&latest.feed, latest.payload.clone(), latest.timestamp, latest.received_at)
            .await;

        let targets = self
            .registry
            .read()
            .await
            .delivery_targets(&subscribers, &origins, &latest.feed, &latest.payload);

        let mut outcomes = Vec::with_capacity(targets.len());
        for (subscription_id, observer) in targets {
            let update = FeedUpdate {
                subscription_id,
                feed: latest.feed.clone(),
                payload: latest.payload.clone(),
                timestamp: latest.received_at,
                coalesced,
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_update(&update)))
                .unwrap_or_else(|panic| Err(DeliveryError::Panicked(panic_message(&*panic))));

            if let Err(e) = &outcome {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    feed = %latest.feed,
                    error = %e,
                    "Delivery failed"
                );
            }
            outcomes.push((subscription_id, outcome.is_ok()));
        }

        let now = Instant::now();
        let disabled: Vec<(SubscriptionId, u32)> = {
            let mut registry = self.registry.write().await;
            outcomes
                .iter()
                .filter_map(|(subscription_id, success)| {
                    registry
                        .record_delivery(
                            subscription_id,
                            *success,
                            now,
                            self.settings.error_threshold,
                        )
                        .map(|error_count| (*subscription_id, error_count))
                })
                .collect()
        };

        for (subscription_id, error_count) in disabled {
            tracing::warn!(
                subscription_id = %subscription_id,
                feed = %latest.feed,
                error_count = error_count,
                "Subscription disabled after repeated delivery failures"
            );
            let _ = self
                .events
                .send(EngineEvent::disabled(subscription_id, &latest.feed, error_count));
        }

        let failed = outcomes.iter().filter(|(_, ok)| !ok).count();
        self.metrics.record_dispatch(failed == 0, now).await;

        if failed > 0 {
            return Err(EngineError::processing(&latest.feed, failed));
        }
        Ok(outcomes.len())
    }
}

/// Folds drained entries into one dispatch per feed, in drain order
fn group_by_feed(entries: Vec<UpdateQueueEntry>) -> Vec<FeedDispatch> {
    let mut order: Vec<FeedDispatch> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        match index.get(&entry.feed) {
            Some(&i) => order[i].absorb(entry),
            None => {
                index.insert(entry.feed.clone(), order.len());
                order.push(FeedDispatch::from_entry(entry));
            }
        }
    }

    order
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
