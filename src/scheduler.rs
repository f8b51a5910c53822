//! Engine control loop
//!
//! One task owns every periodic concern: scanning for due fetches, the
//! staleness sweep and the metrics/alert cycle. Fetches run as separate
//! tasks in a `JoinSet` so a slow source only delays its own subscription;
//! their results are folded back into the engine from the loop.

use crate::{
    config::RetryPolicy,
    engine::EngineCore,
    error::SourceError,
    registry::FetchJob,
    source::FeedSource,
};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};

/// Result of one scheduled fetch
#[derive(Debug)]
pub(crate) struct FetchCompletion {
    pub job: FetchJob,
    pub result: Result<Option<Value>, SourceError>,
}

pub(crate) struct Scheduler {
    core: Arc<EngineCore>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<EngineCore>, shutdown: watch::Receiver<bool>) -> Self {
        Self { core, shutdown }
    }

    /// Runs until the shutdown signal flips or its sender is dropped
    pub(crate) async fn run(mut self) {
        let config = self.core.config().clone();
        let start = Instant::now();

        let mut schedule = interval(config.scheduler_tick());
        schedule.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = interval_at(start + config.cleanup_interval(), config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics = interval_at(start + config.metrics_interval(), config.metrics_interval());
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fetches: JoinSet<FetchCompletion> = JoinSet::new();

        tracing::info!(
            tick_ms = config.scheduler_tick_ms,
            cleanup_interval_ms = config.cleanup_interval_ms,
            metrics_interval_ms = config.metrics_interval_ms,
            "Starting feed engine control loop"
        );

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                    match joined {
                        Ok(done) => self.core.complete_fetch(done).await,
                        Err(e) => tracing::error!(error = %e, "Fetch task failed to join"),
                    }
                }
                _ = schedule.tick() => {
                    self.spawn_due(&mut fetches).await;
                }
                _ = cleanup.tick() => {
                    self.core.run_cleanup().await;
                }
                _ = metrics.tick() => {
                    self.core.run_metrics_cycle().await;
                }
            }
        }

        let aborted = fetches.len();
        fetches.abort_all();
        while fetches.join_next().await.is_some() {}

        tracing::info!(aborted_fetches = aborted, "Feed engine control loop stopped");
    }

    async fn spawn_due(&self, fetches: &mut JoinSet<FetchCompletion>) {
        let jobs = self.core.due_fetches(Instant::now()).await;
        if jobs.is_empty() {
            return;
        }

        tracing::debug!(count = jobs.len(), "Spawning scheduled fetches");

        let config = self.core.config();
        for job in jobs {
            let source = self.core.source();
            let timeout = config.fetch_timeout();
            let retry = config.retry.clone();

            fetches.spawn(async move {
                let result = AssertUnwindSafe(fetch_with_retry(&source, &job, timeout, &retry))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(SourceError::ApiError(format!(
                            "{} panicked while fetching {}",
                            source.source_name(),
                            job.feed
                        )))
                    });
                FetchCompletion { job, result }
            });
        }
    }
}

/// Fetches one payload, bounded by `timeout` per attempt
///
/// Retries with exponential backoff up to `retry.max_attempts` attempts
/// in total.
pub(crate) async fn fetch_with_retry(
    source: &Arc<dyn FeedSource>,
    job: &FetchJob,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Option<Value>, SourceError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut backoff_ms = retry.initial_backoff_ms;
    let started = Instant::now();

    for attempt in 1..=max_attempts {
        let fetch = source.fetch(&job.feed, job.filter.as_ref());
        let result = match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout),
        };

        match result {
            Ok(payload) => {
                tracing::debug!(
                    feed = %job.feed,
                    subscription_id = %job.subscription_id,
                    source = source.source_name(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    has_payload = payload.is_some(),
                    "Fetched feed payload"
                );
                return Ok(payload);
            }
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    feed = %job.feed,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Failed to fetch feed, retrying"
                );
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(retry.max_backoff_ms);
            }
            Err(e) => return Err(e),
        }
    }

    Err(SourceError::InvalidResponse("Max retries exceeded".to_string()))
}
