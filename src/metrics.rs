//! Engine metrics collection and alert evaluation
//!
//! Tracks dispatch outcomes, throughput, batch efficiency and dispatch
//! latency. All counters live behind one lock so a snapshot always satisfies
//! `successful_updates + failed_updates == total_updates`.

use crate::{
    config::AlertThresholds,
    constants::{MAX_SAMPLES, RATE_WINDOW_SECS},
    types::{Alert, AlertKind},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Point-in-time view of engine metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Dispatches recorded (always `successful + failed`)
    pub total_updates: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    /// Updates dropped by the throttle gate
    pub throttled_updates: u64,
    /// Scheduled fetches that failed
    pub fetch_failures: u64,
    /// Dispatches per second over the rolling window
    pub current_rate: f64,
    /// Highest rate observed
    pub peak_rate: f64,
    /// Average age of non-empty buffers, 0 when there are none
    pub average_data_age_ms: f64,
    /// Rolling average of entries processed per second of dispatch pass
    pub batch_efficiency: f64,
    pub subscription_count: usize,
    pub active_subscription_count: usize,
    pub queue_length: usize,
    pub dispatch_latency_p50_ms: f64,
    pub dispatch_latency_p99_ms: f64,
    /// Fraction of successful dispatches (1.0 with no data)
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Values the collector does not own, sampled by the engine
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub queue_length: usize,
    pub subscription_count: usize,
    pub active_subscription_count: usize,
    pub average_data_age: Option<Duration>,
}

#[derive(Debug)]
struct MetricsState {
    started_at: Instant,
    successful: u64,
    failed: u64,
    throttled: u64,
    fetch_failures: u64,
    /// Dispatch times within the rate window
    dispatch_times: VecDeque<Instant>,
    peak_rate: f64,
    /// Entries per second, one sample per pass
    efficiency_samples: VecDeque<f64>,
    /// Pass duration in milliseconds, one sample per pass
    latency_samples: VecDeque<f64>,
}

/// Collects and computes engine metrics
pub struct MetricsCollector {
    state: RwLock<MetricsState>,
    rate_window: Duration,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MetricsState {
                started_at: Instant::now(),
                successful: 0,
                failed: 0,
                throttled: 0,
                fetch_failures: 0,
                dispatch_times: VecDeque::new(),
                peak_rate: 0.0,
                efficiency_samples: VecDeque::with_capacity(MAX_SAMPLES),
                latency_samples: VecDeque::with_capacity(MAX_SAMPLES),
            }),
            rate_window: Duration::from_secs(RATE_WINDOW_SECS),
        }
    }

    /// Records the outcome of one feed dispatch
    pub async fn record_dispatch(&self, success: bool, now: Instant) {
        let mut state = self.state.write().await;
        if success {
            state.successful += 1;
        } else {
            state.failed += 1;
        }
        state.dispatch_times.push_back(now);
        self.purge_expired(&mut state, now);
    }

    /// Records an update dropped by the throttle gate
    pub async fn record_throttled(&self) {
        self.state.write().await.throttled += 1;
    }

    /// Records a scheduled fetch that failed
    pub async fn record_fetch_failure(&self) {
        self.state.write().await.fetch_failures += 1;
    }

    /// Records a completed dispatch pass
    pub async fn record_pass(&self, entries: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(1e-6);
        let efficiency = entries as f64 / secs;
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        let mut state = self.state.write().await;
        push_sample(&mut state.efficiency_samples, efficiency);
        push_sample(&mut state.latency_samples, latency_ms);
    }

    /// Recomputes rolling values and returns the refreshed snapshot
    ///
    /// Called on the metrics cadence; purges old dispatch times and updates
    /// the peak rate.
    pub async fn refresh(&self, now: Instant, gauges: Gauges) -> MetricsSnapshot {
        let mut state = self.state.write().await;
        self.purge_expired(&mut state, now);

        let rate = self.current_rate(&state, now);
        if rate > state.peak_rate {
            state.peak_rate = rate;
        }

        self.build_snapshot(&state, now, gauges)
    }

    /// Computes a snapshot without mutating any rolling state
    pub async fn snapshot(&self, now: Instant, gauges: Gauges) -> MetricsSnapshot {
        let state = self.state.read().await;
        self.build_snapshot(&state, now, gauges)
    }

    /// Drops dispatch times that fell out of the rate window
    fn purge_expired(&self, state: &mut MetricsState, now: Instant) {
        while let Some(oldest) = state.dispatch_times.front() {
            if now.saturating_duration_since(*oldest) > self.rate_window {
                state.dispatch_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn current_rate(&self, state: &MetricsState, now: Instant) -> f64 {
        let in_window = state
            .dispatch_times
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= self.rate_window)
            .count();

        // Young engines divide by their lifetime, not the full window
        let span = now
            .saturating_duration_since(state.started_at)
            .min(self.rate_window)
            .max(Duration::from_secs(1));

        in_window as f64 / span.as_secs_f64()
    }

    fn build_snapshot(
        &self,
        state: &MetricsState,
        now: Instant,
        gauges: Gauges,
    ) -> MetricsSnapshot {
        let total = state.successful + state.failed;
        let current_rate = self.current_rate(state, now);

        let mut latencies: Vec<f64> = state.latency_samples.iter().copied().collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let batch_efficiency = if state.efficiency_samples.is_empty() {
            0.0
        } else {
            state.efficiency_samples.iter().sum::<f64>() / state.efficiency_samples.len() as f64
        };

        let success_rate = if total > 0 {
            state.successful as f64 / total as f64
        } else {
            1.0
        };

        MetricsSnapshot {
            total_updates: total,
            successful_updates: state.successful,
            failed_updates: state.failed,
            throttled_updates: state.throttled,
            fetch_failures: state.fetch_failures,
            current_rate,
            peak_rate: state.peak_rate.max(current_rate),
            average_data_age_ms: gauges
                .average_data_age
                .map(|age| age.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            batch_efficiency,
            subscription_count: gauges.subscription_count,
            active_subscription_count: gauges.active_subscription_count,
            queue_length: gauges.queue_length,
            dispatch_latency_p50_ms: percentile(&latencies, 50.0),
            dispatch_latency_p99_ms: percentile(&latencies, 99.0),
            success_rate,
            timestamp: Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &mut VecDeque<f64>, value: f64) {
    if samples.len() >= MAX_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(value);
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

/// Checks a snapshot against the alert thresholds
///
/// Success rate is only judged once something was dispatched, and the
/// update rate only while there are active subscriptions.
pub fn evaluate_alerts(snapshot: &MetricsSnapshot, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let now = Utc::now();

    if snapshot.total_updates > 0 && snapshot.success_rate < thresholds.min_success_rate {
        alerts.push(Alert {
            kind: AlertKind::LowSuccessRate,
            message: format!(
                "Success rate {:.1}% below {:.1}%",
                snapshot.success_rate * 100.0,
                thresholds.min_success_rate * 100.0
            ),
            value: snapshot.success_rate,
            threshold: thresholds.min_success_rate,
            timestamp: now,
        });
    }

    if snapshot.active_subscription_count > 0
        && snapshot.current_rate < thresholds.min_update_rate
    {
        alerts.push(Alert {
            kind: AlertKind::LowUpdateRate,
            message: format!(
                "Update rate {:.2}/s below {:.2}/s",
                snapshot.current_rate, thresholds.min_update_rate
            ),
            value: snapshot.current_rate,
            threshold: thresholds.min_update_rate,
            timestamp: now,
        });
    }

    if snapshot.queue_length > thresholds.max_queue_length {
        alerts.push(Alert {
            kind: AlertKind::QueueBacklog,
            message: format!(
                "Queue length {} above {}",
                snapshot.queue_length, thresholds.max_queue_length
            ),
            value: snapshot.queue_length as f64,
            threshold: thresholds.max_queue_length as f64,
            timestamp: now,
        });
    }

    if snapshot.average_data_age_ms > thresholds.max_average_data_age_ms as f64 {
        alerts.push(Alert {
            kind: AlertKind::StaleData,
            message: format!(
                "Average data age {:.0}ms above {}ms",
                snapshot.average_data_age_ms, thresholds.max_average_data_age_ms
            ),
            value: snapshot.average_data_age_ms,
            threshold: thresholds.max_average_data_age_ms as f64,
            timestamp: now,
        });
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_metrics_collector() {
        let collector = MetricsCollector::new();
        let now = Instant::now();

        collector.record_dispatch(true, now).await;
        collector.record_dispatch(true, now).await;
        collector.record_dispatch(false, now).await;
        collector.record_throttled().await;
        collector.record_fetch_failure().await;

        let metrics = collector.snapshot(now, Gauges::default()).await;

        assert_eq!(metrics.total_updates, 3);
        assert_eq!(metrics.failed_updates, 1);
        assert_eq!(
            metrics.total_updates,
            metrics.successful_updates + metrics.failed_updates
        );
        assert_eq!(metrics.throttled_updates, 1);
        assert_eq!(metrics.fetch_failures, 1);
        assert!(metrics.success_rate > 0.6 && metrics.success_rate < 0.7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_stay_bounded_without_refresh() {
        let collector = MetricsCollector::new();
        let start = Instant::now();

        for i in 0..10_000u64 {
            collector
                .record_dispatch(true, start + Duration::from_secs(i))
                .await;
        }

        let state = collector.state.read().await;
        assert!(state.dispatch_times.len() <= RATE_WINDOW_SECS as usize + 1);
        assert_eq!(state.successful, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_and_peak() {
        let collector = MetricsCollector::new();
        let start = Instant::now();

        for _ in 0..120 {
            collector.record_dispatch(true, start).await;
        }

        // 120 dispatches over a 1s-old engine
        let early = collector.refresh(start, Gauges::default()).await;
        assert_eq!(early.current_rate, 120.0);

        let mid = collector
            .refresh(start + Duration::from_secs(30), Gauges::default())
            .await;
        assert_eq!(mid.current_rate, 4.0);
        assert_eq!(mid.peak_rate, 120.0);

        let late = collector
            .refresh(start + Duration::from_secs(61), Gauges::default())
            .await;
        assert_eq!(late.current_rate, 0.0);
        assert_eq!(late.peak_rate, 120.0);
        assert_eq!(late.total_updates, 120);
    }

    #[tokio::test]
    async fn test_batch_efficiency_rolling_average() {
        let collector = MetricsCollector::new();
        collector.record_pass(10, Duration::from_millis(100)).await;
        collector.record_pass(2, Duration::from_millis(100)).await;

        let metrics = collector.snapshot(Instant::now(), Gauges::default()).await;
        assert!((metrics.batch_efficiency - 60.0).abs() < 1e-9);
        assert!((metrics.dispatch_latency_p99_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 50.0), 5.0);
        assert_eq!(percentile(&values, 99.0), 10.0);
    }

    fn healthy_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            total_updates: 100,
            successful_updates: 100,
            failed_updates: 0,
            throttled_updates: 0,
            fetch_failures: 0,
            current_rate: 5.0,
            peak_rate: 5.0,
            average_data_age_ms: 1_000.0,
            batch_efficiency: 0.0,
            subscription_count: 1,
            active_subscription_count: 1,
            queue_length: 0,
            dispatch_latency_p50_ms: 0.0,
            dispatch_latency_p99_ms: 0.0,
            success_rate: 1.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_alert_thresholds() {
        let thresholds = AlertThresholds::default();
        assert!(evaluate_alerts(&healthy_snapshot(), &thresholds).is_empty());

        let mut snapshot = healthy_snapshot();
        snapshot.success_rate = 0.5;
        snapshot.current_rate = 0.2;
        snapshot.queue_length = 101;
        snapshot.average_data_age_ms = 31_000.0;

        let kinds: Vec<AlertKind> = evaluate_alerts(&snapshot, &thresholds)
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::LowSuccessRate,
                AlertKind::LowUpdateRate,
                AlertKind::QueueBacklog,
                AlertKind::StaleData,
            ]
        );
    }

    #[test]
    fn test_idle_engine_raises_no_rate_alert() {
        let mut snapshot = healthy_snapshot();
        snapshot.total_updates = 0;
        snapshot.success_rate = 0.0;
        snapshot.current_rate = 0.0;
        snapshot.active_subscription_count = 0;

        assert!(evaluate_alerts(&snapshot, &AlertThresholds::default()).is_empty());
    }
}
